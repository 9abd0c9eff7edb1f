use serde::{Deserialize, Serialize};

use crate::types::{DataType, Value};

/// 一行数据即值向量
pub type Row = Vec<Value>;

/// 结果集的列元信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self { name: name.into().to_lowercase(), data_type }
    }
}

/// 外部执行器返回的行式结果
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbmsQueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
}

impl DbmsQueryResult {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// 按列名（不区分大小写）查找列下标
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let name = name.to_lowercase();
        self.columns.iter().position(|c| c.name == name)
    }

    /// 取第一行第一列，统计查询（count(*)）常用
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let result = DbmsQueryResult::new(
            vec![ColumnMeta::new("CNT", DataType::Integer)],
            vec![vec![Value::Integer(42)]],
        );
        assert_eq!(result.column_index("cnt"), Some(0));
        assert_eq!(result.scalar(), Some(&Value::Integer(42)));
        assert_eq!(result.row_count(), 1);
    }
}
