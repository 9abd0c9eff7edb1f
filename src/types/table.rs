use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// 表的全局唯一标识：(schema, table)
///
/// 构造时统一转为小写，所有元数据映射都以它为键。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl AsRef<str>, table: impl AsRef<str>) -> Self {
        Self {
            schema: schema.as_ref().trim().to_lowercase(),
            table: table.as_ref().trim().to_lowercase(),
        }
    }

    /// 解析 `schema.table`，没有 schema 时使用 `default_schema`
    pub fn parse(name: &str, default_schema: &str) -> Self {
        match name.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(default_schema, name),
        }
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}
