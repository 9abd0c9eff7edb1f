use std::sync::Mutex;

use tracing::debug;

use crate::connection::{DbmsConnection, ExecutionOutcome};
use crate::db_error::{Error, Result};
use crate::sql::{Dialect, SqlSyntax};
use crate::types::DbmsQueryResult;

/// 不连接真实数据库的执行器
///
/// 记录每一条收到的语句；查询语句按照注册顺序匹配脚本化的结果，
/// 没有匹配时返回空结果集。可以注册一个失败模式，用来模拟执行器错误。
pub struct DryRunConnection {
    syntax: Box<dyn SqlSyntax>,
    statements: Mutex<Vec<String>>,
    // (语句片段, 结果)，第一个命中的片段生效
    scripted: Mutex<Vec<(String, DbmsQueryResult)>>,
    failures: Mutex<Vec<String>>,
}

impl DryRunConnection {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            syntax: dialect.syntax(),
            statements: Mutex::new(Vec::new()),
            scripted: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// 包含 `fragment` 的查询返回 `result`
    pub fn script(&self, fragment: impl Into<String>, result: DbmsQueryResult) -> Result<()> {
        self.scripted.lock()?.push((fragment.into(), result));
        Ok(())
    }

    /// 包含 `fragment` 的语句执行失败
    pub fn fail_on(&self, fragment: impl Into<String>) -> Result<()> {
        self.failures.lock()?.push(fragment.into());
        Ok(())
    }

    /// 到目前为止执行过的全部语句
    pub fn statements(&self) -> Result<Vec<String>> {
        Ok(self.statements.lock()?.clone())
    }
}

impl DbmsConnection for DryRunConnection {
    fn syntax(&self) -> &dyn SqlSyntax {
        self.syntax.as_ref()
    }

    fn execute(&self, sql: &str) -> Result<ExecutionOutcome> {
        debug!("dry run: {sql}");
        self.statements.lock()?.push(sql.to_string());
        if let Some(fragment) = self.failures.lock()?.iter().find(|f| sql.contains(f.as_str())) {
            return Err(Error::ExecutionError(format!("scripted failure on '{fragment}'")));
        }
        let lower = sql.trim_start().to_lowercase();
        if !lower.starts_with("select") {
            return Ok(ExecutionOutcome::Update(0));
        }
        let scripted = self.scripted.lock()?;
        let result = scripted
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default();
        Ok(ExecutionOutcome::Rows(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnMeta, DataType, Value};

    #[test]
    fn test_scripted_results() -> Result<()> {
        let conn = DryRunConnection::new(Dialect::Postgres);
        conn.script(
            "count(*)",
            DbmsQueryResult::new(vec![ColumnMeta::new("c", DataType::Integer)], vec![vec![Value::Integer(7)]]),
        )?;
        conn.fail_on("drop table")?;

        let rows = conn.query("select count(*) from t")?;
        assert_eq!(rows.scalar(), Some(&Value::Integer(7)));
        assert_eq!(conn.execute("create table x as select 1")?, ExecutionOutcome::Update(0));
        assert!(matches!(conn.execute("drop table x"), Err(Error::ExecutionError(_))));
        assert_eq!(conn.statements()?.len(), 3);
        Ok(())
    }
}
