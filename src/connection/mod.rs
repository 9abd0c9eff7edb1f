//! 外部执行器接口
//!
//! 本系统只生成 SQL 文本，真正的执行交给实现了 [`DbmsConnection`] 的外部组件。
//! 执行器的任何错误都以 `Error::ExecutionError` 返回，对发出该语句的节点是致命的。

mod dry_run;

pub use dry_run::DryRunConnection;

use crate::db_error::Result;
use crate::sql::SqlSyntax;
use crate::types::DbmsQueryResult;

/// 一次执行的结果：DDL/DML 返回影响行数，查询返回结果集
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Update(u64),
    Rows(DbmsQueryResult),
}

impl ExecutionOutcome {
    pub fn into_rows(self) -> Option<DbmsQueryResult> {
        match self {
            ExecutionOutcome::Rows(rows) => Some(rows),
            ExecutionOutcome::Update(_) => None,
        }
    }
}

/// 数据库连接
///
/// 调用是阻塞的，计划执行器会把它放到阻塞线程池中运行，
/// 所以实现必须可以跨线程共享。
pub trait DbmsConnection: Send + Sync {
    /// 当前连接使用的方言
    fn syntax(&self) -> &dyn SqlSyntax;

    /// 执行一条完整渲染好的语句
    fn execute(&self, sql: &str) -> Result<ExecutionOutcome>;

    /// 执行查询，要求返回结果集
    fn query(&self, sql: &str) -> Result<DbmsQueryResult> {
        match self.execute(sql)? {
            ExecutionOutcome::Rows(rows) => Ok(rows),
            ExecutionOutcome::Update(_) => Ok(DbmsQueryResult::default()),
        }
    }
}
