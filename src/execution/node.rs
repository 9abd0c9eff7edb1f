use tracing::debug;
use tsid::create_tsid;

use crate::connection::DbmsConnection;
use crate::db_error::Result;
use crate::errplan;
use crate::execution::combiner::combine_query;
use crate::execution::token::{AggMeta, ExecutionInfoToken, TokenValue, ROWS_KEY, UPDATE_KEY};
use crate::sql::{SelectQuery, SqlWriter, Statement};
use crate::types::TableName;

/// 计划节点在 DAG 中的下标
pub type NodeId = usize;

/// 节点种类，集合是封闭的
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// 查询，结果集放入令牌
    Select { query: SelectQuery, agg_meta: Option<AggMeta> },
    /// create table as select，`target` 为空时在中间表 schema 下生成临时表名
    CreateTable { query: SelectQuery, target: Option<TableName>, agg_meta: Option<AggMeta> },
    /// 合并两个上游的部分聚合结果，结果物化成临时表
    AggCombiner,
    /// 删除第 `slot` 个上游产生的表
    DropTable { slot: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutableNode {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// 上游节点，顺序即占位表的 slot
    pub upstream: Vec<NodeId>,
}

impl ExecutableNode {
    /// 占位表数量与上游数量是否匹配
    pub fn validate(&self) -> Result<()> {
        let slots = self.upstream.len();
        match &self.kind {
            NodeKind::Select { query, .. } | NodeKind::CreateTable { query, .. } => {
                if query.placeholder_count() > slots {
                    return Err(errplan!(
                        "node {} references {} placeholder tables but subscribes to {slots} nodes",
                        self.name,
                        query.placeholder_count()
                    ));
                }
            }
            NodeKind::AggCombiner if slots != 2 => {
                return Err(errplan!("combiner {} needs exactly two upstream nodes, got {slots}", self.name));
            }
            NodeKind::DropTable { slot } if *slot >= slots => {
                return Err(errplan!("drop node {} has no upstream slot {slot}", self.name));
            }
            _ => {}
        }
        Ok(())
    }

    /// 是否把结果推送给进度通道
    pub fn reports_progress(&self) -> bool {
        match &self.kind {
            NodeKind::AggCombiner => true,
            NodeKind::Select { agg_meta, .. } | NodeKind::CreateTable { agg_meta, .. } => agg_meta.is_some(),
            NodeKind::DropTable { .. } => false,
        }
    }

    /// 执行节点：替换占位表、渲染语句、交给外部执行器，再把结果包装成令牌
    ///
    /// 调用会阻塞在外部执行器上。
    pub fn execute(
        &self,
        conn: &dyn DbmsConnection,
        upstream: &[ExecutionInfoToken],
        scratchpad_schema: &str,
    ) -> Result<ExecutionInfoToken> {
        let writer = SqlWriter::new(conn.syntax());
        match &self.kind {
            NodeKind::Select { query, agg_meta } => {
                let query = query.resolve_placeholders(&upstream_tables(query, upstream)?)?;
                let sql = writer.select(&query)?;
                debug!("节点 {} 执行查询: {sql}", self.name);
                let rows = conn.query(&sql)?;
                let mut token = ExecutionInfoToken::new().with_agg_meta(inherit(agg_meta, upstream));
                token.set(ROWS_KEY, TokenValue::Rows(rows));
                Ok(token)
            }
            NodeKind::CreateTable { query, target, agg_meta } => {
                let table = target.clone().unwrap_or_else(|| scratch_table(scratchpad_schema));
                let query = query.resolve_placeholders(&upstream_tables(query, upstream)?)?;
                self.create_table(conn, &writer, table, query, inherit(agg_meta, upstream))
            }
            NodeKind::AggCombiner => {
                let [left, right] = upstream else {
                    return Err(errplan!("combiner {} needs exactly two upstream tokens", self.name));
                };
                let (query, meta) = combine_query(left, right)?;
                let query = query.resolve_placeholders(&upstream_tables(&query, upstream)?)?;
                self.create_table(conn, &writer, scratch_table(scratchpad_schema), query, meta)
            }
            NodeKind::DropTable { slot } => {
                let table = upstream
                    .get(*slot)
                    .and_then(ExecutionInfoToken::table)
                    .ok_or_else(|| errplan!("drop node {} has no upstream table in slot {slot}", self.name))?;
                let sql = writer.statement(&Statement::DropTable { table: table.clone(), if_exists: true })?;
                debug!("节点 {} 删除表: {sql}", self.name);
                let outcome = conn.execute(&sql)?;
                let mut token = ExecutionInfoToken::new();
                if let crate::connection::ExecutionOutcome::Update(n) = outcome {
                    token.set(UPDATE_KEY, TokenValue::UpdateCount(n));
                }
                Ok(token)
            }
        }
    }

    fn create_table(
        &self,
        conn: &dyn DbmsConnection,
        writer: &SqlWriter,
        table: TableName,
        query: SelectQuery,
        agg_meta: Option<AggMeta>,
    ) -> Result<ExecutionInfoToken> {
        let sql = writer.statement(&Statement::CreateTableAs { table: table.clone(), query })?;
        debug!("节点 {} 创建表: {sql}", self.name);
        conn.execute(&sql)?;
        Ok(ExecutionInfoToken::new().with_table(table).with_agg_meta(agg_meta))
    }
}

/// 节点自己的 AggMeta 优先，否则继承第一个带 AggMeta 的上游
fn inherit(own: &Option<AggMeta>, upstream: &[ExecutionInfoToken]) -> Option<AggMeta> {
    own.clone().or_else(|| upstream.iter().find_map(|t| t.agg_meta().cloned()))
}

/// 查询引用到的占位表对应的上游表名，占位表编号从 0 开始连续
fn upstream_tables(query: &SelectQuery, upstream: &[ExecutionInfoToken]) -> Result<Vec<TableName>> {
    upstream
        .iter()
        .take(query.placeholder_count())
        .enumerate()
        .map(|(slot, token)| {
            token.table().cloned().ok_or_else(|| errplan!("upstream token in slot {slot} carries no table"))
        })
        .collect()
}

/// 中间表名，`verdictdbtemptable_<tsid>`
pub fn scratch_table(schema: &str) -> TableName {
    TableName::new(schema, format!("verdictdbtemptable_{}", create_tsid().number()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DryRunConnection;
    use crate::sql::{Dialect, Relation};

    fn node(kind: NodeKind, upstream: Vec<NodeId>) -> ExecutableNode {
        ExecutableNode { id: 9, name: "n".into(), kind, upstream }
    }

    #[test]
    fn test_create_table_with_placeholder() -> Result<()> {
        let conn = DryRunConnection::new(Dialect::Postgres);
        let query = SelectQuery::star(Relation::Placeholder { slot: 0, alias: "p".into() });
        let n = node(NodeKind::CreateTable { query, target: None, agg_meta: None }, vec![0]);
        n.validate()?;

        let upstream = vec![ExecutionInfoToken::new().with_table(TableName::new("tmp", "src"))];
        let token = n.execute(&conn, &upstream, "scratch")?;
        let table = token.table().cloned().unwrap();
        assert_eq!(table.schema, "scratch");
        assert!(table.table.starts_with("verdictdbtemptable_"));
        let statements = conn.statements()?;
        assert!(statements[0].ends_with("as select * from \"tmp\".\"src\" as \"p\""));
        Ok(())
    }

    #[test]
    fn test_missing_upstream_table() {
        let conn = DryRunConnection::new(Dialect::Postgres);
        let n = node(NodeKind::DropTable { slot: 0 }, vec![0]);
        assert!(n.execute(&conn, &[ExecutionInfoToken::new()], "tmp").is_err());
        assert!(node(NodeKind::DropTable { slot: 1 }, vec![0]).validate().is_err());
        assert!(node(NodeKind::AggCombiner, vec![0]).validate().is_err());
    }

    #[test]
    fn test_executor_error_propagates() -> Result<()> {
        let conn = DryRunConnection::new(Dialect::Postgres);
        conn.fail_on("drop table")?;
        let n = node(NodeKind::DropTable { slot: 0 }, vec![0]);
        let upstream = vec![ExecutionInfoToken::new().with_table(TableName::new("tmp", "x"))];
        let err = n.execute(&conn, &upstream, "tmp").unwrap_err();
        assert!(matches!(err, crate::db_error::Error::ExecutionError(_)));
        Ok(())
    }
}
