//! 执行计划的并发运行器。
//!
//! 每条订阅边是一个 oneshot 通道：上游执行成功后把令牌发给所有订阅者，
//! 失败时直接丢弃发送端，下游因此收到错误并同样丢弃自己的发送端，失败沿 DAG 向下传播。
//! 就绪的节点通过信号量获取 worker，阻塞的外部执行器调用放在阻塞线程池中。
//!
//! 取消只阻止尚未开始的节点，已经发出的外部调用会正常完成；
//! 已经创建的中间表不会被自动删除。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::DbmsConnection;
use crate::db_error::{Error, Result};
use crate::errplan;
use crate::execution::node::{ExecutableNode, NodeId};
use crate::execution::plan::ExecutionPlan;
use crate::execution::token::ExecutionInfoToken;

/// 进度通道中的一条消息
#[derive(Clone, Debug)]
pub struct Progress {
    pub node: NodeId,
    pub name: String,
    pub token: ExecutionInfoToken,
}

/// 取消句柄，可以在运行期间从任意任务调用
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        info!("请求取消计划执行");
        self.tx.send_replace(true);
    }
}

/// 节点失败的原因，上游失败不是根因
enum NodeFailure {
    Upstream,
    Failed(Error),
}

pub struct PlanRunner {
    conn: Arc<dyn DbmsConnection>,
    workers: Arc<Semaphore>,
    scratchpad_schema: String,
    progress: Option<mpsc::UnboundedSender<Progress>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl PlanRunner {
    pub fn new(conn: Arc<dyn DbmsConnection>, worker_count: usize, scratchpad_schema: impl Into<String>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            conn,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
            scratchpad_schema: scratchpad_schema.into(),
            progress: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// 聚合节点和合并节点完成时把令牌推送到返回的通道
    pub fn subscribe_progress(&mut self) -> mpsc::UnboundedReceiver<Progress> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress = Some(tx);
        rx
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { tx: self.cancel_tx.clone() }
    }

    /// 运行整个计划，返回根节点的令牌
    ///
    /// 取消只作用于当前这次运行，结束后取消标记被清除，运行器可以继续使用。
    pub async fn run(&self, plan: &ExecutionPlan) -> Result<ExecutionInfoToken> {
        let result = self.run_plan(plan).await;
        self.cancel_tx.send_replace(false);
        result
    }

    async fn run_plan(&self, plan: &ExecutionPlan) -> Result<ExecutionInfoToken> {
        let root = plan.root().ok_or_else(|| errplan!("execution plan has no nodes"))?;
        info!("开始执行计划，共 {} 个节点，根节点 {root}", plan.len());

        // 先登记所有订阅，再启动任何节点
        let mut senders: Vec<Vec<oneshot::Sender<ExecutionInfoToken>>> = plan.nodes().iter().map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<oneshot::Receiver<ExecutionInfoToken>>> = Vec::with_capacity(plan.len());
        for node in plan.nodes() {
            let mut slots = Vec::with_capacity(node.upstream.len());
            for upstream in &node.upstream {
                let (tx, rx) = oneshot::channel();
                senders[*upstream].push(tx);
                slots.push(rx);
            }
            receivers.push(slots);
        }
        let (root_tx, root_rx) = oneshot::channel();
        senders[root].push(root_tx);

        let mut handles: Vec<JoinHandle<std::result::Result<(), NodeFailure>>> = Vec::with_capacity(plan.len());
        for ((node, inbox), outbox) in plan.nodes().iter().zip(receivers).zip(senders) {
            handles.push(tokio::spawn(run_node(
                Arc::new(node.clone()),
                inbox,
                outbox,
                self.conn.clone(),
                self.workers.clone(),
                self.scratchpad_schema.clone(),
                self.progress.clone(),
                self.cancel_rx.clone(),
            )));
        }

        // 按节点编号收集第一个根因错误
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) | Ok(Err(NodeFailure::Upstream)) => {}
                Ok(Err(NodeFailure::Failed(e))) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::from(e));
                }
            }
        }
        if let Some(e) = first_error {
            warn!("计划执行失败: {e}");
            return Err(e);
        }
        let token = root_rx.await.map_err(|_| errplan!("root node {root} produced no token"))?;
        info!("计划执行完成");
        Ok(token)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_node(
    node: Arc<ExecutableNode>,
    inbox: Vec<oneshot::Receiver<ExecutionInfoToken>>,
    outbox: Vec<oneshot::Sender<ExecutionInfoToken>>,
    conn: Arc<dyn DbmsConnection>,
    workers: Arc<Semaphore>,
    scratchpad_schema: String,
    progress: Option<mpsc::UnboundedSender<Progress>>,
    cancel: watch::Receiver<bool>,
) -> std::result::Result<(), NodeFailure> {
    // 1、等待所有上游令牌
    let mut tokens = Vec::with_capacity(inbox.len());
    for rx in inbox {
        match rx.await {
            Ok(token) => tokens.push(token),
            Err(_) => {
                debug!("节点 {} 的上游失败，跳过执行", node.name);
                return Err(NodeFailure::Upstream);
            }
        }
    }

    // 2、获取 worker，取消后不再派发新节点
    if *cancel.borrow() {
        return Err(NodeFailure::Failed(Error::Cancelled));
    }
    let _permit = workers
        .acquire_owned()
        .await
        .map_err(|e| NodeFailure::Failed(Error::ExecutionError(e.to_string())))?;
    if *cancel.borrow() {
        return Err(NodeFailure::Failed(Error::Cancelled));
    }

    // 3、阻塞调用外部执行器
    debug!("派发节点 {} ({})", node.id, node.name);
    let worker_node = node.clone();
    let token = tokio::task::spawn_blocking(move || worker_node.execute(conn.as_ref(), &tokens, &scratchpad_schema))
        .await
        .map_err(|e| NodeFailure::Failed(Error::from(e)))?
        .map_err(NodeFailure::Failed)?;
    debug!("节点 {} 执行完成", node.name);

    // 4、填充下游订阅
    if let (Some(progress), true) = (&progress, node.reports_progress()) {
        let _ = progress.send(Progress { node: node.id, name: node.name.clone(), token: token.clone() });
    }
    for tx in outbox {
        // 下游已经失败时接收端会被丢弃
        let _ = tx.send(token.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DryRunConnection;
    use crate::execution::token::{AggColumn, AggMeta};
    use crate::sql::parser::ast::{AggFunction, Expression};
    use crate::sql::{Dialect, Relation, SelectItem, SelectQuery};
    use crate::types::{ColumnMeta, DataType, DbmsQueryResult, TableName, Value};

    fn partial_query(table: &str) -> SelectQuery {
        SelectQuery::new(
            vec![
                SelectItem::aliased(Expression::column(Some("t"), "dow"), "dow"),
                SelectItem::aliased(Expression::agg(AggFunction::Count, Expression::All), "cnt"),
            ],
            Relation::base(TableName::new("s", table), Some("t")),
        )
    }

    fn meta() -> AggMeta {
        AggMeta {
            group_aliases: vec!["dow".into()],
            aggregates: vec![AggColumn::new("cnt", AggFunction::Count)],
            ..Default::default()
        }
    }

    fn combine_plan() -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan::new();
        let a = plan.create_table("part a", partial_query("a"), None, Some(meta()), &[])?;
        let b = plan.create_table("part b", partial_query("b"), None, Some(meta()), &[])?;
        let c = plan.combine("combine", a, b)?;
        let root = SelectQuery::star(Relation::Placeholder { slot: 0, alias: "r".into() });
        plan.select("root", root, None, &[c])?;
        Ok(plan)
    }

    #[tokio::test]
    async fn test_run_plan() -> Result<()> {
        let conn = Arc::new(DryRunConnection::new(Dialect::Postgres));
        conn.script(
            "select * from",
            DbmsQueryResult::new(vec![ColumnMeta::new("dow", DataType::Integer)], vec![vec![Value::Integer(1)]]),
        )?;
        let mut runner = PlanRunner::new(conn.clone(), 2, "tmp");
        let mut progress = runner.subscribe_progress();
        let token = runner.run(&combine_plan()?).await?;

        assert_eq!(token.rows().map(|r| r.row_count()), Some(1));
        // 根节点继承了合并节点的 AggMeta
        assert_eq!(token.agg_meta(), Some(&meta()));

        let statements = conn.statements()?;
        assert_eq!(statements.len(), 4);
        // 合并节点一定在两个分区之后执行
        assert!(statements[2].contains("union all"));
        assert!(statements[3].starts_with("select * from \"tmp\".\"verdictdbtemptable_"));

        let mut reported = Vec::new();
        while let Ok(p) = progress.try_recv() {
            reported.push(p.name);
        }
        reported.sort();
        assert_eq!(reported, vec!["combine", "part a", "part b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_aborts_plan() -> Result<()> {
        let conn = Arc::new(DryRunConnection::new(Dialect::Postgres));
        conn.fail_on("\"s\".\"b\"")?;
        let runner = PlanRunner::new(conn.clone(), 4, "tmp");
        let err = runner.run(&combine_plan()?).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionError(_)));
        // 合并节点和根节点都没有执行
        assert!(conn.statements()?.iter().all(|s| !s.contains("union all")));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_before_run() -> Result<()> {
        let conn = Arc::new(DryRunConnection::new(Dialect::Postgres));
        let runner = PlanRunner::new(conn.clone(), 1, "tmp");
        runner.cancel_handle().cancel();
        let err = runner.run(&combine_plan()?).await.unwrap_err();
        assert_eq!(err, Error::Cancelled);
        assert!(conn.statements()?.is_empty());

        // 下一次运行不受上一次取消的影响
        runner.run(&combine_plan()?).await?;
        assert_eq!(conn.statements()?.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let conn = Arc::new(DryRunConnection::new(Dialect::Postgres));
        let runner = PlanRunner::new(conn, 1, "tmp");
        assert!(runner.run(&ExecutionPlan::new()).await.is_err());
    }
}
