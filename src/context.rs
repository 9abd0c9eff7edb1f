use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::aggresult::AggregateFrame;
use crate::cfg::{watch_config, Config, SharedConfig};
use crate::connection::DbmsConnection;
use crate::db_error::{Error, Result};
use crate::errplan;
use crate::execution::{ExecutionPlan, OlaPlanBuilder, OlaQuery, PlanRunner};
use crate::relation::{ApproxRewriter, RelationTree};
use crate::scramble::{ScrambleMetaSet, ScramblingCoordinator};
use crate::sql::parser::ast::SelectStatement;
use crate::sql::parser::SqlParser;
use crate::sql::{Relation, SelectQuery, SqlWriter};
use crate::types::DbmsQueryResult;

/// 一个会话：配置、scramble 目录和外部执行器
///
/// 目录在会话内共享，scramble 完成后追加，改写查询时并发读取。
#[derive(Clone)]
pub struct AqpContext {
    config: SharedConfig,
    catalog: ScrambleMetaSet,
    conn: Arc<dyn DbmsConnection>,
}

impl AqpContext {
    pub fn new(config: Config, conn: Arc<dyn DbmsConnection>) -> Self {
        Self { config: Arc::new(RwLock::new(config)), catalog: ScrambleMetaSet::new(), conn }
    }

    pub fn with_catalog(mut self, catalog: ScrambleMetaSet) -> Self {
        self.catalog = catalog;
        self
    }

    /// 当前配置的快照
    pub fn config(&self) -> Result<Config> {
        Ok(self.config.read()?.clone())
    }

    pub fn shared_config(&self) -> SharedConfig {
        self.config.clone()
    }

    pub fn catalog(&self) -> &ScrambleMetaSet {
        &self.catalog
    }

    pub fn connection(&self) -> Arc<dyn DbmsConnection> {
        self.conn.clone()
    }

    /// 配置文件变化时更新本会话的配置
    pub fn watch_config(&self, path: PathBuf, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        watch_config(path, self.config.clone(), shutdown)
    }

    pub fn coordinator(&self) -> Result<ScramblingCoordinator> {
        Ok(ScramblingCoordinator::new(self.conn.clone(), self.catalog.clone(), self.config()?))
    }

    /// 把查询改写成读取 scramble 的近似查询，没有可用 scramble 时原样返回
    pub fn rewrite(&self, stmt: &SelectStatement) -> Result<SelectQuery> {
        let config = self.config()?;
        let (tree, root) = RelationTree::from_select(stmt, self.conn.syntax().fallback_default_schema())?;
        let approx = ApproxRewriter::from_config(&self.catalog, &config).approximate(&tree, root)?;
        Ok(approx.to_query())
    }

    pub fn rewrite_sql(&self, parser: &dyn SqlParser, sql: &str) -> Result<String> {
        let stmt = parser.parse_select(sql)?;
        let query = self.rewrite(&stmt)?;
        SqlWriter::new(self.conn.syntax()).select(&query)
    }

    /// 改写并执行
    pub async fn query(&self, stmt: &SelectStatement) -> Result<DbmsQueryResult> {
        let query = self.rewrite(stmt)?;
        run_query(self.conn.clone(), query).await
    }

    pub fn ola_plan(&self, query: &OlaQuery) -> Result<ExecutionPlan> {
        OlaPlanBuilder::new(self.config()?.ola_partitions).build(query)
    }

    /// 分区执行
    ///
    /// 每当一个覆盖分块前缀的部分结果完成，就读回中间表并把当前估计交给 `on_progress`。
    /// 返回根节点给出的最终估计。
    pub async fn run_ola<F>(&self, query: &OlaQuery, mut on_progress: F) -> Result<DbmsQueryResult>
    where
        F: FnMut(DbmsQueryResult),
    {
        let config = self.config()?;
        let plan = self.ola_plan(query)?;
        let mut runner = PlanRunner::new(self.conn.clone(), config.worker_count, config.scratchpad_schema);
        let mut progress = runner.subscribe_progress();

        // 运行结束后 runner 被释放，进度通道随之关闭
        let run = async move { runner.run(&plan).await };
        let conn = self.conn.clone();
        let scramble = query.scramble.clone();
        let present = async {
            while let Some(update) = progress.recv().await {
                let (Some(table), Some(meta)) = (update.token.table(), update.token.agg_meta()) else {
                    continue;
                };
                if !meta.block_range.is_some_and(|(start, _)| start == 0) {
                    continue;
                }
                debug!("节点 {} 完成，读取部分结果 {table}", update.name);
                let rows = run_query(conn.clone(), SelectQuery::star(Relation::base(table.clone(), None))).await?;
                let frame = AggregateFrame::from_result(meta.clone(), &rows)?;
                on_progress(frame.finalize(Some(&scramble))?);
            }
            Ok::<(), Error>(())
        };
        let (token, presented) = tokio::join!(run, present);
        let token = token?;
        presented?;
        info!("分区执行完成");
        token.into_rows().ok_or_else(|| errplan!("final estimate node returned no rows"))
    }

    /// 登记已有的 scramble 元数据
    pub fn load_catalog(&self, path: &std::path::Path) -> Result<usize> {
        let loaded = ScrambleMetaSet::load(path)?.all()?;
        for meta in &loaded {
            self.catalog.add(meta.as_ref().clone())?;
        }
        info!("从 {:?} 载入 {} 个 scramble", path, loaded.len());
        Ok(loaded.len())
    }

    pub fn save_catalog(&self, path: &std::path::Path) -> Result<()> {
        self.catalog.save(path)
    }
}

async fn run_query(conn: Arc<dyn DbmsConnection>, query: SelectQuery) -> Result<DbmsQueryResult> {
    tokio::task::spawn_blocking(move || {
        let sql = SqlWriter::new(conn.syntax()).select(&query)?;
        conn.query(&sql)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DryRunConnection;
    use crate::execution::OlaAggregate;
    use crate::scramble::meta::tests::uniform_meta;
    use crate::sql::parser::ast::{AggFunction, Expression, From};
    use crate::sql::Dialect;
    use crate::types::{ColumnMeta, DataType, Value};

    fn context() -> (Arc<DryRunConnection>, AqpContext) {
        let conn = Arc::new(DryRunConnection::new(Dialect::Postgres));
        let config = Config::builder().ola_partitions(2).build().unwrap();
        (conn.clone(), AqpContext::new(config, conn))
    }

    #[test]
    fn test_rewrite_falls_back_to_exact() -> Result<()> {
        let (_, ctx) = context();
        let stmt = SelectStatement {
            select: vec![(Expression::agg(AggFunction::Count, Expression::All), Some("c".into()))],
            from: vec![From::Table { name: "sales.orders".into(), alias: None }],
            ..Default::default()
        };
        let sql = SqlWriter::new(ctx.connection().syntax()).select(&ctx.rewrite(&stmt)?)?;
        assert!(sql.starts_with("select count(*) as \"c\" from \"sales\".\"orders\""));

        ctx.catalog().add(uniform_meta("sales", "orders", 10, 1000))?;
        let sql = SqlWriter::new(ctx.connection().syntax()).select(&ctx.rewrite(&stmt)?)?;
        assert!(sql.contains("\"sales\".\"orders_scrambled\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_ola_reports_prefixes() -> Result<()> {
        let (conn, ctx) = context();
        let partial = DbmsQueryResult::new(
            vec![ColumnMeta::new("verdictdbtier", DataType::Integer), ColumnMeta::new("cnt", DataType::Integer)],
            vec![vec![Value::Integer(0), Value::Integer(50)]],
        );
        conn.script("select * from \"verdictdb_temp\"", partial)?;
        let query = OlaQuery {
            scramble: Arc::new(uniform_meta("sales", "orders", 10, 1000)),
            alias: "o".into(),
            groups: vec![],
            aggregates: vec![OlaAggregate::new(AggFunction::Count, Expression::All, "cnt")],
            filter: None,
        };
        let mut estimates = Vec::new();
        ctx.run_ola(&query, |result| estimates.push(result)).await?;

        // 第一个分区覆盖 [0, 5)，合并后覆盖 [0, 10)
        assert_eq!(estimates.len(), 2);
        let counts: Vec<Value> = estimates.iter().map(|r| r.rows[0][0].clone()).collect();
        assert!(counts.contains(&Value::Float(100.0)));
        assert!(counts.contains(&Value::Float(50.0)));
        Ok(())
    }

    #[test]
    fn test_catalog_round_trip() -> Result<()> {
        let (conn, ctx) = context();
        ctx.catalog().add(uniform_meta("sales", "orders", 4, 100))?;
        let file = tempfile::NamedTempFile::new()?;
        ctx.save_catalog(file.path())?;

        let other = AqpContext::new(Config::default(), conn);
        assert_eq!(other.load_catalog(file.path())?, 1);
        assert!(other.catalog().is_scrambled(&crate::types::TableName::new("sales", "orders"))?);
        Ok(())
    }
}
