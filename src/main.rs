use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use mini_aqp::cfg::{get_config_path, Config};
use mini_aqp::connection::DryRunConnection;
use mini_aqp::db_error::Result;
use mini_aqp::execution::{OlaAggregate, OlaQuery};
use mini_aqp::scramble::coordinator::BLOCK_SIZE_KEY;
use mini_aqp::sql::parser::ast::{AggFunction, Expression};
use mini_aqp::sql::Dialect;
use mini_aqp::types::{ColumnMeta, DataType, DbmsQueryResult, TableName, Value};
use mini_aqp::{init_tracing, AqpContext};

/// 近似查询中间件，不连接数据库，只打印将要执行的 SQL
#[derive(Parser, Debug)]
#[command(name = "mini-aqp")]
#[command(version, about = "Approximate query processing over scrambled tables (dry run)")]
struct Cli {
    /// 配置文件，默认读取 MINI_AQP_CONFIG 或者 ./config.toml（不存在时使用默认配置）
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// 覆盖配置中的方言：postgres、hive、h2
    #[arg(short = 'd', long = "dialect")]
    dialect: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 构建 scramble 表
    Scramble(ScrambleArgs),
    /// 构建 scramble 后分区执行一个聚合查询
    ExplainOla(OlaArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// 原表，schema.table
    #[arg(short = 't', long = "table")]
    table: String,

    /// 假定的原表行数
    #[arg(short = 'r', long = "rows")]
    rows: i64,

    /// FastConverge 假定的稀有组行数
    #[arg(long = "rare-rows", default_value = "0")]
    rare_rows: i64,

    /// 抽样方法：uniform、fastconverge
    #[arg(short = 'm', long = "method", default_value = "uniform")]
    method: String,

    /// 哈希或分层依据的主列
    #[arg(long = "column")]
    column: Option<String>,

    /// 每个分块的目标行数
    #[arg(short = 'b', long = "block-size")]
    block_size: Option<f64>,
}

#[derive(Args, Debug)]
struct ScrambleArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// 新表，schema.table，默认按配置命名
    #[arg(long = "target")]
    target: Option<String>,
}

#[derive(Args, Debug)]
struct OlaArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// 分组列
    #[arg(short = 'g', long = "group")]
    group: Vec<String>,

    /// 求和列
    #[arg(long = "sum")]
    sum: Vec<String>,

    /// 求平均列
    #[arg(long = "avg")]
    avg: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None if get_config_path().exists() => Config::load_config()?,
        None => Config::default(),
    };
    if let Some(name) = &cli.dialect {
        config.dialect = Dialect::from_name(name)?;
    }
    Ok(config)
}

fn count(n: i64) -> DbmsQueryResult {
    DbmsQueryResult::new(vec![ColumnMeta::new("c", DataType::Integer)], vec![vec![Value::Integer(n)]])
}

/// 按命令行给出的统计值应答统计查询的连接
fn connection(config: &Config, source: &SourceArgs) -> Result<Arc<DryRunConnection>> {
    let conn = Arc::new(DryRunConnection::new(config.dialect));
    conn.script("verdictdbrarerows", count(source.rare_rows))?;
    conn.script("count(*)", count(source.rows))?;
    Ok(conn)
}

async fn scramble(ctx: &AqpContext, source: &SourceArgs, target: Option<&str>) -> Result<mini_aqp::scramble::ScrambleMeta> {
    let config = ctx.config()?;
    let syntax = config.dialect.syntax();
    let original = TableName::parse(&source.table, syntax.fallback_default_schema());
    let target = match target {
        Some(name) => TableName::parse(name, &original.schema),
        None => TableName::new(
            config.scramble_schema.as_deref().unwrap_or(&original.schema),
            format!("{}{}", original.table, config.scramble.scramble_table_suffix),
        ),
    };
    let mut options = HashMap::new();
    if let Some(size) = source.block_size {
        options.insert(BLOCK_SIZE_KEY.to_string(), size.to_string());
    }
    ctx.coordinator()?
        .scramble(
            &original.schema,
            &original.table,
            &target.schema,
            &target.table,
            &source.method,
            source.column.as_deref(),
            &options,
        )
        .await
}

fn print_statements(conn: &DryRunConnection) -> Result<()> {
    for statement in conn.statements()? {
        println!("{statement};");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Command::Scramble(args) => {
            let conn = connection(&config, &args.source)?;
            let ctx = AqpContext::new(config, conn.clone());
            let meta = scramble(&ctx, &args.source, args.target.as_deref()).await?;
            print_statements(&conn)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::ExplainOla(args) => {
            let conn = connection(&config, &args.source)?;
            let ctx = AqpContext::new(config, conn.clone());
            let meta = Arc::new(scramble(&ctx, &args.source, None).await?);

            let alias = meta.original.table.clone();
            let column = |name: &str| Expression::column(Some(&alias), name);
            let mut aggregates = vec![OlaAggregate::new(AggFunction::Count, Expression::All, "cnt")];
            aggregates.extend(args.sum.iter().map(|c| OlaAggregate::new(AggFunction::Sum, column(c), &format!("sum_{c}"))));
            aggregates.extend(args.avg.iter().map(|c| OlaAggregate::new(AggFunction::Avg, column(c), &format!("avg_{c}"))));
            let query = OlaQuery {
                scramble: meta.clone(),
                alias: alias.clone(),
                groups: args.group.iter().map(|g| (column(g), g.to_lowercase())).collect(),
                aggregates,
                filter: None,
            };
            let mut updates = 0;
            let result = ctx.run_ola(&query, |_| updates += 1).await?;
            info!("收到 {updates} 次中间估计，最终结果 {} 行", result.row_count());
            print_statements(&conn)?;
        }
    }
    Ok(())
}
