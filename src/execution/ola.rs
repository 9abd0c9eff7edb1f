//! 分区（在线聚合）执行计划。
//!
//! 把 scramble 的分块前缀切成若干个连续区间，每个区间一个部分聚合节点，
//! 再用合并节点从左到右依次合并，根节点按分层权重给出最终估计。
//! 每个合并节点完成时，已覆盖的分块区间都是一个前缀，调用方可以据此展示逐步收敛的结果。

use std::sync::Arc;

use tracing::info;

use crate::db_error::Result;
use crate::errplan;
use crate::execution::plan::ExecutionPlan;
use crate::execution::token::{AggColumn, AggMeta, FinalColumn};
use crate::relation::approx::tier_probability_of;
use crate::scramble::{ScrambleMeta, UNIFORM};
use crate::sql::parser::ast::{AggFunction, Expression, Operator};
use crate::sql::{Relation, SelectItem, SelectQuery};

const RESULT_ALIAS: &str = "verdictdb_ola";

/// 查询中的一个聚合
#[derive(Clone, Debug, PartialEq)]
pub struct OlaAggregate {
    pub function: AggFunction,
    pub arg: Expression,
    pub alias: String,
}

impl OlaAggregate {
    pub fn new(function: AggFunction, arg: Expression, alias: &str) -> Self {
        Self { function, arg, alias: alias.to_lowercase() }
    }
}

/// 单表聚合查询，来源是一个 scramble
#[derive(Clone, Debug)]
pub struct OlaQuery {
    pub scramble: Arc<ScrambleMeta>,
    /// 查询中引用 scramble 的别名
    pub alias: String,
    /// (分组表达式, 输出别名)
    pub groups: Vec<(Expression, String)>,
    pub aggregates: Vec<OlaAggregate>,
    pub filter: Option<Expression>,
}

pub struct OlaPlanBuilder {
    partitions: usize,
    block_limit: Option<usize>,
}

impl OlaPlanBuilder {
    pub fn new(partitions: usize) -> Self {
        Self { partitions: partitions.max(1), block_limit: None }
    }

    /// 只读前 `blocks` 个分块
    pub fn block_limit(mut self, blocks: usize) -> Self {
        self.block_limit = Some(blocks);
        self
    }

    /// 把 [0, blocks) 尽量均匀地切成连续区间，前面的区间多分一个
    pub fn block_ranges(&self, blocks: usize) -> Vec<(usize, usize)> {
        let parts = self.partitions.min(blocks).max(1);
        let (base, extra) = (blocks / parts, blocks % parts);
        let mut start = 0;
        (0..parts)
            .map(|i| {
                let end = start + base + usize::from(i < extra);
                let range = (start, end);
                start = end;
                range
            })
            .collect()
    }

    pub fn build(&self, query: &OlaQuery) -> Result<ExecutionPlan> {
        let meta = &query.scramble;
        if query.aggregates.is_empty() {
            return Err(errplan!("partitioned execution needs at least one aggregate"));
        }
        meta.validate()?;
        let blocks = self.block_limit.unwrap_or(meta.block_count).clamp(1, meta.block_count);
        let ranges = self.block_ranges(blocks);
        info!("{} 的前 {blocks} 个分块切成 {} 个分区", meta.table, ranges.len());

        let (partial_select, agg_meta) = partial_aggregates(query)?;
        let mut plan = ExecutionPlan::new();
        let mut acc = None;
        for (i, (start, end)) in ranges.iter().enumerate() {
            let node_meta = AggMeta { block_range: Some((*start, *end)), ..agg_meta.clone() };
            let partial = plan.create_table(
                &format!("partition {i} [{start}, {end})"),
                partition_query(query, &partial_select, *start, *end),
                None,
                Some(node_meta),
                &[],
            )?;
            acc = Some(match acc {
                None => partial,
                Some(left) => plan.combine(&format!("combine up to block {end}"), left, partial)?,
            });
        }
        let acc = acc.ok_or_else(|| errplan!("no partition was created"))?;
        plan.select("final estimate", final_query(query, &agg_meta, blocks), None, &[acc])?;
        Ok(plan)
    }
}

/// 部分聚合列以及对应的 AggMeta，avg 拆成 sum 和 count
fn partial_aggregates(query: &OlaQuery) -> Result<(Vec<SelectItem>, AggMeta)> {
    let meta = &query.scramble;
    let mut select = Vec::new();
    let mut aggregates = Vec::new();
    let mut finals = Vec::new();
    for agg in &query.aggregates {
        match agg.function {
            AggFunction::Avg => {
                let numerator = format!("{}_sum", agg.alias);
                let denominator = format!("{}_count", agg.alias);
                select.push(SelectItem::aliased(Expression::agg(AggFunction::Sum, agg.arg.clone()), &numerator));
                select.push(SelectItem::aliased(Expression::agg(AggFunction::Count, agg.arg.clone()), &denominator));
                aggregates.push(AggColumn::new(&numerator, AggFunction::Sum));
                aggregates.push(AggColumn::new(&denominator, AggFunction::Count));
                finals.push(FinalColumn::Ratio { alias: agg.alias.clone(), numerator, denominator });
            }
            AggFunction::CountDistinct => {
                let hashed = match &agg.arg {
                    Expression::Column(_, name) => {
                        meta.method == UNIFORM
                            && meta.primary_column.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(name))
                    }
                    _ => false,
                };
                if !hashed {
                    return Err(errplan!(
                        "count distinct over {:?} needs a uniform scramble hashed on that column",
                        agg.arg
                    ));
                }
                select.push(SelectItem::aliased(Expression::agg(agg.function, agg.arg.clone()), &agg.alias));
                aggregates.push(AggColumn::new(&agg.alias, agg.function));
                finals.push(FinalColumn::Plain(agg.alias.clone()));
            }
            function => {
                select.push(SelectItem::aliased(Expression::agg(function, agg.arg.clone()), &agg.alias));
                aggregates.push(AggColumn::new(&agg.alias, function));
                finals.push(FinalColumn::Plain(agg.alias.clone()));
            }
        }
    }
    let agg_meta = AggMeta {
        group_aliases: query.groups.iter().map(|(_, alias)| alias.to_lowercase()).collect(),
        aggregates,
        tier_alias: Some(meta.tier_column.clone()),
        scramble: Some(meta.table.clone()),
        block_range: None,
        finals,
    };
    Ok((select, agg_meta))
}

/// 一个分区的部分聚合查询，按分组列和分层列分组
fn partition_query(query: &OlaQuery, partial_select: &[SelectItem], start: usize, end: usize) -> SelectQuery {
    let meta = &query.scramble;
    let alias = query.alias.as_str();
    let tier = Expression::column(Some(alias), &meta.tier_column);
    let block = Expression::column(Some(alias), &meta.block_column);

    let mut select: Vec<SelectItem> =
        query.groups.iter().map(|(expr, name)| SelectItem::aliased(expr.clone(), name)).collect();
    select.push(SelectItem::aliased(tier.clone(), &meta.tier_column));
    select.extend(partial_select.iter().cloned());

    let mut q = SelectQuery::new(select, Relation::base(meta.table.clone(), Some(alias)));
    if let Some(filter) = &query.filter {
        q.add_filter(filter.clone());
    }
    q.add_filter(Operator::GreaterEq(block.clone().into(), Expression::int(start as i64).into()).into());
    q.add_filter(Operator::Less(block.into(), Expression::int(end as i64).into()).into());
    q.group_by = query.groups.iter().map(|(expr, _)| expr.clone()).collect();
    q.group_by.push(tier);
    q
}

/// 根节点：按分层加权并合并掉分层列，avg = 加权 sum / 加权 count
fn final_query(query: &OlaQuery, agg_meta: &AggMeta, blocks: usize) -> SelectQuery {
    let meta = &query.scramble;
    let col = |name: &str| Expression::column(Some(RESULT_ALIAS), name);
    let probability = tier_probability_of(meta, col(&meta.tier_column), blocks);
    let ratio = meta.sampling_ratio(blocks);
    let weighted = |name: &str| -> Expression {
        let function = agg_meta.aggregate(name).map(|a| a.function).unwrap_or(AggFunction::Sum);
        match function {
            AggFunction::Min | AggFunction::Max => Expression::agg(function, col(name)),
            AggFunction::CountDistinct => Operator::Div(
                Expression::agg(AggFunction::Sum, col(name)).into(),
                Expression::float(ratio).into(),
            )
            .into(),
            _ => Expression::agg(
                AggFunction::Sum,
                Operator::Div(col(name).into(), probability.clone().into()).into(),
            ),
        }
    };

    let mut select: Vec<SelectItem> =
        agg_meta.group_aliases.iter().map(|g| SelectItem::aliased(col(g), g)).collect();
    for column in agg_meta.final_columns() {
        let expr = match &column {
            FinalColumn::Plain(name) => weighted(name),
            FinalColumn::Ratio { numerator, denominator, .. } => {
                Operator::Div(weighted(numerator).into(), weighted(denominator).into()).into()
            }
        };
        select.push(SelectItem::aliased(expr, column.alias()));
    }
    let mut q = SelectQuery::new(select, Relation::Placeholder { slot: 0, alias: RESULT_ALIAS.to_string() });
    q.group_by = agg_meta.group_aliases.iter().map(|g| col(g)).collect();
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::node::NodeKind;
    use crate::scramble::meta::tests::uniform_meta;
    use crate::sql::syntax::PostgresSyntax;
    use crate::sql::SqlWriter;
    use crate::types::TableName;

    fn query() -> OlaQuery {
        OlaQuery {
            scramble: Arc::new(uniform_meta("s", "orders", 10, 1000)),
            alias: "o".into(),
            groups: vec![(Expression::column(Some("o"), "dow"), "dow".into())],
            aggregates: vec![
                OlaAggregate::new(AggFunction::Count, Expression::All, "cnt"),
                OlaAggregate::new(AggFunction::Avg, Expression::column(Some("o"), "price"), "avg_price"),
            ],
            filter: None,
        }
    }

    #[test]
    fn test_block_ranges() {
        assert_eq!(OlaPlanBuilder::new(4).block_ranges(10), vec![(0, 3), (3, 6), (6, 8), (8, 10)]);
        assert_eq!(OlaPlanBuilder::new(4).block_ranges(2), vec![(0, 1), (1, 2)]);
        assert_eq!(OlaPlanBuilder::new(1).block_ranges(3), vec![(0, 3)]);
    }

    #[test]
    fn test_plan_shape() -> Result<()> {
        let plan = OlaPlanBuilder::new(3).build(&query())?;
        // 3 个分区 + 2 个合并 + 根
        assert_eq!(plan.len(), 6);
        let leaves: Vec<usize> = plan.nodes().iter().filter(|n| n.upstream.is_empty()).map(|n| n.id).collect();
        assert_eq!(leaves, vec![0, 1, 3]);
        assert!(matches!(plan.node(2).map(|n| &n.kind), Some(NodeKind::AggCombiner)));
        assert_eq!(plan.node(4).map(|n| n.upstream.clone()), Some(vec![2, 3]));
        assert_eq!(plan.root(), Some(5));

        let Some(NodeKind::CreateTable { query, agg_meta: Some(meta), .. }) = plan.node(0).map(|n| &n.kind) else {
            panic!("first node should be a partial aggregate");
        };
        assert_eq!(meta.block_range, Some((0, 4)));
        assert_eq!(meta.columns(), vec!["dow", "verdictdbtier", "cnt", "avg_price_sum", "avg_price_count"]);
        let syntax = PostgresSyntax;
        let sql = SqlWriter::new(&syntax).select(query)?;
        assert!(sql.contains("where (\"o\".\"verdictdbblock\" >= 0 and \"o\".\"verdictdbblock\" < 4)"));
        assert!(sql.ends_with("group by \"o\".\"dow\", \"o\".\"verdictdbtier\""));
        Ok(())
    }

    #[test]
    fn test_final_projection() -> Result<()> {
        let plan = OlaPlanBuilder::new(2).block_limit(5).build(&query())?;
        let root = plan.node(plan.root().unwrap_or_default()).map(|n| n.kind.clone());
        let Some(NodeKind::Select { query, .. }) = root else {
            panic!("root should be a select");
        };
        let resolved = query.resolve_placeholders(&[TableName::new("tmp", "acc")])?;
        let syntax = PostgresSyntax;
        let sql = SqlWriter::new(&syntax).select(&resolved)?;
        assert_eq!(
            sql,
            "select \"verdictdb_ola\".\"dow\" as \"dow\", \
             sum((\"verdictdb_ola\".\"cnt\" / 0.5)) as \"cnt\", \
             (sum((\"verdictdb_ola\".\"avg_price_sum\" / 0.5)) / sum((\"verdictdb_ola\".\"avg_price_count\" / 0.5))) \
             as \"avg_price\" from \"tmp\".\"acc\" as \"verdictdb_ola\" group by \"verdictdb_ola\".\"dow\""
        );
        Ok(())
    }

    #[test]
    fn test_count_distinct_requires_hashed_scramble() {
        let mut q = query();
        q.aggregates = vec![OlaAggregate::new(AggFunction::CountDistinct, Expression::column(Some("o"), "user_id"), "u")];
        assert!(OlaPlanBuilder::new(2).build(&q).is_err());

        let mut meta = uniform_meta("s", "orders", 10, 1000);
        meta.primary_column = Some("user_id".into());
        q.scramble = Arc::new(meta);
        assert!(OlaPlanBuilder::new(2).build(&q).is_ok());
    }

    #[test]
    fn test_unvalidated_scramble_is_rejected() {
        let mut q = query();
        let mut meta = uniform_meta("s", "orders", 10, 1000);
        meta.block_count = 0;
        q.scramble = Arc::new(meta);
        assert!(OlaPlanBuilder::new(2).build(&q).is_err());

        let mut meta = uniform_meta("s", "orders", 10, 1000);
        meta.cumulative_distribution.insert(0, vec![]);
        q.scramble = Arc::new(meta);
        assert!(OlaPlanBuilder::new(2).build(&q).is_err());
    }
}
