//! 近似关系树以及它的 SQL 渲染。
//!
//! 抽样替换后的叶子读 scramble 的前若干分块，聚合节点中的聚合函数被改写成
//! Horvitz-Thompson 估计：每行按所在分层的入样概率的倒数加权。
//! 多个抽样表连接时，一行的入样概率是各表入样概率的乘积。

use std::sync::Arc;

use crate::db_error::Result;
use crate::errplan;
use crate::relation::exact::{ExactRelation, RelId, RelationTree};
use crate::relation::sample::SampleGroup;
use crate::scramble::ScrambleMeta;
use crate::sql::parser::ast::{AggFunction, Direction, Expression, JoinType, Literal, Operator};
use crate::sql::{Relation, SelectItem, SelectQuery};
use crate::types::TableName;

#[derive(Clone, Debug, PartialEq)]
pub enum ApproxRelation {
    /// 读原表
    Single { table: TableName, alias: Option<String> },
    /// 读 scramble 的前若干分块
    Sample { group: SampleGroup, alias: String },
    Filtered { source: Box<ApproxRelation>, filter: Expression },
    Projected { source: Box<ApproxRelation>, select: Vec<SelectItem>, alias: Option<String> },
    Aggregated { source: Box<ApproxRelation>, select: Vec<SelectItem>, alias: Option<String> },
    Grouped { source: Box<ApproxRelation>, group_by: Vec<Expression> },
    Joined { left: Box<ApproxRelation>, right: Box<ApproxRelation>, kind: JoinType, on: Option<Expression> },
    Ordered { source: Box<ApproxRelation>, order_by: Vec<(Expression, Direction)> },
    Limited { source: Box<ApproxRelation>, limit: u64 },
}

impl ApproxRelation {
    /// 不做任何替换，原样转换精确关系树
    pub fn from_exact(tree: &RelationTree, root: RelId) -> Result<ApproxRelation> {
        Self::build(tree, root, &|_| Ok(None), &|_, select| Ok(select.to_vec()))
    }

    /// 按下标顺序自底向上构建
    ///
    /// `leaf` 决定单表是否替换为抽样，`aggregate` 改写聚合节点的选择列表。
    pub(crate) fn build(
        tree: &RelationTree,
        root: RelId,
        leaf: &dyn Fn(RelId) -> Result<Option<ApproxRelation>>,
        aggregate: &dyn Fn(RelId, &[SelectItem]) -> Result<Vec<SelectItem>>,
    ) -> Result<ApproxRelation> {
        let mut built: Vec<Option<ApproxRelation>> = vec![None; root + 1];
        for id in tree.subtree(root)? {
            let node = tree.node(id)?;
            let mut take = |child: RelId| -> Result<Box<ApproxRelation>> {
                built
                    .get_mut(child)
                    .and_then(Option::take)
                    .map(Box::new)
                    .ok_or_else(|| errplan!("relation {child} is referenced twice or missing"))
            };
            let approx = match &node.relation {
                ExactRelation::Single { table, alias } => match leaf(id)? {
                    Some(replaced) => replaced,
                    None => ApproxRelation::Single { table: table.clone(), alias: alias.clone() },
                },
                ExactRelation::Filtered { source, filter } => {
                    ApproxRelation::Filtered { source: take(*source)?, filter: filter.clone() }
                }
                ExactRelation::Projected { source, select } => ApproxRelation::Projected {
                    source: take(*source)?,
                    select: select.clone(),
                    alias: node.alias.clone(),
                },
                ExactRelation::Aggregated { source, select } => ApproxRelation::Aggregated {
                    source: take(*source)?,
                    select: aggregate(id, select)?,
                    alias: node.alias.clone(),
                },
                ExactRelation::Grouped { source, group_by } => {
                    ApproxRelation::Grouped { source: take(*source)?, group_by: group_by.clone() }
                }
                ExactRelation::Joined { left, right, kind, on } => ApproxRelation::Joined {
                    left: take(*left)?,
                    right: take(*right)?,
                    kind: *kind,
                    on: on.clone(),
                },
                ExactRelation::Ordered { source, order_by } => {
                    ApproxRelation::Ordered { source: take(*source)?, order_by: order_by.clone() }
                }
                ExactRelation::Limited { source, limit } => {
                    ApproxRelation::Limited { source: take(*source)?, limit: *limit }
                }
            };
            built[id] = Some(approx);
        }
        built
            .get_mut(root)
            .and_then(Option::take)
            .ok_or_else(|| errplan!("relation {root} was not built"))
    }

    /// 树中全部抽样叶子
    pub fn samples(&self) -> Vec<&SampleGroup> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(cur) = stack.pop() {
            match cur {
                ApproxRelation::Sample { group, .. } => found.push(group),
                ApproxRelation::Single { .. } => {}
                ApproxRelation::Joined { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
                ApproxRelation::Filtered { source, .. }
                | ApproxRelation::Projected { source, .. }
                | ApproxRelation::Aggregated { source, .. }
                | ApproxRelation::Grouped { source, .. }
                | ApproxRelation::Ordered { source, .. }
                | ApproxRelation::Limited { source, .. } => stack.push(source),
            }
        }
        found
    }

    /// 是否含有抽样叶子
    pub fn is_approximate(&self) -> bool {
        !self.samples().is_empty()
    }

    /// 渲染成查询对象
    pub fn to_query(&self) -> SelectQuery {
        QueryBuilder::default().query(self)
    }
}

/// 子句的先后顺序，自顶向下只能单调递增，否则需要嵌套成派生表
fn clause_rank(rel: &ApproxRelation) -> u8 {
    match rel {
        ApproxRelation::Limited { .. } => 0,
        ApproxRelation::Ordered { .. } => 1,
        ApproxRelation::Projected { .. } | ApproxRelation::Aggregated { .. } => 2,
        ApproxRelation::Grouped { .. } => 3,
        ApproxRelation::Filtered { .. } => 4,
        ApproxRelation::Single { .. } | ApproxRelation::Sample { .. } | ApproxRelation::Joined { .. } => 5,
    }
}

#[derive(Default)]
struct QueryBuilder {
    next_alias: usize,
}

impl QueryBuilder {
    fn fresh_alias(&mut self) -> String {
        self.next_alias += 1;
        format!("verdictdb_alias_{}", self.next_alias)
    }

    fn query(&mut self, rel: &ApproxRelation) -> SelectQuery {
        let mut query = SelectQuery::default();
        let mut rank: Option<u8> = None;
        let mut cur = rel;
        loop {
            let r = clause_rank(cur);
            // 过滤条件可以连续出现
            if rank.is_some_and(|prev| r < prev || (r == prev && r != 4)) {
                query.from = vec![self.derived(cur, None)];
                break;
            }
            rank = Some(r);
            match cur {
                ApproxRelation::Limited { source, limit } => {
                    query.limit = Some(*limit);
                    cur = source;
                }
                ApproxRelation::Ordered { source, order_by } => {
                    query.order_by = order_by.clone();
                    cur = source;
                }
                ApproxRelation::Projected { source, select, .. } | ApproxRelation::Aggregated { source, select, .. } => {
                    query.select = select.clone();
                    cur = source;
                }
                ApproxRelation::Grouped { source, group_by } => {
                    query.group_by = group_by.clone();
                    cur = source;
                }
                ApproxRelation::Filtered { source, filter } => {
                    query.add_filter(filter.clone());
                    cur = source;
                }
                ApproxRelation::Single { .. } | ApproxRelation::Sample { .. } | ApproxRelation::Joined { .. } => {
                    query.from = vec![self.relation(cur)];
                    break;
                }
            }
        }
        if query.select.is_empty() {
            query.select = vec![SelectItem::new(Expression::All, None)];
        }
        query
    }

    fn relation(&mut self, rel: &ApproxRelation) -> Relation {
        match rel {
            ApproxRelation::Single { table, alias } => Relation::Base { table: table.clone(), alias: alias.clone() },
            ApproxRelation::Sample { group, alias } => sample_relation(group, alias),
            ApproxRelation::Joined { left, right, kind, on } => Relation::Join {
                left: Box::new(self.relation(left)),
                right: Box::new(self.relation(right)),
                kind: *kind,
                on: on.clone(),
            },
            other => self.derived(other, None),
        }
    }

    fn derived(&mut self, rel: &ApproxRelation, alias: Option<String>) -> Relation {
        let alias = alias
            .or_else(|| match rel {
                ApproxRelation::Projected { alias, .. } | ApproxRelation::Aggregated { alias, .. } => alias.clone(),
                _ => None,
            })
            .unwrap_or_else(|| self.fresh_alias());
        Relation::Derived { query: Box::new(self.query(rel)), alias }
    }
}

/// `(select * from scramble as a where a.block < k [and a.tier in ...]) as a`
fn sample_relation(group: &SampleGroup, alias: &str) -> Relation {
    let Some(meta) = &group.scramble else {
        return Relation::base(group.original.clone(), Some(alias));
    };
    let mut query = SelectQuery::star(Relation::base(meta.table.clone(), Some(alias)));
    if group.blocks < meta.block_count {
        query.add_filter(
            Operator::Less(
                Expression::column(Some(alias), &meta.block_column).into(),
                Expression::int(group.blocks as i64).into(),
            )
            .into(),
        );
    }
    if !group.tiers.is_empty() && group.tiers.len() < meta.tier_count {
        let tier_filter = group
            .tiers
            .iter()
            .map(|t| -> Expression {
                Operator::Eq(Expression::column(Some(alias), &meta.tier_column).into(), Expression::int(*t as i64).into())
                    .into()
            })
            .reduce(|a, b| Operator::Or(a.into(), b.into()).into());
        if let Some(tier_filter) = tier_filter {
            query.add_filter(tier_filter);
        }
    }
    Relation::Derived { query: Box::new(query), alias: alias.to_string() }
}

/// 一个抽样叶子中某行的入样概率表达式
///
/// 单层时是常量，多层时是 `case when a.tier = 0 then p0 when ... end`。
pub fn tier_probability(meta: &ScrambleMeta, alias: &str, blocks: usize) -> Expression {
    let tier_col = Expression::column(Some(alias), &meta.tier_column);
    tier_probability_of(meta, tier_col, blocks)
}

/// 同上，分层列由调用方给出
pub fn tier_probability_of(meta: &ScrambleMeta, tier_col: Expression, blocks: usize) -> Expression {
    if meta.tier_count == 1 {
        return Expression::float(meta.inclusion_probability(0, blocks));
    }
    let branches = (0..meta.tier_count)
        .map(|t| {
            let cond: Expression = Operator::Eq(tier_col.clone().into(), Expression::int(t as i64).into()).into();
            (cond, Expression::float(meta.inclusion_probability(t, blocks)))
        })
        .collect();
    Expression::Case(branches, None)
}

fn div(left: Expression, right: Expression) -> Expression {
    Operator::Div(left.into(), right.into()).into()
}

/// 把一个聚合调用改写成无偏估计
///
/// - `sum(x)` -> `sum(x / P)`
/// - `count(*)` -> `sum(1.0 / P)`，`count(x)` 只计非空行
/// - `avg(x)` -> 估计的 sum / 估计的 count
/// - `count(distinct c)` -> `count(distinct c) / ratio`
/// - min/max 不变
pub fn estimate_aggregate(func: AggFunction, arg: &Expression, probability: &Expression, ratio: f64) -> Expression {
    let weighted_count = |arg: &Expression| -> Expression {
        let weight = div(Expression::float(1.0), probability.clone());
        match arg {
            Expression::All => Expression::agg(AggFunction::Sum, weight),
            arg => Expression::agg(
                AggFunction::Sum,
                Expression::Case(
                    vec![(Operator::Is(arg.clone().into(), Literal::Null).into(), Expression::float(0.0))],
                    Some(Box::new(weight)),
                ),
            ),
        }
    };
    match func {
        AggFunction::Sum => Expression::agg(AggFunction::Sum, div(arg.clone(), probability.clone())),
        AggFunction::Count => weighted_count(arg),
        AggFunction::Avg => div(
            Expression::agg(AggFunction::Sum, div(arg.clone(), probability.clone())),
            weighted_count(arg),
        ),
        AggFunction::CountDistinct => div(Expression::agg(AggFunction::CountDistinct, arg.clone()), Expression::float(ratio)),
        AggFunction::Min | AggFunction::Max => Expression::agg(func, arg.clone()),
    }
}

/// 把选择列表中所有聚合调用替换成估计表达式
pub fn estimate_select(select: &[SelectItem], samples: &[(Arc<ScrambleMeta>, String, usize)]) -> Vec<SelectItem> {
    if samples.is_empty() {
        return select.to_vec();
    }
    let probability = samples
        .iter()
        .map(|(meta, alias, blocks)| tier_probability(meta, alias, *blocks))
        .reduce(|a, b| Operator::Multiply(a.into(), b.into()).into())
        .unwrap_or_else(|| Expression::float(1.0));
    let ratio: f64 = samples.iter().map(|(meta, _, blocks)| meta.sampling_ratio(*blocks)).product();
    select
        .iter()
        .map(|item| SelectItem {
            expr: replace_aggregates(&item.expr, &probability, ratio),
            alias: item.alias.clone(),
        })
        .collect()
}

fn replace_aggregates(expr: &Expression, probability: &Expression, ratio: f64) -> Expression {
    let rec = |e: &Expression| -> Box<Expression> { Box::new(replace_aggregates(e, probability, ratio)) };
    match expr {
        Expression::Aggregate(func, arg) => estimate_aggregate(*func, arg, probability, ratio),
        Expression::Function(name, args) => {
            Expression::Function(name.clone(), args.iter().map(|a| replace_aggregates(a, probability, ratio)).collect())
        }
        Expression::Case(branches, otherwise) => Expression::Case(
            branches.iter().map(|(w, t)| (*rec(w), *rec(t))).collect(),
            otherwise.as_deref().map(rec),
        ),
        Expression::Operator(op) => {
            use Operator::*;
            Expression::Operator(match op {
                And(l, r) => And(rec(l.as_ref()), rec(r.as_ref())),
                Or(l, r) => Or(rec(l.as_ref()), rec(r.as_ref())),
                Eq(l, r) => Eq(rec(l.as_ref()), rec(r.as_ref())),
                Greater(l, r) => Greater(rec(l.as_ref()), rec(r.as_ref())),
                GreaterEq(l, r) => GreaterEq(rec(l.as_ref()), rec(r.as_ref())),
                Less(l, r) => Less(rec(l.as_ref()), rec(r.as_ref())),
                LessEq(l, r) => LessEq(rec(l.as_ref()), rec(r.as_ref())),
                NotEq(l, r) => NotEq(rec(l.as_ref()), rec(r.as_ref())),
                Add(l, r) => Add(rec(l.as_ref()), rec(r.as_ref())),
                Div(l, r) => Div(rec(l.as_ref()), rec(r.as_ref())),
                Multiply(l, r) => Multiply(rec(l.as_ref()), rec(r.as_ref())),
                Remainder(l, r) => Remainder(rec(l.as_ref()), rec(r.as_ref())),
                Sub(l, r) => Sub(rec(l.as_ref()), rec(r.as_ref())),
                Like(l, r) => Like(rec(l.as_ref()), rec(r.as_ref())),
                Is(e, lit) => Is(rec(e.as_ref()), lit.clone()),
                Not(e) => Not(rec(e.as_ref())),
                Negate(e) => Negate(rec(e.as_ref())),
            })
        }
        Expression::All | Expression::Column(_, _) | Expression::Literal(_) => expr.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scramble::meta::tests::uniform_meta;
    use crate::sql::syntax::PostgresSyntax;
    use crate::sql::SqlWriter;

    fn render(query: &SelectQuery) -> String {
        let syntax = PostgresSyntax;
        SqlWriter::new(&syntax).select(query).unwrap()
    }

    #[test]
    fn test_exact_rendering() -> Result<()> {
        let mut tree = RelationTree::new();
        let t = tree.single(TableName::new("s", "orders"), Some("o"))?;
        let f = tree.filter(t, Operator::Greater(Expression::column(Some("o"), "price").into(), Expression::int(5).into()).into())?;
        let g = tree.groupby(f, vec![Expression::column(Some("o"), "dow")])?;
        let a = tree.agg(
            g,
            vec![
                SelectItem::new(Expression::column(Some("o"), "dow"), None),
                SelectItem::aliased(Expression::agg(AggFunction::Count, Expression::All), "c"),
            ],
        )?;
        let l = tree.limit(a, 10)?;
        let approx = ApproxRelation::from_exact(&tree, l)?;
        assert!(!approx.is_approximate());
        assert_eq!(
            render(&approx.to_query()),
            "select \"o\".\"dow\", count(*) as \"c\" from \"s\".\"orders\" as \"o\" \
             where \"o\".\"price\" > 5 group by \"o\".\"dow\" limit 10"
        );
        Ok(())
    }

    #[test]
    fn test_nested_aggregate_is_derived() -> Result<()> {
        let mut tree = RelationTree::new();
        let t = tree.single(TableName::new("s", "orders"), None)?;
        let inner = tree.agg(t, vec![SelectItem::aliased(Expression::agg(AggFunction::Count, Expression::All), "c")])?;
        tree.set_alias(inner, "sub")?;
        let outer = tree.select(inner, vec![SelectItem::new(Expression::column(Some("sub"), "c"), None)])?;
        let query = ApproxRelation::from_exact(&tree, outer)?.to_query();
        assert_eq!(
            render(&query),
            "select \"sub\".\"c\" from (select count(*) as \"c\" from \"s\".\"orders\") as \"sub\""
        );
        Ok(())
    }

    #[test]
    fn test_sample_leaf_rendering() {
        let meta = Arc::new(uniform_meta("s", "orders", 10, 1000));
        let group = SampleGroup::sampled("o", meta, 2, vec![0]);
        let rel = ApproxRelation::Sample { group, alias: "o".into() };
        assert_eq!(
            render(&rel.to_query()),
            "select * from (select * from \"s\".\"orders_scrambled\" as \"o\" \
             where \"o\".\"verdictdbblock\" < 2) as \"o\""
        );
    }

    #[test]
    fn test_estimate_select() {
        let meta = Arc::new(uniform_meta("s", "orders", 10, 1000));
        let select = vec![
            SelectItem::aliased(Expression::agg(AggFunction::Sum, Expression::column(Some("o"), "price")), "s"),
            SelectItem::aliased(Expression::agg(AggFunction::Count, Expression::All), "c"),
            SelectItem::aliased(Expression::agg(AggFunction::Max, Expression::column(Some("o"), "price")), "m"),
        ];
        let estimated = estimate_select(&select, &[(meta, "o".into(), 2)]);
        let syntax = PostgresSyntax;
        let writer = SqlWriter::new(&syntax);
        assert_eq!(writer.expr(&estimated[0].expr), "sum((\"o\".\"price\" / 0.2))");
        assert_eq!(writer.expr(&estimated[1].expr), "sum((1.0 / 0.2))");
        assert_eq!(writer.expr(&estimated[2].expr), "max(\"o\".\"price\")");
    }

    #[test]
    fn test_multi_tier_probability() {
        let mut meta = uniform_meta("s", "orders", 2, 100);
        meta.tier_count = 2;
        meta.cumulative_distribution.insert(1, vec![0.25, 1.0]);
        let p = tier_probability(&meta, "o", 1);
        let syntax = PostgresSyntax;
        assert_eq!(
            SqlWriter::new(&syntax).expr(&p),
            "case when \"o\".\"verdictdbtier\" = 0 then 0.5 when \"o\".\"verdictdbtier\" = 1 then 0.25 end"
        );
    }
}
