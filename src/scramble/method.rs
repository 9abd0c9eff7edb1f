//! 抽样方法：决定原始表中每一行落入哪个分层、哪个分块，以及由此产生的累计入样概率分布。
//!
//! - `Uniform`：单层。给定主列时按主列哈希取模分块，否则随机分块；
//!   累计分布为 `(b + 1) / blockCount`。
//! - `FastConverge`：两层。第 0 层是主列中的稀有取值对应的行，集中放在前几个分块，
//!   这样只读少量分块就能覆盖全部稀有组；第 1 层是其余行，填满每个分块剩余的容量，
//!   分布接近均匀。
//!
//! 任何分层的累计分布都单调不减，最后一个分块的累计概率为 1.0。

use crate::db_error::{Error, Result};
use crate::errdata;
use crate::sql::parser::ast::{AggFunction, Expression, JoinType, Literal, Operator};
use crate::sql::{Relation, SelectItem, SelectQuery};
use crate::types::{DbmsQueryResult, TableName};

pub const UNIFORM: &str = "uniform";
pub const FAST_CONVERGE: &str = "fastconverge";

/// 已注册的方法名
pub const SCRAMBLING_METHODS: [&str; 2] = [UNIFORM, FAST_CONVERGE];

const SOURCE_ALIAS: &str = "t";
const RARE_ALIAS: &str = "r";
const DERIVED_ALIAS: &str = "s";
const GROUP_ALIAS: &str = "g";
const RAND_COLUMN: &str = "verdictdbrand";
const GROUP_SIZE_COLUMN: &str = "verdictdbgroupsize";
const ROW_COUNT_COLUMN: &str = "verdictdbrowcount";
const RARE_ROWS_COLUMN: &str = "verdictdbrarerows";

/// 统计查询的结果
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TableStatistics {
    pub row_count: u64,
    pub rare_row_count: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScramblingMethod {
    Uniform {
        block_size: u64,
        hash_column: Option<String>,
        stats: Option<TableStatistics>,
    },
    FastConverge {
        block_size: u64,
        primary_column: String,
        rare_group_fraction: f64,
        stats: Option<TableStatistics>,
    },
}

impl ScramblingMethod {
    /// 按方法名（不区分大小写）构造抽样方法
    pub fn create(
        method_name: &str,
        block_size: u64,
        primary_column: Option<&str>,
        rare_group_fraction: f64,
    ) -> Result<Self> {
        let block_size = block_size.max(1);
        match method_name.to_lowercase().as_str() {
            UNIFORM => Ok(ScramblingMethod::Uniform {
                block_size,
                hash_column: primary_column.map(str::to_string),
                stats: None,
            }),
            FAST_CONVERGE => match primary_column {
                Some(column) => Ok(ScramblingMethod::FastConverge {
                    block_size,
                    primary_column: column.to_string(),
                    rare_group_fraction,
                    stats: None,
                }),
                None => Err(Error::MissingParameter(format!(
                    "scrambling method {method_name} requires a primary column"
                ))),
            },
            _ => Err(Error::UnsupportedMethod(method_name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScramblingMethod::Uniform { .. } => UNIFORM,
            ScramblingMethod::FastConverge { .. } => FAST_CONVERGE,
        }
    }

    pub fn primary_column(&self) -> Option<&str> {
        match self {
            ScramblingMethod::Uniform { hash_column, .. } => hash_column.as_deref(),
            ScramblingMethod::FastConverge { primary_column, .. } => Some(primary_column),
        }
    }

    pub fn tier_count(&self) -> usize {
        match self {
            ScramblingMethod::Uniform { .. } => 1,
            ScramblingMethod::FastConverge { .. } => 2,
        }
    }

    fn block_size(&self) -> u64 {
        match self {
            ScramblingMethod::Uniform { block_size, .. } | ScramblingMethod::FastConverge { block_size, .. } => {
                *block_size
            }
        }
    }

    fn stats(&self) -> Result<TableStatistics> {
        match self {
            ScramblingMethod::Uniform { stats, .. } | ScramblingMethod::FastConverge { stats, .. } => {
                stats.ok_or_else(|| errdata!("statistics of the original table are not collected yet"))
            }
        }
    }

    pub fn row_count(&self) -> Result<u64> {
        Ok(self.stats()?.row_count)
    }

    fn stats_mut(&mut self) -> &mut Option<TableStatistics> {
        match self {
            ScramblingMethod::Uniform { stats, .. } | ScramblingMethod::FastConverge { stats, .. } => stats,
        }
    }

    /// `select count(*) from original`
    pub fn row_count_query(&self, original: &TableName) -> SelectQuery {
        SelectQuery::new(
            vec![SelectItem::aliased(Expression::agg(AggFunction::Count, Expression::All), ROW_COUNT_COLUMN)],
            Relation::base(original.clone(), Some(SOURCE_ALIAS)),
        )
    }

    pub fn apply_row_count(&mut self, result: &DbmsQueryResult) -> Result<()> {
        let row_count = scalar_u64(result)?;
        let stats = self.stats_mut().get_or_insert_with(TableStatistics::default);
        stats.row_count = row_count;
        Ok(())
    }

    /// 稀有组判定阈值：组内行数低于它即为稀有组
    fn rare_threshold(&self) -> Result<Option<f64>> {
        match self {
            ScramblingMethod::Uniform { .. } => Ok(None),
            ScramblingMethod::FastConverge { rare_group_fraction, .. } => {
                Ok(Some((self.stats()?.row_count as f64 * rare_group_fraction).max(1.0)))
            }
        }
    }

    /// 主列的分组行数子查询，`select t.col, count(*) from original t group by t.col`
    fn group_size_query(original: &TableName, column: &str) -> SelectQuery {
        let col = Expression::column(Some(SOURCE_ALIAS), column);
        let mut query = SelectQuery::new(
            vec![
                SelectItem::aliased(col.clone(), column),
                SelectItem::aliased(Expression::agg(AggFunction::Count, Expression::All), GROUP_SIZE_COLUMN),
            ],
            Relation::base(original.clone(), Some(SOURCE_ALIAS)),
        );
        query.group_by.push(col);
        query
    }

    fn rare_filter(threshold: f64) -> Expression {
        Operator::Less(
            Expression::column(Some(GROUP_ALIAS), GROUP_SIZE_COLUMN).into(),
            Expression::float(threshold).into(),
        )
        .into()
    }

    /// FastConverge：统计稀有组包含的总行数，Uniform 不需要
    pub fn rare_rows_query(&self, original: &TableName) -> Result<Option<SelectQuery>> {
        let (Some(threshold), ScramblingMethod::FastConverge { primary_column, .. }) = (self.rare_threshold()?, self)
        else {
            return Ok(None);
        };
        let groups = Relation::Derived {
            query: Box::new(Self::group_size_query(original, primary_column)),
            alias: GROUP_ALIAS.to_string(),
        };
        let mut query = SelectQuery::new(
            vec![SelectItem::aliased(
                Expression::agg(AggFunction::Sum, Expression::column(Some(GROUP_ALIAS), GROUP_SIZE_COLUMN)),
                RARE_ROWS_COLUMN,
            )],
            groups,
        );
        query.add_filter(Self::rare_filter(threshold));
        Ok(Some(query))
    }

    pub fn apply_rare_rows(&mut self, result: &DbmsQueryResult) -> Result<()> {
        // 没有稀有组时 sum 返回 NULL
        let rare = match result.scalar() {
            None => 0,
            Some(v) if v.is_null() => 0,
            Some(_) => scalar_u64(result)?,
        };
        let stats = self.stats_mut().get_or_insert_with(TableStatistics::default);
        stats.rare_row_count = rare.min(stats.row_count);
        Ok(())
    }

    /// FastConverge：稀有组的主列取值，物化成中间表供 scramble 语句使用
    pub fn rare_values_query(&self, original: &TableName) -> Result<Option<SelectQuery>> {
        let (Some(threshold), ScramblingMethod::FastConverge { primary_column, .. }) = (self.rare_threshold()?, self)
        else {
            return Ok(None);
        };
        let groups = Relation::Derived {
            query: Box::new(Self::group_size_query(original, primary_column)),
            alias: GROUP_ALIAS.to_string(),
        };
        let mut query = SelectQuery::new(
            vec![SelectItem::aliased(Expression::column(Some(GROUP_ALIAS), primary_column), primary_column)],
            groups,
        );
        query.add_filter(Self::rare_filter(threshold));
        Ok(Some(query))
    }

    /// 稀有取值中间表在 scramble 语句中的引用，表名由上游节点给出
    pub fn rare_relation(slot: usize) -> Relation {
        Relation::Placeholder { slot, alias: RARE_ALIAS.to_string() }
    }

    /// `blockCount = ceil(rowCount / blockSize)`，至少为 1
    pub fn block_count(&self) -> Result<usize> {
        let rows = self.stats()?.row_count;
        Ok(rows.div_ceil(self.block_size()).max(1) as usize)
    }

    /// 某一层在每个分块上的累计入样概率
    pub fn cumulative_distribution(&self, tier: usize) -> Result<Vec<f64>> {
        if tier >= self.tier_count() {
            return Err(errdata!("tier {tier} is out of range for method {}", self.name()));
        }
        let blocks = self.block_count()?;
        let dist = match self {
            ScramblingMethod::Uniform { .. } => uniform_distribution(blocks),
            ScramblingMethod::FastConverge { block_size, .. } => {
                let stats = self.stats()?;
                let rare = stats.rare_row_count as f64;
                // 稀有行占据的分块数
                let head = ((rare / *block_size as f64).ceil() as usize).clamp(1, blocks);
                if tier == 0 {
                    (0..blocks).map(|b| ((b + 1) as f64 / head as f64).min(1.0)).collect()
                } else {
                    let rest = stats.row_count.saturating_sub(stats.rare_row_count);
                    if rest == 0 {
                        uniform_distribution(blocks)
                    } else {
                        // 每个分块剩余的容量按比例分给第 1 层
                        let capacity: Vec<f64> = (0..blocks)
                            .map(|b| {
                                let used = if b < head { rare / head as f64 } else { 0.0 };
                                (*block_size as f64 - used).max(0.0)
                            })
                            .collect();
                        let total: f64 = capacity.iter().sum();
                        if total <= 0.0 {
                            uniform_distribution(blocks)
                        } else {
                            let mut acc = 0.0;
                            capacity
                                .iter()
                                .map(|c| {
                                    acc += c / total;
                                    acc.min(1.0)
                                })
                                .collect()
                        }
                    }
                }
            }
        };
        Ok(close_distribution(dist))
    }

    /// 生成 scramble 表的查询：原表的所有列加上分层列、分块列
    ///
    /// `rare` 是稀有组中间表（FastConverge 才需要），通常是一个占位表。
    pub fn scramble_query(
        &self,
        original: &TableName,
        rare: Option<Relation>,
        tier_column: &str,
        block_column: &str,
    ) -> Result<SelectQuery> {
        let blocks = self.block_count()?;
        match self {
            ScramblingMethod::Uniform { hash_column, .. } => {
                let block = match hash_column {
                    Some(column) => Expression::Function(
                        "mod".into(),
                        vec![
                            Expression::Function("hash".into(), vec![Expression::column(Some(SOURCE_ALIAS), column)]),
                            Expression::int(blocks as i64),
                        ],
                    ),
                    None => Expression::Function(
                        "floor".into(),
                        vec![Operator::Multiply(
                            Box::new(Expression::Function("rand".into(), vec![])),
                            Box::new(Expression::int(blocks as i64)),
                        )
                        .into()],
                    ),
                };
                Ok(SelectQuery::new(
                    vec![
                        SelectItem::new(Expression::column(Some(SOURCE_ALIAS), "*"), None),
                        SelectItem::aliased(Expression::int(0), tier_column),
                        SelectItem::aliased(block, block_column),
                    ],
                    Relation::base(original.clone(), Some(SOURCE_ALIAS)),
                ))
            }
            ScramblingMethod::FastConverge { primary_column, .. } => {
                let rare = rare.ok_or_else(|| errdata!("fastconverge scrambling needs the rare group table"))?;
                let joined = Relation::Join {
                    left: Box::new(Relation::base(original.clone(), Some(SOURCE_ALIAS))),
                    right: Box::new(rare),
                    kind: JoinType::Left,
                    on: Some(
                        Operator::Eq(
                            Expression::column(Some(SOURCE_ALIAS), primary_column).into(),
                            Expression::column(Some(RARE_ALIAS), primary_column).into(),
                        )
                        .into(),
                    ),
                };
                let tier = Expression::Case(
                    vec![(
                        Operator::Is(Expression::column(Some(RARE_ALIAS), primary_column).into(), Literal::Null).into(),
                        Expression::int(1),
                    )],
                    Some(Box::new(Expression::int(0))),
                );
                let inner = SelectQuery::new(
                    vec![
                        SelectItem::new(Expression::column(Some(SOURCE_ALIAS), "*"), None),
                        SelectItem::aliased(Expression::Function("rand".into(), vec![]), RAND_COLUMN),
                        SelectItem::aliased(tier, tier_column),
                    ],
                    joined,
                );

                let mut per_tier = Vec::new();
                for t in 0..self.tier_count() {
                    let cond: Expression = Operator::Eq(
                        Expression::column(Some(DERIVED_ALIAS), tier_column).into(),
                        Expression::int(t as i64).into(),
                    )
                    .into();
                    per_tier.push((cond, self.block_case(t, blocks)?));
                }
                let block = Expression::Case(per_tier, Some(Box::new(Expression::int(blocks as i64 - 1))));
                Ok(SelectQuery::new(
                    vec![
                        SelectItem::new(Expression::column(Some(DERIVED_ALIAS), "*"), None),
                        SelectItem::aliased(block, block_column),
                    ],
                    Relation::Derived { query: Box::new(inner), alias: DERIVED_ALIAS.to_string() },
                ))
            }
        }
    }

    /// `case when rand < p0 then 0 when rand < p1 then 1 ... else B-1 end`
    fn block_case(&self, tier: usize, blocks: usize) -> Result<Expression> {
        let dist = self.cumulative_distribution(tier)?;
        let rand = Expression::column(Some(DERIVED_ALIAS), RAND_COLUMN);
        let mut branches: Vec<(Expression, Expression)> = Vec::new();
        let mut previous = 0.0;
        for (b, p) in dist.iter().enumerate().take(blocks.saturating_sub(1)) {
            // 概率没有增长的分块不会分到任何行
            if *p > previous {
                branches.push((
                    Operator::Less(rand.clone().into(), Expression::float(*p).into()).into(),
                    Expression::int(b as i64),
                ));
            }
            previous = *p;
        }
        let last = Expression::int(blocks as i64 - 1);
        if branches.is_empty() {
            return Ok(last);
        }
        Ok(Expression::Case(branches, Some(Box::new(last))))
    }
}

fn uniform_distribution(blocks: usize) -> Vec<f64> {
    (0..blocks).map(|b| (b + 1) as f64 / blocks as f64).collect()
}

/// 消除浮点误差：保证单调并且最后一项恰好是 1.0
fn close_distribution(mut dist: Vec<f64>) -> Vec<f64> {
    let mut max = 0.0f64;
    for p in dist.iter_mut() {
        max = max.max(p.clamp(0.0, 1.0));
        *p = max;
    }
    if let Some(last) = dist.last_mut() {
        *last = 1.0;
    }
    dist
}

fn scalar_u64(result: &DbmsQueryResult) -> Result<u64> {
    let value = result.scalar().ok_or_else(|| errdata!("statistics query returned no rows"))?;
    value
        .as_f64()
        .filter(|v| *v >= 0.0)
        .map(|v| v.round() as u64)
        .ok_or_else(|| errdata!("statistics query returned a non-numeric value {value}"))
}
