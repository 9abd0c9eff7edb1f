use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cfg::Config;
use crate::db_error::Result;
use crate::relation::approx::{estimate_select, ApproxRelation};
use crate::relation::exact::{ExactRelation, RelId, RelationTree};
use crate::relation::sample::{consolidate, ExpressionCandidates, SampleGroup, SamplePlan};
use crate::scramble::{ScrambleMeta, ScrambleMetaSet, UNIFORM};
use crate::sql::parser::ast::{AggFunction, Expression};

/// 把精确关系树改写成读取 scramble 的近似关系树
pub struct ApproxRewriter<'a> {
    catalog: &'a ScrambleMetaSet,
    relative_cost_ratio: f64,
    target_sampling_ratio: f64,
}

/// 一个聚合节点选中的抽样：(scramble, 表引用, 分块数)
type AggSamples = Vec<(Arc<ScrambleMeta>, String, usize)>;

impl<'a> ApproxRewriter<'a> {
    pub fn new(catalog: &'a ScrambleMetaSet, relative_cost_ratio: f64, target_sampling_ratio: f64) -> Self {
        Self { catalog, relative_cost_ratio, target_sampling_ratio }
    }

    pub fn from_config(catalog: &'a ScrambleMetaSet, config: &Config) -> Self {
        Self::new(catalog, config.relative_target_cost, config.target_sampling_ratio)
    }

    /// 为聚合节点 `agg` 中的一个聚合调用收集候选
    ///
    /// 子树中每个有 scramble 的单表都给出候选列表，列表中总是包含读原表这一项。
    /// `count(distinct c)` 只能使用按 c 哈希分块的 uniform scramble，
    /// 因为只有这样同一个取值的行才会全部落在同一个分块里。
    pub fn find_sample(&self, tree: &RelationTree, agg: RelId, call: &Expression) -> Result<ExpressionCandidates> {
        let leaves = tree.sampling_leaves(agg)?;
        let distinct_column = match call {
            Expression::Aggregate(AggFunction::CountDistinct, arg) => match arg.as_ref() {
                Expression::Column(q, name) => Some((q.as_ref().map(|q| q.to_lowercase()), name.to_lowercase())),
                // 表达式上的 count distinct 无法用 scramble 估计
                _ => Some((None, String::new())),
            },
            _ => None,
        };

        let mut candidates = ExpressionCandidates::new();
        for leaf in &leaves {
            let ExactRelation::Single { table, .. } = tree.relation(*leaf)? else {
                continue;
            };
            let scrambles = self.catalog.scrambles_of(table)?;
            if scrambles.is_empty() {
                continue;
            }
            let table_ref = tree.table_ref(*leaf)?;
            let row_count = scrambles.iter().map(|m| m.original_row_count).max().unwrap_or_default();
            let mut list: Vec<SampleGroup> = Vec::new();
            for meta in scrambles {
                if let Some((qualifier, column)) = &distinct_column {
                    let owner = match qualifier {
                        Some(q) => *q == table_ref || *q == table.table,
                        None => leaves.len() == 1,
                    };
                    let hashed_on_column = meta.method == UNIFORM
                        && meta.primary_column.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(column));
                    if !owner || !hashed_on_column {
                        continue;
                    }
                }
                let blocks = meta.blocks_for_ratio(self.target_sampling_ratio);
                let tiers = (0..meta.tier_count).collect();
                list.push(SampleGroup::sampled(table_ref.clone(), meta, blocks, tiers));
            }
            list.push(SampleGroup::exact(table_ref.clone(), table.clone(), row_count));
            candidates.insert(table_ref, list);
        }
        Ok(candidates)
    }

    pub fn consolidate(&self, candidates: &[ExpressionCandidates]) -> SamplePlan {
        consolidate(candidates, self.relative_cost_ratio)
    }

    /// 改写 `root` 为根的关系树
    ///
    /// 每个聚合节点独立选择抽样方案，只影响它和下一个嵌套聚合节点之间的单表。
    /// 找不到任何 scramble 时返回与原树等价的精确关系。
    pub fn approximate(&self, tree: &RelationTree, root: RelId) -> Result<ApproxRelation> {
        let mut leaf_choices: HashMap<RelId, SampleGroup> = HashMap::new();
        let mut agg_samples: HashMap<RelId, AggSamples> = HashMap::new();

        for id in tree.subtree(root)? {
            let ExactRelation::Aggregated { select, .. } = tree.relation(id)? else {
                continue;
            };
            let calls: Vec<Expression> = select.iter().flat_map(|item| item.expr.aggregates()).collect();
            let candidates = calls
                .iter()
                .map(|call| self.find_sample(tree, id, call))
                .collect::<Result<Vec<_>>>()?;
            if candidates.iter().all(BTreeMap::is_empty) {
                debug!("聚合节点 {id} 涉及的表都没有 scramble，保持精确查询");
                continue;
            }
            let plan = self.consolidate(&candidates);
            let refs: BTreeMap<String, RelId> = tree
                .sampling_leaves(id)?
                .into_iter()
                .map(|leaf| tree.table_ref(leaf).map(|r| (r, leaf)))
                .collect::<Result<_>>()?;
            let mut samples = AggSamples::new();
            for group in plan.groups().filter(|g| !g.is_exact()) {
                let (Some(leaf), Some(meta)) = (refs.get(&group.table_ref), &group.scramble) else {
                    continue;
                };
                info!(
                    "表引用 {} 使用 scramble {}，读取 {}/{} 个分块",
                    group.table_ref, meta.table, group.blocks, meta.block_count
                );
                samples.push((meta.clone(), group.table_ref.clone(), group.blocks));
                leaf_choices.insert(*leaf, group.clone());
            }
            if !samples.is_empty() {
                agg_samples.insert(id, samples);
            }
        }

        ApproxRelation::build(
            tree,
            root,
            &|id| {
                Ok(leaf_choices.get(&id).map(|group| ApproxRelation::Sample {
                    group: group.clone(),
                    alias: group.table_ref.clone(),
                }))
            },
            &|id, select| {
                Ok(match agg_samples.get(&id) {
                    Some(samples) => estimate_select(select, samples),
                    None => select.to_vec(),
                })
            },
        )
    }
}
