//! 抽样候选与抽样方案。
//!
//! 每个聚合表达式为它涉及的每个表引用给出一组候选（[`SampleGroup`]），
//! [`SamplePlans`] 依次把这些候选折叠进工作集，最后按代价阈值选出一个 [`SamplePlan`]。
//! 所有集合都有确定的顺序，同样的输入总是得到同样的方案。

use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools;
use tracing::debug;

use crate::scramble::ScrambleMeta;
use crate::types::TableName;

/// 一个表引用的一种读取方式：读某个 scramble 的前若干分块，或者读原表
#[derive(Clone, Debug, PartialEq)]
pub struct SampleGroup {
    /// 查询中的表引用（别名，没有别名时为表名）
    pub table_ref: String,
    pub original: TableName,
    /// 为空表示读原表
    pub scramble: Option<Arc<ScrambleMeta>>,
    /// 读取前多少个分块
    pub blocks: usize,
    /// 读取哪些分层
    pub tiers: Vec<usize>,
    /// 估计读取的行数
    pub cost: f64,
    /// 精度得分：所读分层中最小的入样概率，读原表时为 1
    pub sampling_ratio: f64,
}

impl SampleGroup {
    pub fn exact(table_ref: impl Into<String>, original: TableName, row_count: u64) -> Self {
        Self {
            table_ref: table_ref.into(),
            original,
            scramble: None,
            blocks: 0,
            tiers: Vec::new(),
            cost: row_count as f64,
            sampling_ratio: 1.0,
        }
    }

    /// 读取 scramble 前 `blocks` 个分块
    pub fn sampled(table_ref: impl Into<String>, meta: Arc<ScrambleMeta>, blocks: usize, tiers: Vec<usize>) -> Self {
        // 未经校验的元数据可能没有分块
        let block_count = meta.block_count.max(1);
        let blocks = blocks.clamp(1, block_count);
        let cost = meta.original_row_count as f64 * blocks as f64 / block_count as f64;
        let sampling_ratio = tiers
            .iter()
            .map(|t| meta.inclusion_probability(*t, blocks))
            .fold(1.0, f64::min);
        Self {
            table_ref: table_ref.into(),
            original: meta.original.clone(),
            scramble: Some(meta),
            blocks,
            tiers,
            cost,
            sampling_ratio,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.scramble.is_none()
    }

    /// 候选的标识，用于去重和兼容性判断
    fn key(&self) -> (Option<&TableName>, usize, &[usize]) {
        (self.scramble.as_ref().map(|m| &m.table), self.blocks, &self.tiers)
    }

    pub fn same_source(&self, other: &SampleGroup) -> bool {
        self.table_ref == other.table_ref && self.key() == other.key()
    }
}

/// 为查询中每个表引用各选定一个读取方式
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplePlan {
    groups: BTreeMap<String, SampleGroup>,
}

impl SamplePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, table_ref: &str) -> Option<&SampleGroup> {
        self.groups.get(table_ref)
    }

    pub fn groups(&self) -> impl Iterator<Item = &SampleGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn cost(&self) -> f64 {
        self.groups.values().map(|g| g.cost).sum()
    }

    /// 联合入样概率
    pub fn precision(&self) -> f64 {
        self.groups.values().map(|g| g.sampling_ratio).product()
    }

    /// 是否全部读原表
    pub fn is_exact(&self) -> bool {
        self.groups.values().all(SampleGroup::is_exact)
    }

    /// 把一组候选并入方案，同一个表引用已有不同的选择时返回 None
    fn merge(&self, groups: &[&SampleGroup]) -> Option<SamplePlan> {
        let mut merged = self.clone();
        for group in groups {
            match merged.groups.get(&group.table_ref) {
                Some(existing) if !existing.same_source(group) => return None,
                Some(_) => {}
                None => {
                    merged.groups.insert(group.table_ref.clone(), (*group).clone());
                }
            }
        }
        Some(merged)
    }

    fn same_choice(&self, other: &SamplePlan) -> bool {
        self.groups.len() == other.groups.len()
            && self.groups.iter().zip(other.groups.iter()).all(|((ka, a), (kb, b))| ka == kb && a.same_source(b))
    }
}

/// 一个聚合表达式的候选：表引用 -> 可选的读取方式
pub type ExpressionCandidates = BTreeMap<String, Vec<SampleGroup>>;

/// 逐个表达式累积的方案工作集
#[derive(Clone, Debug, PartialEq)]
pub struct SamplePlans {
    plans: Vec<SamplePlan>,
}

impl Default for SamplePlans {
    fn default() -> Self {
        Self { plans: vec![SamplePlan::new()] }
    }
}

impl SamplePlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plans(&self) -> &[SamplePlan] {
        &self.plans
    }

    /// 并入一个新表达式的候选
    ///
    /// 对工作集中的每个方案，枚举新表达式各表引用候选的笛卡尔积，保留与方案兼容的组合。
    /// 共享表引用的表达式因此会落到同一个读取方式上。
    pub fn consolidate_new_expr(&mut self, candidates: &ExpressionCandidates) {
        let lists: Vec<&Vec<SampleGroup>> = candidates.values().filter(|l| !l.is_empty()).collect();
        if lists.is_empty() {
            return;
        }
        let mut next: Vec<SamplePlan> = Vec::new();
        for plan in &self.plans {
            for combination in lists.iter().map(|l| l.iter()).multi_cartesian_product() {
                if let Some(merged) = plan.merge(&combination) {
                    if !next.iter().any(|p| p.same_choice(&merged)) {
                        next.push(merged);
                    }
                }
            }
        }
        // 至少存在全部读原表的组合，正常不会为空
        if !next.is_empty() {
            self.plans = next;
        }
    }

    /// 选择方案：代价不超过 `最低代价 * (1 + ratio)` 的方案中精度最高的，精度相同取代价低的
    ///
    /// `ratio = 0` 时总是选最低代价的方案。
    pub fn best_plan(&self, relative_cost_ratio: f64) -> SamplePlan {
        let ideal = self.plans.iter().map(SamplePlan::cost).fold(f64::INFINITY, f64::min);
        let budget = ideal * (1.0 + relative_cost_ratio.max(0.0));
        let mut best: Option<&SamplePlan> = None;
        for plan in self.plans.iter().filter(|p| p.cost() <= budget + f64::EPSILON * budget.abs().max(1.0)) {
            best = match best {
                None => Some(plan),
                Some(current) => {
                    let better = plan.precision() > current.precision()
                        || (plan.precision() == current.precision() && plan.cost() < current.cost());
                    Some(if better { plan } else { current })
                }
            };
        }
        let chosen = best.cloned().unwrap_or_default();
        debug!(
            "选中抽样方案: 代价 {:.1}（最低 {:.1}），精度 {:.4}，{} 个表引用",
            chosen.cost(),
            ideal,
            chosen.precision(),
            chosen.len()
        );
        chosen
    }
}

/// 把每个聚合表达式的候选依次折叠，选出最终方案
pub fn consolidate(candidates_per_expression: &[ExpressionCandidates], relative_cost_ratio: f64) -> SamplePlan {
    let mut plans = SamplePlans::new();
    for candidates in candidates_per_expression {
        plans.consolidate_new_expr(candidates);
    }
    plans.best_plan(relative_cost_ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scramble::meta::tests::uniform_meta;

    fn orders_candidates(blocks: &[usize]) -> ExpressionCandidates {
        let meta = Arc::new(uniform_meta("s", "orders", 10, 1000));
        let mut list: Vec<SampleGroup> =
            blocks.iter().map(|b| SampleGroup::sampled("o", meta.clone(), *b, vec![0])).collect();
        list.push(SampleGroup::exact("o", meta.original.clone(), 1000));
        BTreeMap::from([("o".to_string(), list)])
    }

    #[test]
    fn test_zero_ratio_picks_min_cost() {
        let plan = consolidate(&[orders_candidates(&[1, 5])], 0.0);
        let group = plan.group("o").unwrap();
        assert_eq!(group.blocks, 1);
        assert_eq!(plan.cost(), 100.0);
    }

    #[test]
    fn test_ratio_allows_more_precise_plan() {
        // 5 个分块的代价是 1 个分块的 5 倍，阈值 4 以内都选不到
        let plan = consolidate(&[orders_candidates(&[1, 5])], 3.9);
        assert_eq!(plan.group("o").unwrap().blocks, 1);
        let plan = consolidate(&[orders_candidates(&[1, 5])], 4.0);
        assert_eq!(plan.group("o").unwrap().blocks, 5);
        // 阈值足够大时选原表
        let plan = consolidate(&[orders_candidates(&[1, 5])], 100.0);
        assert!(plan.is_exact());
    }

    #[test]
    fn test_consolidate_is_idempotent() {
        let input = [orders_candidates(&[2, 3])];
        let first = consolidate(&input, 0.1);
        let second = consolidate(&input, 0.1);
        assert_eq!(first, second);
        assert_eq!(first.group("o").unwrap().blocks, 2);
    }

    #[test]
    fn test_shared_reference_is_consistent() {
        let meta = Arc::new(uniform_meta("s", "orders", 10, 1000));
        // 第二个表达式只能读原表或者 4 个分块
        let second = BTreeMap::from([(
            "o".to_string(),
            vec![
                SampleGroup::sampled("o", meta.clone(), 4, vec![0]),
                SampleGroup::exact("o", meta.original.clone(), 1000),
            ],
        )]);
        let mut plans = SamplePlans::new();
        plans.consolidate_new_expr(&orders_candidates(&[1, 4]));
        plans.consolidate_new_expr(&second);
        assert_eq!(plans.plans().len(), 2);
        let plan = plans.best_plan(0.0);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.group("o").unwrap().blocks, 4);
    }

    #[test]
    fn test_join_multiplies_precision() {
        let orders = Arc::new(uniform_meta("s", "orders", 10, 1000));
        let items = Arc::new(uniform_meta("s", "items", 4, 400));
        let candidates = BTreeMap::from([
            ("o".to_string(), vec![SampleGroup::sampled("o", orders, 1, vec![0])]),
            ("i".to_string(), vec![SampleGroup::sampled("i", items, 2, vec![0])]),
        ]);
        let plan = consolidate(&[candidates], 0.0);
        assert_eq!(plan.len(), 2);
        assert!((plan.precision() - 0.05).abs() < 1e-12);
        assert_eq!(plan.cost(), 300.0);
    }

    #[test]
    fn test_sampled_without_blocks() {
        let mut meta = uniform_meta("s", "orders", 10, 1000);
        meta.block_count = 0;
        let group = SampleGroup::sampled("o", Arc::new(meta), 3, vec![0]);
        assert_eq!(group.blocks, 1);
        assert_eq!(group.cost, 1000.0);
    }
}
