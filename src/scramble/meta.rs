use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db_error::Result;
use crate::errdata;
use crate::types::TableName;

/// 一个 scramble 表的描述，构建完成后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrambleMeta {
    /// scramble 表
    pub table: TableName,
    /// 原始表
    pub original: TableName,
    pub block_column: String,
    /// 分块数，块下标为 [0, block_count)
    pub block_count: usize,
    pub tier_column: String,
    /// 分层数，层下标为 [0, tier_count)
    pub tier_count: usize,
    /// tier -> 每个分块的累计入样概率
    pub cumulative_distribution: BTreeMap<usize, Vec<f64>>,
    /// 构建时使用的抽样方法（小写）
    pub method: String,
    /// 分块哈希或者分层所依据的列
    pub primary_column: Option<String>,
    /// 构建时原始表的行数
    pub original_row_count: u64,
}

impl ScrambleMeta {
    /// 检查分层、分块下标连续以及累计分布单调
    pub fn validate(&self) -> Result<()> {
        if self.block_count == 0 || self.tier_count == 0 {
            return Err(errdata!("scramble {} must have at least one block and one tier", self.table));
        }
        let tiers: Vec<usize> = self.cumulative_distribution.keys().copied().collect();
        if tiers != (0..self.tier_count).collect::<Vec<_>>() {
            return Err(errdata!("scramble {} has non-contiguous tiers {tiers:?}", self.table));
        }
        for (tier, dist) in &self.cumulative_distribution {
            if dist.len() != self.block_count {
                return Err(errdata!(
                    "tier {tier} of {} has {} probabilities for {} blocks",
                    self.table,
                    dist.len(),
                    self.block_count
                ));
            }
            if dist.windows(2).any(|w| w[1] < w[0]) || dist.iter().any(|p| !(0.0..=1.0).contains(p)) {
                return Err(errdata!("tier {tier} of {} is not a cumulative distribution", self.table));
            }
        }
        Ok(())
    }

    /// 读取前 `blocks` 个分块时，tier 中一行被读到的概率
    pub fn inclusion_probability(&self, tier: usize, blocks: usize) -> f64 {
        self.cumulative_distribution
            .get(&tier)
            .and_then(|dist| dist.get(blocks.min(dist.len()).checked_sub(1)?))
            .copied()
            .unwrap_or(0.0)
    }

    /// 读取前 `blocks` 个分块后，所有层中最小的入样概率
    pub fn sampling_ratio(&self, blocks: usize) -> f64 {
        (0..self.tier_count)
            .map(|tier| self.inclusion_probability(tier, blocks))
            .fold(1.0, f64::min)
    }

    /// 使所有层的入样概率都达到 `ratio` 需要读取的最少分块数
    pub fn blocks_for_ratio(&self, ratio: f64) -> usize {
        (1..=self.block_count)
            .find(|b| self.sampling_ratio(*b) >= ratio)
            .unwrap_or(self.block_count)
    }
}

/// 进程内共享的 scramble 元数据目录
///
/// 以原始表为键，一个原始表可以有多个 scramble。
/// 只在 scramble 完成后登记，同名 scramble 表替换旧的记录，读操作可以并发进行。
#[derive(Clone, Default)]
pub struct ScrambleMetaSet {
    inner: Arc<RwLock<HashMap<TableName, Vec<Arc<ScrambleMeta>>>>>,
}

impl ScrambleMetaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个 scramble，同名 scramble 表会被替换
    pub fn add(&self, meta: ScrambleMeta) -> Result<()> {
        meta.validate()?;
        let mut map = self.inner.write()?;
        let entry = map.entry(meta.original.clone()).or_default();
        entry.retain(|m| m.table != meta.table);
        info!("注册 scramble {} -> {}", meta.original, meta.table);
        entry.push(Arc::new(meta));
        Ok(())
    }

    /// 原始表对应的全部 scramble
    pub fn scrambles_of(&self, original: &TableName) -> Result<Vec<Arc<ScrambleMeta>>> {
        Ok(self.inner.read()?.get(original).cloned().unwrap_or_default())
    }

    pub fn is_scrambled(&self, original: &TableName) -> Result<bool> {
        Ok(self.inner.read()?.get(original).is_some_and(|v| !v.is_empty()))
    }

    /// 全部 scramble，按 scramble 表名排序
    pub fn all(&self) -> Result<Vec<Arc<ScrambleMeta>>> {
        let mut all: Vec<Arc<ScrambleMeta>> = self.inner.read()?.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(all)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.read()?.values().map(Vec::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 以 JSON 格式持久化，按 `schema.table` 排序保证输出稳定
    pub fn save(&self, path: &Path) -> Result<()> {
        let all = self.all()?;
        let all: Vec<&ScrambleMeta> = all.iter().map(Arc::as_ref).collect();
        std::fs::write(path, serde_json::to_string_pretty(&all)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let all: Vec<ScrambleMeta> = serde_json::from_str(&content)?;
        let set = Self::new();
        for meta in all {
            set.add(meta)?;
        }
        Ok(set)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 单层均匀分布的元数据
    pub(crate) fn uniform_meta(schema: &str, table: &str, blocks: usize, rows: u64) -> ScrambleMeta {
        let dist = (0..blocks).map(|b| (b + 1) as f64 / blocks as f64).collect();
        ScrambleMeta {
            table: TableName::new(schema, format!("{table}_scrambled")),
            original: TableName::new(schema, table),
            block_column: "verdictdbblock".into(),
            block_count: blocks,
            tier_column: "verdictdbtier".into(),
            tier_count: 1,
            cumulative_distribution: BTreeMap::from([(0, dist)]),
            method: "uniform".into(),
            primary_column: None,
            original_row_count: rows,
        }
    }

    /// 两层的 FastConverge 元数据：第 0 层在第一个分块内全部读到，第 1 层均匀分布
    pub(crate) fn fast_converge_meta(schema: &str, table: &str, blocks: usize, rows: u64) -> ScrambleMeta {
        let mut meta = uniform_meta(schema, table, blocks, rows);
        let rest = meta.cumulative_distribution[&0].clone();
        meta.tier_count = 2;
        meta.cumulative_distribution = BTreeMap::from([(0, vec![1.0; blocks]), (1, rest)]);
        meta.method = "fastconverge".into();
        meta.primary_column = Some("city".into());
        meta
    }

    #[test]
    fn test_validate() {
        let mut meta = uniform_meta("s", "orders", 4, 100);
        assert!(meta.validate().is_ok());
        meta.cumulative_distribution.insert(0, vec![0.5, 0.4, 0.9, 1.0]);
        assert!(meta.validate().is_err());
        meta.cumulative_distribution.insert(2, vec![0.25, 0.5, 0.75, 1.0]);
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_ratio() {
        let meta = uniform_meta("s", "orders", 10, 100);
        assert_eq!(meta.blocks_for_ratio(0.1), 1);
        assert_eq!(meta.blocks_for_ratio(0.35), 4);
        assert_eq!(meta.blocks_for_ratio(1.0), 10);
        assert!((meta.sampling_ratio(4) - 0.4).abs() < 1e-12);
        assert_eq!(meta.inclusion_probability(0, 0), 0.0);
        assert_eq!(meta.inclusion_probability(3, 2), 0.0);
    }

    #[test]
    fn test_degenerate_meta_does_not_panic() {
        let mut meta = uniform_meta("s", "orders", 4, 100);
        meta.cumulative_distribution.insert(0, vec![]);
        assert_eq!(meta.inclusion_probability(0, 2), 0.0);
        assert_eq!(meta.sampling_ratio(2), 0.0);
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_catalog() -> Result<()> {
        let set = ScrambleMetaSet::new();
        set.add(uniform_meta("s", "orders", 4, 100))?;
        set.add(uniform_meta("s", "orders", 8, 100))?;
        assert_eq!(set.len()?, 1);
        assert!(set.is_scrambled(&TableName::new("S", "Orders"))?);
        assert!(!set.is_scrambled(&TableName::new("s", "items"))?);
        // 同名 scramble 替换旧的记录
        let found = set.scrambles_of(&TableName::new("s", "orders"))?;
        assert_eq!(found.iter().map(|m| m.block_count).collect::<Vec<_>>(), vec![8]);
        Ok(())
    }

    #[test]
    fn test_persist() -> Result<()> {
        let set = ScrambleMetaSet::new();
        set.add(uniform_meta("s", "orders", 4, 100))?;
        set.add(uniform_meta("s", "items", 2, 10))?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scrambles.json");
        set.save(&path)?;
        let loaded = ScrambleMetaSet::load(&path)?;
        assert_eq!(loaded.len()?, 2);
        assert_eq!(
            loaded.scrambles_of(&TableName::new("s", "items"))?[0].as_ref(),
            &uniform_meta("s", "items", 2, 10)
        );
        Ok(())
    }
}
