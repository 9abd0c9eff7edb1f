use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db_error::Result;
use crate::errplan;
use crate::sql::parser::ast::AggFunction;
use crate::types::{DbmsQueryResult, TableName};

/// 部分聚合结果中的一个聚合列
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggColumn {
    pub alias: String,
    pub function: AggFunction,
}

impl AggColumn {
    pub fn new(alias: impl Into<String>, function: AggFunction) -> Self {
        Self { alias: alias.into().to_lowercase(), function }
    }

    /// 合并两个分区时使用的函数：min/max 保持不变，其余求和
    pub fn combine_function(&self) -> AggFunction {
        if self.function.is_min_max() {
            self.function
        } else {
            AggFunction::Sum
        }
    }
}

/// 最终展示的一列
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalColumn {
    /// 直接输出一个聚合列（count、sum 需要按分层加权）
    Plain(String),
    /// 两个加权后的聚合列相除，avg 由 sum / count 得到
    Ratio { alias: String, numerator: String, denominator: String },
}

impl FinalColumn {
    pub fn alias(&self) -> &str {
        match self {
            FinalColumn::Plain(alias) => alias,
            FinalColumn::Ratio { alias, .. } => alias,
        }
    }
}

/// 部分聚合结果的形状，供下游合并节点和最终展示使用
///
/// avg 在上游已经拆成 sum 和 count 两列，这里不会出现 avg。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggMeta {
    /// 分组列的输出别名，按查询中的顺序
    pub group_aliases: Vec<String>,
    pub aggregates: Vec<AggColumn>,
    /// 按分层分组时的分层列别名
    pub tier_alias: Option<String>,
    /// 结果来自哪个 scramble
    pub scramble: Option<TableName>,
    /// 已经覆盖的分块区间 [start, end)
    pub block_range: Option<(usize, usize)>,
    /// 最终输出的聚合列，为空时按 aggregates 原样输出
    pub finals: Vec<FinalColumn>,
}

impl AggMeta {
    /// 全部输出列名：分组列、分层列、聚合列
    pub fn columns(&self) -> Vec<String> {
        self.group_aliases
            .iter()
            .chain(self.tier_alias.iter())
            .cloned()
            .chain(self.aggregates.iter().map(|a| a.alias.clone()))
            .collect()
    }

    /// 最终输出的聚合列
    pub fn final_columns(&self) -> Vec<FinalColumn> {
        if self.finals.is_empty() {
            self.aggregates.iter().map(|a| FinalColumn::Plain(a.alias.clone())).collect()
        } else {
            self.finals.clone()
        }
    }

    pub fn aggregate(&self, alias: &str) -> Option<&AggColumn> {
        self.aggregates.iter().find(|a| a.alias == alias)
    }

    /// 两个部分结果能否直接 union
    pub fn same_shape(&self, other: &AggMeta) -> bool {
        self.group_aliases == other.group_aliases
            && self.tier_alias == other.tier_alias
            && self.aggregates == other.aggregates
    }

    /// 合并两个相邻分区的元信息，分块区间取并集
    pub fn merge(&self, other: &AggMeta) -> Result<AggMeta> {
        if !self.same_shape(other) {
            return Err(errplan!(
                "cannot combine partial aggregates with columns {:?} and {:?}",
                self.columns(),
                other.columns()
            ));
        }
        let block_range = match (self.block_range, other.block_range) {
            (Some((a0, a1)), Some((b0, b1))) => Some((a0.min(b0), a1.max(b1))),
            (range, None) | (None, range) => range,
        };
        Ok(AggMeta { block_range, ..self.clone() })
    }
}

/// 令牌中的一个值
#[derive(Clone, Debug, PartialEq)]
pub enum TokenValue {
    Table(TableName),
    Rows(DbmsQueryResult),
    AggMeta(AggMeta),
    UpdateCount(u64),
}

pub const TABLE_KEY: &str = "table";
pub const ROWS_KEY: &str = "queryResult";
pub const AGG_META_KEY: &str = "aggMeta";
pub const UPDATE_KEY: &str = "updateCount";

/// 节点执行完成后沿订阅边传给下游的有序键值集合
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionInfoToken {
    values: BTreeMap<String, TokenValue>,
}

impl ExecutionInfoToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: TokenValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&TokenValue> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn with_table(mut self, table: TableName) -> Self {
        self.set(TABLE_KEY, TokenValue::Table(table));
        self
    }

    pub fn with_agg_meta(mut self, meta: Option<AggMeta>) -> Self {
        if let Some(meta) = meta {
            self.set(AGG_META_KEY, TokenValue::AggMeta(meta));
        }
        self
    }

    /// 上游产生的中间表
    pub fn table(&self) -> Option<&TableName> {
        match self.get(TABLE_KEY) {
            Some(TokenValue::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn agg_meta(&self) -> Option<&AggMeta> {
        match self.get(AGG_META_KEY) {
            Some(TokenValue::AggMeta(meta)) => Some(meta),
            _ => None,
        }
    }

    pub fn rows(&self) -> Option<&DbmsQueryResult> {
        match self.get(ROWS_KEY) {
            Some(TokenValue::Rows(rows)) => Some(rows),
            _ => None,
        }
    }

    pub fn into_rows(mut self) -> Option<DbmsQueryResult> {
        match self.values.remove(ROWS_KEY) {
            Some(TokenValue::Rows(rows)) => Some(rows),
            _ => None,
        }
    }
}
