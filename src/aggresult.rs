//! 部分聚合结果的内存合并与最终估计。
//!
//! 分区计划的中间表读回内存后，按分组键合并：min/max 取极值，其余求和。
//! 最终展示时按覆盖到的分块前缀给每个分层加权，avg 由加权 sum / 加权 count 得到。

use std::collections::BTreeMap;

use crate::db_error::Result;
use crate::errplan;
use crate::execution::{AggMeta, FinalColumn};
use crate::scramble::ScrambleMeta;
use crate::sql::parser::ast::AggFunction;
use crate::types::{ColumnMeta, DataType, DbmsQueryResult, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateFrame {
    meta: AggMeta,
    /// 分组列（含分层列）的列元信息
    key_columns: Vec<ColumnMeta>,
    /// 分组键（分组列 + 分层列） -> 按 meta.aggregates 顺序的聚合值
    rows: BTreeMap<Vec<Value>, Vec<Value>>,
}

impl AggregateFrame {
    /// 按 AggMeta 中的列名从结果集中取列，同一分组出现多次时直接合并
    pub fn from_result(meta: AggMeta, result: &DbmsQueryResult) -> Result<Self> {
        let key_names: Vec<String> = meta.group_aliases.iter().chain(meta.tier_alias.iter()).cloned().collect();
        let lookup = |name: &str| {
            result
                .column_index(name)
                .ok_or_else(|| errplan!("partial result has no column {name}, got {:?}", result.columns))
        };
        let key_index = key_names.iter().map(|n| lookup(n)).collect::<Result<Vec<_>>>()?;
        let agg_index = meta.aggregates.iter().map(|a| lookup(&a.alias)).collect::<Result<Vec<_>>>()?;

        let mut frame = Self {
            key_columns: key_index.iter().map(|i| result.columns[*i].clone()).collect(),
            meta,
            rows: BTreeMap::new(),
        };
        for row in &result.rows {
            let pick = |i: &usize| row.get(*i).cloned().unwrap_or(Value::Null);
            let key = key_index.iter().map(pick).collect();
            let values = agg_index.iter().map(pick).collect();
            frame.add(key, values)?;
        }
        Ok(frame)
    }

    pub fn meta(&self) -> &AggMeta {
        &self.meta
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &[Value]) -> Option<&[Value]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    /// 合并另一个分区的结果，两边的列必须一致
    pub fn merge(&mut self, other: AggregateFrame) -> Result<()> {
        self.meta = self.meta.merge(&other.meta)?;
        for (key, values) in other.rows {
            self.add(key, values)?;
        }
        Ok(())
    }

    fn add(&mut self, key: Vec<Value>, values: Vec<Value>) -> Result<()> {
        let Some(existing) = self.rows.get_mut(&key) else {
            self.rows.insert(key, values);
            return Ok(());
        };
        for ((current, value), column) in existing.iter_mut().zip(values).zip(&self.meta.aggregates) {
            *current = match column.combine_function() {
                AggFunction::Min => extreme(current, value, std::cmp::Ordering::Less),
                AggFunction::Max => extreme(current, value, std::cmp::Ordering::Greater),
                _ => current.checked_add(&value)?,
            };
        }
        Ok(())
    }

    /// 计算最终估计
    ///
    /// 没有 scramble 时结果是精确的，只去掉分层列并计算 avg。
    pub fn finalize(&self, scramble: Option<&ScrambleMeta>) -> Result<DbmsQueryResult> {
        let group_count = self.meta.group_aliases.len();
        let has_tier = self.meta.tier_alias.is_some();
        let blocks = match (scramble, self.meta.block_range) {
            (Some(_), Some((_, end))) => end,
            (Some(meta), None) => meta.block_count,
            (None, _) => 0,
        };

        // 分组 -> 每个聚合列的加权结果
        let mut groups: BTreeMap<Vec<Value>, Vec<Value>> = BTreeMap::new();
        for (key, values) in &self.rows {
            let weight = match (scramble, has_tier) {
                (Some(meta), true) => {
                    let tier = key
                        .get(group_count)
                        .and_then(Value::as_i64)
                        .ok_or_else(|| errplan!("tier value {:?} is not an integer", key.get(group_count)))?;
                    let p = meta.inclusion_probability(tier.max(0) as usize, blocks);
                    if p <= 0.0 {
                        return Err(errplan!("tier {tier} of {} has no rows in the first {blocks} blocks", meta.table));
                    }
                    Some(1.0 / p)
                }
                (Some(meta), false) => Some(1.0 / meta.sampling_ratio(blocks)),
                (None, _) => None,
            };
            let ratio = scramble.map(|m| m.sampling_ratio(blocks));
            let weighted: Vec<Value> = values
                .iter()
                .zip(&self.meta.aggregates)
                .map(|(value, column)| match (column.function, weight, ratio) {
                    (AggFunction::Min | AggFunction::Max, _, _) | (_, None, _) => value.clone(),
                    (AggFunction::CountDistinct, _, Some(ratio)) => scale(value, 1.0 / ratio),
                    (_, Some(w), _) => scale(value, w),
                })
                .collect();

            let group = key[..group_count].to_vec();
            match groups.get_mut(&group) {
                None => {
                    groups.insert(group, weighted);
                }
                Some(existing) => {
                    for ((current, value), column) in existing.iter_mut().zip(weighted).zip(&self.meta.aggregates) {
                        *current = match column.combine_function() {
                            AggFunction::Min => extreme(current, value, std::cmp::Ordering::Less),
                            AggFunction::Max => extreme(current, value, std::cmp::Ordering::Greater),
                            _ => current.checked_add(&value)?,
                        };
                    }
                }
            }
        }

        let finals = self.meta.final_columns();
        let mut columns: Vec<ColumnMeta> = self.key_columns[..group_count].to_vec();
        for column in &finals {
            let data_type = match column {
                FinalColumn::Ratio { .. } => DataType::Float,
                FinalColumn::Plain(_) if scramble.is_some() => DataType::Float,
                FinalColumn::Plain(_) => DataType::Integer,
            };
            columns.push(ColumnMeta::new(column.alias(), data_type));
        }
        let index = |alias: &str| self.meta.aggregates.iter().position(|a| a.alias == alias);
        let mut rows = Vec::with_capacity(groups.len());
        for (key, values) in groups {
            let mut row = key;
            for column in &finals {
                let value = match column {
                    FinalColumn::Plain(alias) => index(alias).map(|i| values[i].clone()).unwrap_or(Value::Null),
                    FinalColumn::Ratio { numerator, denominator, .. } => {
                        let num = index(numerator).and_then(|i| values[i].as_f64());
                        let den = index(denominator).and_then(|i| values[i].as_f64());
                        match (num, den) {
                            (Some(n), Some(d)) if d != 0.0 => Value::Float(n / d),
                            _ => Value::Null,
                        }
                    }
                };
                row.push(value);
            }
            rows.push(row);
        }
        Ok(DbmsQueryResult::new(columns, rows))
    }
}

/// min/max 合并，`Null` 被忽略
fn extreme(current: &Value, value: Value, keep: std::cmp::Ordering) -> Value {
    match (current, value) {
        (Value::Null, v) => v,
        (c, Value::Null) => c.clone(),
        (c, v) => {
            if v.cmp(c) == keep {
                v
            } else {
                c.clone()
            }
        }
    }
}

fn scale(value: &Value, weight: f64) -> Value {
    match value.as_f64() {
        Some(v) => Value::Float(v * weight),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::AggColumn;
    use crate::scramble::meta::tests::uniform_meta;

    fn partial(meta: &AggMeta, rows: Vec<Vec<Value>>) -> DbmsQueryResult {
        let columns = meta.columns().into_iter().map(|c| ColumnMeta::new(c, DataType::Integer)).collect();
        DbmsQueryResult::new(columns, rows)
    }

    fn exact_meta() -> AggMeta {
        AggMeta {
            group_aliases: vec!["dow".into()],
            aggregates: vec![
                AggColumn::new("cnt", AggFunction::Count),
                AggColumn::new("total", AggFunction::Sum),
                AggColumn::new("lo", AggFunction::Min),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_partitions() -> Result<()> {
        let meta = exact_meta();
        let mut a = AggregateFrame::from_result(
            meta.clone(),
            &partial(&meta, vec![vec!["x".into(), Value::Integer(3), Value::Integer(30), Value::Integer(4)]]),
        )?;
        let b = AggregateFrame::from_result(
            meta.clone(),
            &partial(
                &meta,
                vec![vec!["x".into(), Value::Integer(2), Value::Integer(25), Value::Null], vec!["y".into(), Value::Integer(1), Value::Integer(7), Value::Integer(7)]],
            ),
        )?;
        a.merge(b)?;
        assert_eq!(a.len(), 2);
        assert_eq!(a.get(&[Value::from("x")]), Some(&[Value::Integer(5), Value::Integer(55), Value::Integer(4)][..]));

        let result = a.finalize(None)?;
        assert_eq!(result.rows[0], vec![Value::from("x"), Value::Integer(5), Value::Integer(55), Value::Integer(4)]);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() -> Result<()> {
        let meta = exact_meta();
        let mut a = AggregateFrame::from_result(meta.clone(), &partial(&meta, vec![]))?;
        let mut other = exact_meta();
        other.aggregates.pop();
        let b = AggregateFrame::from_result(other.clone(), &partial(&other, vec![]))?;
        assert!(a.merge(b).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_column() {
        let meta = exact_meta();
        let result = DbmsQueryResult::new(vec![ColumnMeta::new("dow", DataType::String)], vec![]);
        assert!(AggregateFrame::from_result(meta, &result).is_err());
    }

    #[test]
    fn test_weighted_estimate() -> Result<()> {
        let scramble = uniform_meta("s", "orders", 10, 1000);
        let meta = AggMeta {
            group_aliases: vec!["dow".into()],
            aggregates: vec![
                AggColumn::new("cnt", AggFunction::Count),
                AggColumn::new("avg_price_sum", AggFunction::Sum),
                AggColumn::new("avg_price_count", AggFunction::Count),
            ],
            tier_alias: Some("verdictdbtier".into()),
            scramble: Some(scramble.table.clone()),
            block_range: Some((0, 5)),
            finals: vec![
                FinalColumn::Plain("cnt".into()),
                FinalColumn::Ratio {
                    alias: "avg_price".into(),
                    numerator: "avg_price_sum".into(),
                    denominator: "avg_price_count".into(),
                },
            ],
        };
        let frame = AggregateFrame::from_result(
            meta.clone(),
            &partial(&meta, vec![vec!["mon".into(), Value::Integer(0), Value::Integer(40), Value::Integer(400), Value::Integer(40)]]),
        )?;
        let result = frame.finalize(Some(&scramble))?;
        let names: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["dow", "cnt", "avg_price"]);
        // 读了一半分块，计数放大两倍，平均值不变
        assert_eq!(result.rows, vec![vec![Value::from("mon"), Value::Float(80.0), Value::Float(10.0)]]);
        Ok(())
    }
}
