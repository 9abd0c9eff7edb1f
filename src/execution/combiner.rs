use tracing::debug;

use crate::db_error::Result;
use crate::errplan;
use crate::execution::token::{AggMeta, ExecutionInfoToken};
use crate::sql::parser::ast::Expression;
use crate::sql::{Relation, SelectItem, SelectQuery};

const LEFT_ALIAS: &str = "verdictdb_left";
const RIGHT_ALIAS: &str = "verdictdb_right";
const UNION_ALIAS: &str = "verdictdb_union";

/// 两个相邻分区部分聚合结果的合并查询
///
/// 左右两个上游分别对应占位表 0 和 1。先 union all，再按分组列（以及分层列）重新聚合：
/// min/max 保持原函数，其余聚合列求和。
///
/// 任意一侧缺少 AggMeta 时使用另一侧的；两侧都缺少时只做 union，不重新聚合。
pub fn combine_query(left: &ExecutionInfoToken, right: &ExecutionInfoToken) -> Result<(SelectQuery, Option<AggMeta>)> {
    let union = Relation::UnionAll {
        left: Box::new(SelectQuery::star(Relation::Placeholder { slot: 0, alias: LEFT_ALIAS.to_string() })),
        right: Box::new(SelectQuery::star(Relation::Placeholder { slot: 1, alias: RIGHT_ALIAS.to_string() })),
        alias: UNION_ALIAS.to_string(),
    };

    let meta = match (left.agg_meta(), right.agg_meta()) {
        (Some(l), Some(r)) => l.merge(r)?,
        (Some(meta), None) | (None, Some(meta)) => meta.clone(),
        (None, None) => {
            debug!("合并节点的上游都没有聚合元信息，只做 union");
            return Ok((SelectQuery::star(union), None));
        }
    };
    if meta.aggregates.is_empty() {
        return Err(errplan!("partial aggregate has no aggregate columns to combine"));
    }

    let mut select = Vec::new();
    let mut group_by = Vec::new();
    for alias in meta.group_aliases.iter().chain(meta.tier_alias.iter()) {
        let col = Expression::column(Some(UNION_ALIAS), alias);
        select.push(SelectItem::aliased(col.clone(), alias));
        group_by.push(col);
    }
    for agg in &meta.aggregates {
        select.push(SelectItem::aliased(
            Expression::agg(agg.combine_function(), Expression::column(Some(UNION_ALIAS), &agg.alias)),
            &agg.alias,
        ));
    }
    let mut query = SelectQuery::new(select, union);
    query.group_by = group_by;
    Ok((query, Some(meta)))
}
