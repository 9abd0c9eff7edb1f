//! 精确关系树。
//!
//! 节点放在一个扁平的数组里，用下标互相引用。子节点总是先于父节点加入，
//! 所以下标顺序就是一个自底向上的遍历顺序，所有遍历都不需要递归。

use std::collections::BTreeSet;

use tracing::warn;

use crate::db_error::{Error, Result};
use crate::errplan;
use crate::sql::parser::ast::{self, Direction, Expression, JoinType};
use crate::sql::SelectItem;
use crate::types::TableName;

/// 关系树中节点的下标
pub type RelId = usize;

/// 精确关系，集合是封闭的
#[derive(Clone, Debug, PartialEq)]
pub enum ExactRelation {
    Single { table: TableName, alias: Option<String> },
    Filtered { source: RelId, filter: Expression },
    Projected { source: RelId, select: Vec<SelectItem> },
    Aggregated { source: RelId, select: Vec<SelectItem> },
    Grouped { source: RelId, group_by: Vec<Expression> },
    Joined { left: RelId, right: RelId, kind: JoinType, on: Option<Expression> },
    Ordered { source: RelId, order_by: Vec<(Expression, Direction)> },
    Limited { source: RelId, limit: u64 },
}

impl ExactRelation {
    pub fn children(&self) -> Vec<RelId> {
        match self {
            ExactRelation::Single { .. } => vec![],
            ExactRelation::Joined { left, right, .. } => vec![*left, *right],
            ExactRelation::Filtered { source, .. }
            | ExactRelation::Projected { source, .. }
            | ExactRelation::Aggregated { source, .. }
            | ExactRelation::Grouped { source, .. }
            | ExactRelation::Ordered { source, .. }
            | ExactRelation::Limited { source, .. } => vec![*source],
        }
    }
}

const AGG_RANK: u8 = 2;
const GROUP_RANK: u8 = 3;
const FILTER_RANK: u8 = 4;
const FROM_RANK: u8 = 5;

/// 聚合节点之下能与它合并进同一个 select 的子句次序，其余节点返回 None
fn scope_rank(relation: &ExactRelation) -> Option<u8> {
    match relation {
        ExactRelation::Grouped { .. } => Some(GROUP_RANK),
        ExactRelation::Filtered { .. } => Some(FILTER_RANK),
        ExactRelation::Single { .. } | ExactRelation::Joined { .. } => Some(FROM_RANK),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelNode {
    pub relation: ExactRelation,
    /// 作为派生表嵌套时使用的别名
    pub alias: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelationTree {
    nodes: Vec<RelNode>,
}

impl RelationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: RelId) -> Result<&RelNode> {
        self.nodes.get(id).ok_or_else(|| errplan!("relation {id} does not exist"))
    }

    pub fn relation(&self, id: RelId) -> Result<&ExactRelation> {
        Ok(&self.node(id)?.relation)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, relation: ExactRelation) -> Result<RelId> {
        let id = self.nodes.len();
        if let Some(child) = relation.children().into_iter().find(|c| *c >= id) {
            return Err(errplan!("relation {child} must be built before its parent"));
        }
        self.nodes.push(RelNode { relation, alias: None });
        Ok(id)
    }

    pub fn single(&mut self, table: TableName, alias: Option<&str>) -> Result<RelId> {
        self.push(ExactRelation::Single { table, alias: alias.map(str::to_lowercase) })
    }

    pub fn filter(&mut self, source: RelId, filter: Expression) -> Result<RelId> {
        self.push(ExactRelation::Filtered { source, filter })
    }

    /// 含聚合的选择列表生成聚合节点，否则生成投影节点
    pub fn select(&mut self, source: RelId, select: Vec<SelectItem>) -> Result<RelId> {
        if select.iter().any(SelectItem::is_aggregate) {
            self.agg(source, select)
        } else {
            self.push(ExactRelation::Projected { source, select })
        }
    }

    pub fn agg(&mut self, source: RelId, select: Vec<SelectItem>) -> Result<RelId> {
        self.push(ExactRelation::Aggregated { source, select })
    }

    pub fn groupby(&mut self, source: RelId, group_by: Vec<Expression>) -> Result<RelId> {
        self.push(ExactRelation::Grouped { source, group_by })
    }

    pub fn join(&mut self, left: RelId, right: RelId, kind: JoinType, on: Option<Expression>) -> Result<RelId> {
        self.push(ExactRelation::Joined { left, right, kind, on })
    }

    pub fn orderby(&mut self, source: RelId, order_by: Vec<(Expression, Direction)>) -> Result<RelId> {
        self.push(ExactRelation::Ordered { source, order_by })
    }

    pub fn limit(&mut self, source: RelId, limit: u64) -> Result<RelId> {
        self.push(ExactRelation::Limited { source, limit })
    }

    pub fn set_alias(&mut self, id: RelId, alias: &str) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or_else(|| errplan!("relation {id} does not exist"))?;
        node.alias = Some(alias.to_lowercase());
        Ok(())
    }

    /// `id` 为根的子树中的全部节点，结果按下标升序（自底向上）
    pub fn subtree(&self, id: RelId) -> Result<Vec<RelId>> {
        let mut stack = vec![id];
        let mut seen = BTreeSet::new();
        while let Some(cur) = stack.pop() {
            if seen.insert(cur) {
                stack.extend(self.relation(cur)?.children());
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// 与聚合节点渲染在同一层 select 中、可以被抽样替换的单表
    ///
    /// 只穿过分组、过滤和连接节点。投影、排序、截断以及嵌套聚合会被渲染成派生表，
    /// 其中单表的别名在外层不可见，无法按分层加权，因此在这些节点处停止。
    pub fn sampling_leaves(&self, id: RelId) -> Result<Vec<RelId>> {
        // (节点, 父节点的子句次序)
        let mut stack: Vec<(RelId, u8)> = self.relation(id)?.children().into_iter().map(|c| (c, AGG_RANK)).collect();
        let mut leaves = BTreeSet::new();
        while let Some((cur, parent)) = stack.pop() {
            let relation = self.relation(cur)?;
            let Some(rank) = scope_rank(relation) else {
                continue;
            };
            let same_scope = match parent {
                // 连接的两侧只有单表和连接会直接写进 from
                FROM_RANK => rank == FROM_RANK,
                // 过滤条件可以连续出现
                FILTER_RANK => rank >= FILTER_RANK,
                parent => rank > parent,
            };
            if !same_scope {
                continue;
            }
            match relation {
                ExactRelation::Single { .. } => {
                    leaves.insert(cur);
                }
                other => stack.extend(other.children().into_iter().map(|c| (c, rank))),
            }
        }
        Ok(leaves.into_iter().collect())
    }

    /// 单表在查询中被引用的名字：别名优先，其次表名
    pub fn table_ref(&self, id: RelId) -> Result<String> {
        match self.relation(id)? {
            ExactRelation::Single { table, alias } => Ok(alias.clone().unwrap_or_else(|| table.table.clone())),
            _ => Ok(self.node(id)?.alias.clone().unwrap_or_default()),
        }
    }

    /// 子树可以被引用的全部名字
    fn refs(&self, id: RelId) -> Result<BTreeSet<String>> {
        let mut refs = BTreeSet::new();
        for n in self.subtree(id)? {
            if let ExactRelation::Single { table, alias } = self.relation(n)? {
                refs.insert(table.table.clone());
                if let Some(alias) = alias {
                    refs.insert(alias.clone());
                }
            }
        }
        Ok(refs)
    }

    /// 由外部解析器产出的语法树构建关系树，返回根节点
    ///
    /// 逗号分隔的多个来源按顺序连接，连接条件从 WHERE 的合取项中寻找：
    /// 列前缀同时引用了两侧并且都在两侧范围内的谓词作为连接条件。
    /// 找不到时生成没有条件的笛卡尔积并输出警告。
    pub fn from_select(stmt: &ast::SelectStatement, default_schema: &str) -> Result<(RelationTree, RelId)> {
        let mut tree = RelationTree::new();
        let mut remaining: Vec<Expression> = stmt.r#where.clone().map(Expression::conjuncts).unwrap_or_default();

        let mut current: Option<RelId> = None;
        for from in &stmt.from {
            let right = tree.build_from(from, default_schema)?;
            current = Some(match current {
                None => right,
                Some(left) => {
                    let left_refs = tree.refs(left)?;
                    let right_refs = tree.refs(right)?;
                    let (join_conds, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|cond| {
                        let q = cond.qualifiers();
                        !q.is_empty()
                            && q.iter().all(|x| left_refs.contains(x) || right_refs.contains(x))
                            && q.iter().any(|x| left_refs.contains(x))
                            && q.iter().any(|x| right_refs.contains(x))
                    });
                    remaining = rest;
                    match Expression::and_all(join_conds) {
                        Some(on) => tree.join(left, right, JoinType::Inner, Some(on))?,
                        None => {
                            warn!("没有找到 {:?} 与 {:?} 之间的连接条件，按笛卡尔积处理", left_refs, right_refs);
                            tree.join(left, right, JoinType::Cross, None)?
                        }
                    }
                }
            });
        }
        let mut root = current.ok_or_else(|| Error::ParseError("select statement has no from clause".into()))?;

        if let Some(filter) = Expression::and_all(remaining) {
            root = tree.filter(root, filter)?;
        }
        if !stmt.group_by.is_empty() {
            root = tree.groupby(root, stmt.group_by.clone())?;
        }
        let select: Vec<SelectItem> =
            stmt.select.iter().map(|(expr, alias)| SelectItem::new(expr.clone(), alias.as_deref())).collect();
        if select.is_empty() {
            return Err(Error::ParseError("select statement has an empty select list".into()));
        }
        root = if stmt.group_by.is_empty() { tree.select(root, select)? } else { tree.agg(root, select)? };
        if !stmt.order_by.is_empty() {
            root = tree.orderby(root, stmt.order_by.clone())?;
        }
        if let Some(limit) = stmt.limit {
            root = tree.limit(root, limit)?;
        }
        Ok((tree, root))
    }

    fn build_from(&mut self, from: &ast::From, default_schema: &str) -> Result<RelId> {
        match from {
            ast::From::Table { name, alias } => self.single(TableName::parse(name, default_schema), alias.as_deref()),
            ast::From::Join { left, right, r#type, predicate } => {
                let left = self.build_from(left, default_schema)?;
                let right = self.build_from(right, default_schema)?;
                match (r#type, predicate) {
                    (JoinType::Cross, _) | (_, None) => {
                        if *r#type != JoinType::Cross {
                            warn!("{:?} 连接缺少连接条件，按笛卡尔积处理", r#type);
                        }
                        self.join(left, right, JoinType::Cross, None)
                    }
                    (kind, Some(on)) => self.join(left, right, *kind, Some(on.clone())),
                }
            }
        }
    }
}
