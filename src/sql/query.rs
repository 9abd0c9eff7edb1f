//! 与方言无关的 SQL 对象模型。
//!
//! 改写器和执行计划都只生成这些对象，最终由 [`SqlWriter`](super::SqlWriter) 渲染成文本。
//! 执行计划中的节点在构造时还不知道上游中间表的名字，
//! 这时用 `Relation::Placeholder` 占位，运行时再由上游的令牌填充。

use serde::{Deserialize, Serialize};

use crate::db_error::Result;
use crate::errplan;
use crate::sql::parser::ast::{Direction, Expression, JoinType};
use crate::types::TableName;

/// 查询列表中的一项
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expression,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expression, alias: Option<&str>) -> Self {
        Self { expr, alias: alias.map(str::to_lowercase) }
    }

    pub fn aliased(expr: Expression, alias: &str) -> Self {
        Self::new(expr, Some(alias))
    }

    pub fn is_aggregate(&self) -> bool {
        self.expr.is_aggregate()
    }
}

/// FROM 子句中的一个来源
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Relation {
    /// 物理表
    Base { table: TableName, alias: Option<String> },
    /// 占位表：第 slot 个依赖的上游结果表
    Placeholder { slot: usize, alias: String },
    /// 派生表（子查询）
    Derived { query: Box<SelectQuery>, alias: String },
    /// UNION ALL 派生表
    UnionAll { left: Box<SelectQuery>, right: Box<SelectQuery>, alias: String },
    /// 连接，`on` 为空表示没有连接条件（笛卡尔积）
    Join { left: Box<Relation>, right: Box<Relation>, kind: JoinType, on: Option<Expression> },
}

impl Relation {
    pub fn base(table: TableName, alias: Option<&str>) -> Self {
        Relation::Base { table, alias: alias.map(str::to_string) }
    }

    /// 用上游结果表替换占位表
    fn resolve(&self, tables: &[TableName]) -> Result<Relation> {
        Ok(match self {
            Relation::Base { .. } => self.clone(),
            Relation::Placeholder { slot, alias } => {
                let table = tables
                    .get(*slot)
                    .ok_or_else(|| errplan!("placeholder slot {slot} has no upstream table"))?;
                Relation::Base { table: table.clone(), alias: Some(alias.clone()) }
            }
            Relation::Derived { query, alias } => Relation::Derived {
                query: Box::new(query.resolve_placeholders(tables)?),
                alias: alias.clone(),
            },
            Relation::UnionAll { left, right, alias } => Relation::UnionAll {
                left: Box::new(left.resolve_placeholders(tables)?),
                right: Box::new(right.resolve_placeholders(tables)?),
                alias: alias.clone(),
            },
            Relation::Join { left, right, kind, on } => Relation::Join {
                left: Box::new(left.resolve(tables)?),
                right: Box::new(right.resolve(tables)?),
                kind: *kind,
                on: on.clone(),
            },
        })
    }

    fn placeholder_count(&self) -> usize {
        match self {
            Relation::Base { .. } => 0,
            Relation::Placeholder { .. } => 1,
            Relation::Derived { query, .. } => query.placeholder_count(),
            Relation::UnionAll { left, right, .. } => left.placeholder_count() + right.placeholder_count(),
            Relation::Join { left, right, .. } => left.placeholder_count() + right.placeholder_count(),
        }
    }
}

/// SELECT 查询
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub select: Vec<SelectItem>,
    pub from: Vec<Relation>,
    pub filter: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub order_by: Vec<(Expression, Direction)>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    pub fn new(select: Vec<SelectItem>, from: Relation) -> Self {
        Self { select, from: vec![from], ..Default::default() }
    }

    /// `select * from <from>`
    pub fn star(from: Relation) -> Self {
        Self::new(vec![SelectItem::new(Expression::All, None)], from)
    }

    /// 以 AND 追加过滤条件
    pub fn add_filter(&mut self, cond: Expression) {
        self.filter = Expression::and_all(self.filter.take().into_iter().chain(std::iter::once(cond)));
    }

    pub fn is_aggregate(&self) -> bool {
        self.select.iter().any(SelectItem::is_aggregate)
    }

    pub fn placeholder_count(&self) -> usize {
        self.from.iter().map(Relation::placeholder_count).sum()
    }

    /// 返回一个所有占位表都被替换为真实表的新查询
    pub fn resolve_placeholders(&self, tables: &[TableName]) -> Result<SelectQuery> {
        let from = self.from.iter().map(|r| r.resolve(tables)).collect::<Result<Vec<_>>>()?;
        Ok(SelectQuery { from, ..self.clone() })
    }
}

/// 交给外部执行器的完整语句
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectQuery),
    CreateTableAs { table: TableName, query: SelectQuery },
    DropTable { table: TableName, if_exists: bool },
}
