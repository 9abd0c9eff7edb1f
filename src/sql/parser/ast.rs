use std::collections::BTreeSet;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// 外部解析器产出的查询语法树。
///
/// 本系统不实现 SQL 解析，只消费解析结果，字段与 SQL 子句一一对应：
/// - select: 选中的表达式以及别名（可选）
/// - from: 来源表集合，逗号分隔的多个来源表示隐式连接
/// - r#where: 过滤条件
/// - group_by: 分组条件
/// - order_by: 排序条件
/// - limit: 返回的总条数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectStatement {
    pub select: Vec<(Expression, Option<String>)>,
    pub from: Vec<From>,
    pub r#where: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub order_by: Vec<(Expression, Direction)>,
    pub limit: Option<u64>,
}

/// From语句
#[derive(Debug, Clone, PartialEq)]
pub enum From {
    /// 表信息，name 可以是 `schema.table`
    Table { name: String, alias: Option<String> },

    /// 连接方式和连接条件
    Join {
        left: Box<From>,
        right: Box<From>,
        r#type: JoinType,
        predicate: Option<Expression>,
    },
}

/// 连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Cross,
    Inner,
    Left,
    Right,
}

impl JoinType {
    /// 内外连接判断函数
    /// - cross | inner => false
    /// - left | right => true
    pub fn is_outer(&self) -> bool {
        match self {
            JoinType::Cross | JoinType::Inner => false,
            JoinType::Left | JoinType::Right => true,
        }
    }
}

/// 升降序
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// 聚合函数
///
/// 平均值不能直接跨分区合并，需要拆成 (sum, count) 在最终展示时再相除。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggFunction {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunction {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunction::Count | AggFunction::CountDistinct => "count",
            AggFunction::Sum => "sum",
            AggFunction::Avg => "avg",
            AggFunction::Min => "min",
            AggFunction::Max => "max",
        }
    }

    /// min/max 合并时保持原函数，其余（count、sum）合并时求和
    pub fn is_min_max(&self) -> bool {
        matches!(self, AggFunction::Min | AggFunction::Max)
    }
}

/// 表示 SQL 表达式（如 `a + 7 > b`），支持嵌套结构。
///
/// # 变体说明
///
/// - `All`
///   所有列（`*`）。
///
/// - `Column(Option<String>, String)`
///   列引用，可选表名（或别名）前缀。
///
/// - `Literal(Literal)`
///   字面量值。
///
/// - `Function(String, Vec<Expression>)`
///   标量函数调用。`hash`/`rand`/`mod` 由方言渲染器翻译成目标引擎的写法。
///
/// - `Aggregate(AggFunction, Box<Expression>)`
///   聚合函数调用，`count(*)` 的参数为 `All`。
///
/// - `Case(Vec<(Expression, Expression)>, Option<Box<Expression>>)`
///   `CASE WHEN .. THEN .. ELSE .. END`，用于分层权重和分块规则。
///
/// - `Operator(Operator)`
///   运算符表达式。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// 所有列
    All,
    /// 列关联关系,可以携带一个表别名
    Column(Option<String>, String),
    /// 字面常量
    Literal(Literal),
    /// 函数调用
    Function(String, Vec<Expression>),
    /// 聚合
    Aggregate(AggFunction, Box<Expression>),
    /// 条件分支
    Case(Vec<(Expression, Expression)>, Option<Box<Expression>>),
    /// 操作
    Operator(Operator),
}

/// 表达式的字面常量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Boolean(bool),
    String(String),
    Integer(i64),
    Float(f64),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Null, Literal::Null) => true,
            (Literal::Boolean(a), Literal::Boolean(b)) => a == b,
            (Literal::String(a), Literal::String(b)) => a == b,
            (Literal::Integer(a), Literal::Integer(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(), //f64没有实现Eq，按位比较
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Literal::Null => {}
            Literal::Boolean(b) => b.hash(state),
            Literal::String(s) => s.hash(state),
            Literal::Integer(i) => i.hash(state),
            Literal::Float(f) => f.to_bits().hash(state),
        }
    }
}

/// 表达式操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    /// a and b
    And(Box<Expression>, Box<Expression>),
    /// a OR b
    Or(Box<Expression>, Box<Expression>),
    /// a=b
    Eq(Box<Expression>, Box<Expression>),
    /// a>b
    Greater(Box<Expression>, Box<Expression>),
    /// a >= b
    GreaterEq(Box<Expression>, Box<Expression>),
    /// is null or is true ...
    Is(Box<Expression>, Literal),
    /// a < b
    Less(Box<Expression>, Box<Expression>),
    /// a <= b
    LessEq(Box<Expression>, Box<Expression>),
    /// a!=b
    NotEq(Box<Expression>, Box<Expression>),
    /// a + b
    Add(Box<Expression>, Box<Expression>),
    /// a / b
    Div(Box<Expression>, Box<Expression>),
    /// a*b
    Multiply(Box<Expression>, Box<Expression>),
    /// a%b
    Remainder(Box<Expression>, Box<Expression>),
    /// a-b
    Sub(Box<Expression>, Box<Expression>),
    /// a like b
    Like(Box<Expression>, Box<Expression>),
    /// !a
    Not(Box<Expression>),
    /// -a
    Negate(Box<Expression>),
}

impl Expression {
    /// 深度优先遍历（DFS）当前表达式树，并对每个节点调用提供的闭包。
    ///
    /// 若闭包返回 `false`，则会**立即终止遍历**并返回 `false`；
    /// 若遍历完整棵树且未中途终止，则返回 `true`。
    pub fn walk(&self, visitor: &mut impl FnMut(&Expression) -> bool) -> bool {
        use Operator::*;
        if !visitor(self) {
            return false;
        }
        match self {
            Self::Operator(op) => match op {
                Add(left, right)
                | Div(left, right)
                | Sub(left, right)
                | Like(left, right)
                | NotEq(left, right)
                | And(left, right)
                | Or(left, right)
                | Eq(left, right)
                | Greater(left, right)
                | GreaterEq(left, right)
                | Less(left, right)
                | LessEq(left, right)
                | Multiply(left, right)
                | Remainder(left, right) => left.walk(visitor) && right.walk(visitor),
                Negate(expr) | Not(expr) | Is(expr, _) => expr.walk(visitor),
            },
            Self::Function(_, args) => args.iter().all(|expr| expr.walk(visitor)),
            Self::Aggregate(_, arg) => arg.walk(visitor),
            Self::Case(branches, otherwise) => {
                branches.iter().all(|(when, then)| when.walk(visitor) && then.walk(visitor))
                    && otherwise.as_ref().map_or(true, |expr| expr.walk(visitor))
            }
            Self::All | Self::Column(_, _) | Self::Literal(_) => true,
        }
    }

    /// 检查当前表达式树中是否存在满足条件的节点。
    pub fn contains(&self, visitor: impl Fn(&Expression) -> bool) -> bool {
        !self.walk(&mut |expr| !visitor(expr))
    }

    /// 收集第一个使 `visitor` 返回 `false` 的节点（不再深入其子树）
    pub fn collect(&self, visitor: &impl Fn(&Expression) -> bool, expresses: &mut Vec<Expression>) {
        use Operator::*;

        if !visitor(self) {
            expresses.push(self.clone());
            return;
        }
        match self {
            Self::Operator(op) => match op {
                Add(left, right)
                | Div(left, right)
                | Sub(left, right)
                | Like(left, right)
                | NotEq(left, right)
                | And(left, right)
                | Or(left, right)
                | Eq(left, right)
                | Greater(left, right)
                | GreaterEq(left, right)
                | Less(left, right)
                | LessEq(left, right)
                | Multiply(left, right)
                | Remainder(left, right) => {
                    left.collect(visitor, expresses);
                    right.collect(visitor, expresses);
                }
                Negate(expr) | Not(expr) | Is(expr, _) => expr.collect(visitor, expresses),
            },
            Self::Function(_, args) => args.iter().for_each(|expr| expr.collect(visitor, expresses)),
            Self::Aggregate(_, arg) => arg.collect(visitor, expresses),
            Self::Case(branches, otherwise) => {
                for (when, then) in branches {
                    when.collect(visitor, expresses);
                    then.collect(visitor, expresses);
                }
                if let Some(expr) = otherwise {
                    expr.collect(visitor, expresses);
                }
            }
            Self::All | Self::Column(_, _) | Self::Literal(_) => {}
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.contains(|expr| matches!(expr, Expression::Aggregate(_, _)))
    }

    /// 表达式中出现的所有聚合调用
    pub fn aggregates(&self) -> Vec<Expression> {
        let mut found = Vec::new();
        self.collect(&|expr| !matches!(expr, Expression::Aggregate(_, _)), &mut found);
        found
    }

    /// 表达式中列引用使用到的表名/别名前缀（小写）
    pub fn qualifiers(&self) -> BTreeSet<String> {
        let mut qualifiers = BTreeSet::new();
        self.walk(&mut |expr| {
            if let Expression::Column(Some(q), _) = expr {
                qualifiers.insert(q.to_lowercase());
            }
            true
        });
        qualifiers
    }

    /// 按 AND 拆分成合取项
    pub fn conjuncts(self) -> Vec<Expression> {
        match self {
            Expression::Operator(Operator::And(left, right)) => {
                let mut items = left.conjuncts();
                items.extend(right.conjuncts());
                items
            }
            expr => vec![expr],
        }
    }

    /// 把多个合取项重新用 AND 连接
    pub fn and_all(items: impl IntoIterator<Item = Expression>) -> Option<Expression> {
        items.into_iter().reduce(|acc, expr| Operator::And(acc.into(), expr.into()).into())
    }

    pub fn column(qualifier: Option<&str>, name: &str) -> Self {
        Expression::Column(qualifier.map(str::to_string), name.to_string())
    }

    pub fn int(value: i64) -> Self {
        Expression::Literal(Literal::Integer(value))
    }

    pub fn float(value: f64) -> Self {
        Expression::Literal(Literal::Float(value))
    }

    pub fn agg(func: AggFunction, arg: Expression) -> Self {
        Expression::Aggregate(func, Box::new(arg))
    }
}

impl core::convert::From<Literal> for Expression {
    fn from(literal: Literal) -> Self {
        Self::Literal(literal)
    }
}

impl core::convert::From<Operator> for Expression {
    fn from(operator: Operator) -> Self {
        Self::Operator(operator)
    }
}

impl core::convert::From<Operator> for Box<Expression> {
    fn from(operator: Operator) -> Self {
        Box::new(operator.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(q: &str, c: &str) -> Expression {
        Expression::column(Some(q), c)
    }

    #[test]
    fn test_conjuncts() {
        let a = Operator::Eq(col("o", "id").into(), col("p", "order_id").into()).into();
        let b = Operator::Greater(col("o", "price").into(), Expression::int(10).into()).into();
        let c = Operator::Less(col("p", "qty").into(), Expression::int(3).into()).into();
        let all = Expression::and_all(vec![a, b, c]).unwrap();
        let items = all.conjuncts();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].qualifiers().into_iter().collect::<Vec<_>>(), vec!["o", "p"]);
    }

    #[test]
    fn test_aggregates() {
        let expr: Expression = Operator::Div(
            Expression::agg(AggFunction::Sum, col("t", "price")).into(),
            Expression::agg(AggFunction::Count, Expression::All).into(),
        )
        .into();
        assert!(expr.is_aggregate());
        assert_eq!(expr.aggregates().len(), 2);
        assert!(!col("t", "price").is_aggregate());
    }

    #[test]
    fn test_walk_case() {
        let expr = Expression::Case(
            vec![(col("t", "tier"), Expression::int(1))],
            Some(Box::new(col("s", "x"))),
        );
        assert_eq!(expr.qualifiers().len(), 2);
    }
}
