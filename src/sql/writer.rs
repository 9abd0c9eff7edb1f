use itertools::Itertools;

use crate::db_error::Result;
use crate::errplan;
use crate::sql::parser::ast::{AggFunction, Direction, Expression, JoinType, Literal, Operator};
use crate::sql::query::{Relation, SelectItem, SelectQuery, Statement};
use crate::sql::syntax::SqlSyntax;
use crate::types::TableName;

/// 把 SQL 对象模型渲染成目标方言的文本
pub struct SqlWriter<'a> {
    syntax: &'a dyn SqlSyntax,
}

impl<'a> SqlWriter<'a> {
    pub fn new(syntax: &'a dyn SqlSyntax) -> Self {
        Self { syntax }
    }

    pub fn statement(&self, statement: &Statement) -> Result<String> {
        match statement {
            Statement::Select(query) => self.select(query),
            Statement::CreateTableAs { table, query } => {
                Ok(format!("create table {} as {}", self.table_name(table), self.select(query)?))
            }
            Statement::DropTable { table, if_exists } => {
                let if_exists = if *if_exists { "if exists " } else { "" };
                Ok(format!("drop table {if_exists}{}", self.table_name(table)))
            }
        }
    }

    pub fn select(&self, query: &SelectQuery) -> Result<String> {
        let mut sql = String::from("select ");
        sql.push_str(&query.select.iter().map(|item| self.select_item(item)).join(", "));

        if !query.from.is_empty() {
            let from = query.from.iter().map(|r| self.relation(r)).collect::<Result<Vec<_>>>()?;
            sql.push_str(" from ");
            sql.push_str(&from.join(", "));
        }
        if let Some(filter) = &query.filter {
            sql.push_str(" where ");
            sql.push_str(&self.expr(filter));
        }
        if !query.group_by.is_empty() {
            sql.push_str(" group by ");
            sql.push_str(&query.group_by.iter().map(|e| self.expr(e)).join(", "));
        }
        if !query.order_by.is_empty() {
            sql.push_str(" order by ");
            sql.push_str(
                &query
                    .order_by
                    .iter()
                    .map(|(e, dir)| match dir {
                        Direction::Asc => format!("{} asc", self.expr(e)),
                        Direction::Desc => format!("{} desc", self.expr(e)),
                    })
                    .join(", "),
            );
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" limit {limit}"));
        }
        Ok(sql)
    }

    fn select_item(&self, item: &SelectItem) -> String {
        match &item.alias {
            Some(alias) => format!("{} as {}", self.expr(&item.expr), self.syntax.quote(alias)),
            None => self.expr(&item.expr),
        }
    }

    pub fn table_name(&self, table: &TableName) -> String {
        format!("{}.{}", self.syntax.quote(&table.schema), self.syntax.quote(&table.table))
    }

    fn relation(&self, relation: &Relation) -> Result<String> {
        Ok(match relation {
            Relation::Base { table, alias: Some(alias) } => {
                format!("{} as {}", self.table_name(table), self.syntax.quote(alias))
            }
            Relation::Base { table, alias: None } => self.table_name(table),
            Relation::Placeholder { slot, alias } => {
                return Err(errplan!("placeholder {alias} (slot {slot}) was not resolved before rendering"));
            }
            Relation::Derived { query, alias } => {
                format!("({}) as {}", self.select(query)?, self.syntax.quote(alias))
            }
            Relation::UnionAll { left, right, alias } => format!(
                "({} union all {}) as {}",
                self.select(left)?,
                self.select(right)?,
                self.syntax.quote(alias)
            ),
            Relation::Join { left, right, kind, on } => {
                let keyword = match (kind, on) {
                    (JoinType::Cross, _) | (_, None) => "cross join",
                    (JoinType::Inner, _) => "inner join",
                    (JoinType::Left, _) => "left join",
                    (JoinType::Right, _) => "right join",
                };
                let mut sql = format!("{} {keyword} {}", self.relation(left)?, self.relation(right)?);
                if let (Some(on), false) = (on, *kind == JoinType::Cross) {
                    sql.push_str(" on ");
                    sql.push_str(&self.expr(on));
                }
                sql
            }
        })
    }

    pub fn expr(&self, expr: &Expression) -> String {
        use Operator::*;
        match expr {
            Expression::All => "*".to_string(),
            Expression::Column(Some(q), name) if name == "*" => format!("{}.*", self.syntax.quote(q)),
            Expression::Column(Some(q), name) => format!("{}.{}", self.syntax.quote(q), self.syntax.quote(name)),
            Expression::Column(None, name) => self.syntax.quote(name),
            Expression::Literal(literal) => self.literal(literal),
            Expression::Function(name, args) => match (name.as_str(), args.as_slice()) {
                ("hash", [arg]) => self.syntax.hash_function(&self.expr(arg)),
                ("rand", []) => self.syntax.rand_function().to_string(),
                ("mod", [left, right]) => self.syntax.modulo(&self.expr(left), &self.expr(right)),
                _ => format!("{name}({})", args.iter().map(|a| self.expr(a)).join(", ")),
            },
            Expression::Aggregate(AggFunction::CountDistinct, arg) => format!("count(distinct {})", self.expr(arg)),
            Expression::Aggregate(func, arg) => format!("{}({})", func.name(), self.expr(arg)),
            Expression::Case(branches, otherwise) => {
                let mut sql = String::from("case");
                for (when, then) in branches {
                    sql.push_str(&format!(" when {} then {}", self.expr(when), self.expr(then)));
                }
                if let Some(otherwise) = otherwise {
                    sql.push_str(&format!(" else {}", self.expr(otherwise)));
                }
                sql.push_str(" end");
                sql
            }
            Expression::Operator(op) => match op {
                And(l, r) => format!("({} and {})", self.expr(l), self.expr(r)),
                Or(l, r) => format!("({} or {})", self.expr(l), self.expr(r)),
                Eq(l, r) => format!("{} = {}", self.expr(l), self.expr(r)),
                NotEq(l, r) => format!("{} <> {}", self.expr(l), self.expr(r)),
                Greater(l, r) => format!("{} > {}", self.expr(l), self.expr(r)),
                GreaterEq(l, r) => format!("{} >= {}", self.expr(l), self.expr(r)),
                Less(l, r) => format!("{} < {}", self.expr(l), self.expr(r)),
                LessEq(l, r) => format!("{} <= {}", self.expr(l), self.expr(r)),
                Like(l, r) => format!("{} like {}", self.expr(l), self.expr(r)),
                Add(l, r) => format!("({} + {})", self.expr(l), self.expr(r)),
                Sub(l, r) => format!("({} - {})", self.expr(l), self.expr(r)),
                Multiply(l, r) => format!("({} * {})", self.expr(l), self.expr(r)),
                Div(l, r) => format!("({} / {})", self.expr(l), self.expr(r)),
                Remainder(l, r) => format!("({} % {})", self.expr(l), self.expr(r)),
                Is(e, literal) => format!("{} is {}", self.expr(e), self.literal(literal)),
                Not(e) => format!("not ({})", self.expr(e)),
                Negate(e) => format!("-({})", self.expr(e)),
            },
        }
    }

    fn literal(&self, literal: &Literal) -> String {
        match literal {
            Literal::Null => "null".to_string(),
            Literal::Boolean(true) => "true".to_string(),
            Literal::Boolean(false) => "false".to_string(),
            Literal::Integer(i) => i.to_string(),
            Literal::Float(f) if f.fract() == 0.0 && f.is_finite() => format!("{f:.1}"),
            Literal::Float(f) => f.to_string(),
            Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::syntax::{HiveSyntax, PostgresSyntax};

    #[test]
    fn test_select() {
        let syntax = PostgresSyntax;
        let writer = SqlWriter::new(&syntax);
        let mut query = SelectQuery::new(
            vec![
                SelectItem::new(Expression::column(Some("t"), "dow"), None),
                SelectItem::aliased(Expression::agg(AggFunction::Count, Expression::All), "cnt"),
            ],
            Relation::base(TableName::new("sales", "orders"), Some("t")),
        );
        query.add_filter(Operator::Greater(Expression::column(Some("t"), "price").into(), Expression::int(10).into()).into());
        query.group_by.push(Expression::column(Some("t"), "dow"));
        query.limit = Some(5);
        assert_eq!(
            writer.select(&query).unwrap(),
            "select \"t\".\"dow\", count(*) as \"cnt\" from \"sales\".\"orders\" as \"t\" \
             where \"t\".\"price\" > 10 group by \"t\".\"dow\" limit 5"
        );
    }

    #[test]
    fn test_dialect_functions() {
        let syntax = HiveSyntax;
        let writer = SqlWriter::new(&syntax);
        let expr = Expression::Function(
            "mod".into(),
            vec![Expression::Function("hash".into(), vec![Expression::column(None, "id")]), Expression::int(3)],
        );
        assert_eq!(writer.expr(&expr), "pmod(conv(substr(md5(cast(`id` as string)),17,8),16,10), 3)");
        assert_eq!(writer.expr(&Expression::Literal(Literal::String("it's".into()))), "'it''s'");
        assert_eq!(writer.expr(&Expression::float(1.0)), "1.0");
    }

    #[test]
    fn test_unresolved_placeholder() {
        let syntax = PostgresSyntax;
        let writer = SqlWriter::new(&syntax);
        let query = SelectQuery::star(Relation::Placeholder { slot: 0, alias: "p".into() });
        assert!(writer.select(&query).is_err());
    }

    #[test]
    fn test_statements() {
        let syntax = PostgresSyntax;
        let writer = SqlWriter::new(&syntax);
        let table = TableName::new("tmp", "t1");
        let drop = Statement::DropTable { table: table.clone(), if_exists: true };
        assert_eq!(writer.statement(&drop).unwrap(), "drop table if exists \"tmp\".\"t1\"");
        let ctas = Statement::CreateTableAs {
            table,
            query: SelectQuery::star(Relation::base(TableName::new("s", "o"), None)),
        };
        assert_eq!(writer.statement(&ctas).unwrap(), "create table \"tmp\".\"t1\" as select * from \"s\".\"o\"");
    }
}
