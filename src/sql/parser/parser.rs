use crate::db_error::Result;
use crate::sql::parser::ast::SelectStatement;

/// # 语法分析
///
/// SQL 文本到语法树的转换由外部解析器完成，本系统只依赖这个接口。
/// 解析失败必须返回 `Error::ParseError`，该错误对当前查询是致命的。
pub trait SqlParser: Send + Sync {
    fn parse_select(&self, sql: &str) -> Result<SelectStatement>;
}
