pub mod parser;
pub mod query;
pub mod syntax;
pub mod writer;

pub use query::{Relation, SelectItem, SelectQuery, Statement};
pub use syntax::{Dialect, SqlSyntax};
pub use writer::SqlWriter;
