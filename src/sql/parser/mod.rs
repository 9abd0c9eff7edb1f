pub mod ast;
mod parser;

pub use parser::SqlParser;
