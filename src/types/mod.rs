mod result;
mod table;
mod value;

pub use result::*;
pub use table::*;
pub use value::*;
