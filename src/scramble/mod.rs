//! scramble：带分块、分层列的原表重排副本，以及构建它们的抽样方法和协调器

pub mod coordinator;
pub mod meta;
pub mod method;

pub use coordinator::ScramblingCoordinator;
pub use meta::{ScrambleMeta, ScrambleMetaSet};
pub use method::{ScramblingMethod, TableStatistics, FAST_CONVERGE, SCRAMBLING_METHODS, UNIFORM};
