//! 关系代数与近似改写。

pub mod approx;
pub mod exact;
pub mod rewriter;
pub mod sample;

pub use approx::ApproxRelation;
pub use exact::{ExactRelation, RelId, RelationTree};
pub use rewriter::ApproxRewriter;
pub use sample::{consolidate, ExpressionCandidates, SampleGroup, SamplePlan, SamplePlans};
