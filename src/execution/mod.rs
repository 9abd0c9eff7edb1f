//! 执行计划：节点 DAG、令牌、聚合合并以及并发运行器

pub mod combiner;
pub mod node;
pub mod ola;
pub mod plan;
pub mod runner;
pub mod token;

pub use node::{ExecutableNode, NodeId, NodeKind};
pub use ola::{OlaAggregate, OlaPlanBuilder, OlaQuery};
pub use plan::ExecutionPlan;
pub use runner::{CancelHandle, PlanRunner, Progress};
pub use token::{AggColumn, AggMeta, ExecutionInfoToken, FinalColumn, TokenValue};
