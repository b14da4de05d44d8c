//! `engine` crate: blueprint models, planning and the level scheduler.
//!
//! A [`Blueprint`] is planned into an [`ExecutionPlan`] (dependency levels,
//! loop bodies, nested workflows) and run by a [`WorkflowExecutor`] against
//! the collaborators held by an [`EngineContext`].

pub mod agent;
pub mod budget;
pub mod config;
pub mod context;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod executors;
pub mod expression;
pub mod models;
pub mod plan;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod template;

mod branch;
mod scheduler;

pub use budget::{BudgetLimits, BudgetSnapshot, BudgetTracker};
pub use config::EngineConfig;
pub use dag::DependencyGraph;
pub use dispatch::{ExecutorRegistry, NodeExecutor};
pub use error::{EngineError, ErrorKind, NodeFailure, RunFailure};
pub use events::{event_channel, EngineEvent, EventReceiver, EventSender};
pub use executor::WorkflowExecutor;
pub use models::{
    AgentMemory, AgentNode, Blueprint, CodeNode, ConditionNode, FailurePolicy, LlmNode, LoopNode,
    NodeConfig, NodeExecutionResult, NodeKind, NodeStatus, NodeType, ParallelNode, RecursiveNode,
    RunResult, SkipReason, ToolNode, WorkflowNode,
};
pub use plan::ExecutionPlan;
pub use runtime::{EngineBuilder, EngineContext, NodeCx};

#[cfg(test)]
mod executor_tests;
