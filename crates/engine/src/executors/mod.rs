//! Built-in executors, one per node type.

mod agents;
mod code;
mod control;
mod llm;
mod tool;
mod workflow;

pub use agents::{AgentExecutor, RecursiveExecutor};
pub use code::CodeExecutor;
pub use control::{ConditionExecutor, LoopExecutor, ParallelExecutor};
pub use llm::LlmExecutor;
pub use tool::ToolExecutor;
pub use workflow::SubWorkflowExecutor;

use crate::error::EngineError;
use crate::models::{NodeConfig, NodeType};

/// The registry routed a node to the wrong executor.
fn mismatch(node: &NodeConfig, expected: NodeType) -> EngineError {
    EngineError::invalid(
        &node.id,
        format!("'{}' node routed to the {expected} executor", node.node_type()),
    )
}
