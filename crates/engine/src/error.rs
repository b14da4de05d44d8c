//! Engine-level error types.
//!
//! Every error belongs to one of four families:
//! - **build-time**: the blueprint is rejected before any node runs;
//! - **validation**: a node's inputs or outputs are malformed;
//! - **execution**: a collaborator failed, timed out or was cancelled;
//! - **governance**: runaway cost or runaway loops; always fatal to the run.
//!
//! Validation and execution errors are node-local: the dispatcher turns them
//! into a failed `NodeExecutionResult`. Build-time and governance errors stop
//! the scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nodes::NodeError;

/// Machine-readable classification carried by every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateNode,
    UnknownDependency,
    Cycle,
    RecursionLimit,
    InvalidBlueprint,
    SchemaViolation,
    UnresolvedPlaceholder,
    InvalidExpression,
    Execution,
    SandboxViolation,
    Timeout,
    RetryExhausted,
    Cancelled,
    BudgetExceeded,
    AgentStepLimit,
    AgentCycle,
}

impl ErrorKind {
    pub fn is_governance(self) -> bool {
        matches!(self, Self::BudgetExceeded | Self::AgentStepLimit | Self::AgentCycle)
    }

    pub fn is_build_time(self) -> bool {
        matches!(
            self,
            Self::DuplicateNode
                | Self::UnknownDependency
                | Self::Cycle
                | Self::RecursionLimit
                | Self::InvalidBlueprint
        )
    }
}

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    // ------ Build-time errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// A node references a node ID that doesn't exist in the blueprint.
    #[error("node '{node_id}' references unknown node '{dependency}'")]
    UnknownDependency { node_id: String, dependency: String },

    /// Level assignment could not place these nodes.
    #[error("dependency cycle among nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    /// A recursion or iteration cap is missing, non-positive or exceeded.
    #[error("node '{node_id}': recursion limit: {message}")]
    RecursionLimit { node_id: String, message: String },

    /// Structural problem with the blueprint or its collaborators.
    #[error("invalid blueprint at '{node_id}': {message}")]
    InvalidBlueprint { node_id: String, message: String },

    // ------ Validation errors ------

    #[error("node '{node_id}' {direction} violates schema: {message}")]
    SchemaViolation {
        node_id: String,
        direction: &'static str,
        message: String,
    },

    #[error("node '{node_id}': cannot resolve '{{{{{placeholder}}}}}': {reason}")]
    UnresolvedPlaceholder {
        node_id: String,
        placeholder: String,
        reason: String,
    },

    #[error("node '{node_id}': invalid expression: {message}")]
    InvalidExpression { node_id: String, message: String },

    // ------ Execution errors ------

    #[error("node '{node_id}': tool '{tool}' failed: {source}")]
    Tool {
        node_id: String,
        tool: String,
        source: NodeError,
    },

    #[error("node '{node_id}': model call failed: {source}")]
    Model { node_id: String, source: NodeError },

    #[error("node '{node_id}': sandbox failed: {source}")]
    Sandbox { node_id: String, source: NodeError },

    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    /// A node's retryable error was exhausted.
    #[error("node '{node_id}' exceeded retry limit after {attempts} attempts: {message}")]
    NodeRetryExhausted {
        node_id: String,
        attempts: u32,
        message: String,
    },

    /// A node failed with a fatal error.
    #[error("node '{node_id}' failed: {message}")]
    NodeFatal { node_id: String, message: String },

    #[error("node '{node_id}' was cancelled")]
    Cancelled { node_id: String },

    #[error("node '{node_id}': memory error: {message}")]
    Memory { node_id: String, message: String },

    // ------ Governance errors ------

    #[error("node '{node_id}': budget exceeded: {message}")]
    BudgetExceeded { node_id: String, message: String },

    #[error("node '{node_id}': agent '{agent_id}' reached {max_steps} steps without completing")]
    AgentStepLimit {
        node_id: String,
        agent_id: String,
        max_steps: u32,
    },

    #[error("agent '{agent_id}' is already on the call stack [{}]", stack.join(" -> "))]
    AgentCycle { agent_id: String, stack: Vec<String> },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateNodeId(_) => ErrorKind::DuplicateNode,
            Self::UnknownDependency { .. } => ErrorKind::UnknownDependency,
            Self::CycleDetected { .. } => ErrorKind::Cycle,
            Self::RecursionLimit { .. } => ErrorKind::RecursionLimit,
            Self::InvalidBlueprint { .. } => ErrorKind::InvalidBlueprint,
            Self::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            Self::UnresolvedPlaceholder { .. } => ErrorKind::UnresolvedPlaceholder,
            Self::InvalidExpression { .. } => ErrorKind::InvalidExpression,
            Self::Tool { source, .. }
            | Self::Sandbox { source, .. }
            | Self::Model { source, .. } => match source {
                NodeError::SandboxViolation(_) => ErrorKind::SandboxViolation,
                _ => ErrorKind::Execution,
            },
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NodeRetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::NodeFatal { .. } | Self::Memory { .. } => ErrorKind::Execution,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::AgentStepLimit { .. } => ErrorKind::AgentStepLimit,
            Self::AgentCycle { .. } => ErrorKind::AgentCycle,
        }
    }

    pub fn is_governance(&self) -> bool {
        self.kind().is_governance()
    }

    /// Errors that stop the scheduler instead of failing a single node.
    pub fn is_fatal_to_run(&self) -> bool {
        let kind = self.kind();
        kind.is_governance() || kind.is_build_time()
    }

    /// Transport failures and timeouts may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Tool { source, .. }
            | Self::Model { source, .. }
            | Self::Sandbox { source, .. } => source.is_retryable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// The node the error is tied to, when there is one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateNodeId(id) => Some(id),
            Self::CycleDetected { .. } => None,
            Self::AgentCycle { agent_id, .. } => Some(agent_id),
            Self::UnknownDependency { node_id, .. }
            | Self::RecursionLimit { node_id, .. }
            | Self::InvalidBlueprint { node_id, .. }
            | Self::SchemaViolation { node_id, .. }
            | Self::UnresolvedPlaceholder { node_id, .. }
            | Self::InvalidExpression { node_id, .. }
            | Self::Tool { node_id, .. }
            | Self::Model { node_id, .. }
            | Self::Sandbox { node_id, .. }
            | Self::Timeout { node_id, .. }
            | Self::NodeRetryExhausted { node_id, .. }
            | Self::NodeFatal { node_id, .. }
            | Self::Cancelled { node_id }
            | Self::Memory { node_id, .. }
            | Self::BudgetExceeded { node_id, .. }
            | Self::AgentStepLimit { node_id, .. } => Some(node_id),
        }
    }

    pub(crate) fn invalid(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidBlueprint {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    pub(crate) fn fatal(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeFatal {
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}

/// A node-local failure as recorded in a `NodeExecutionResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for NodeFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Why a run did not succeed, as reported in the `RunResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub node_id: Option<String>,
    pub message: String,
}

impl From<&EngineError> for RunFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            node_id: err.node_id().map(str::to_owned),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn governance_errors_are_fatal_to_the_run() {
        let err = EngineError::AgentCycle {
            agent_id: "planner".into(),
            stack: vec!["planner".into()],
        };
        assert!(err.is_governance());
        assert!(err.is_fatal_to_run());
        assert_eq!(err.node_id(), Some("planner"));
    }

    #[test]
    fn node_local_errors_are_not_fatal_to_the_run() {
        let err = EngineError::SchemaViolation {
            node_id: "n".into(),
            direction: "output",
            message: "expected object".into(),
        };
        assert!(!err.is_fatal_to_run());
        assert_eq!(NodeFailure::from(&err).kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn only_transport_failures_and_timeouts_retry() {
        let transport = EngineError::Model {
            node_id: "n".into(),
            source: NodeError::Retryable("503".into()),
        };
        let violation = EngineError::Sandbox {
            node_id: "n".into(),
            source: NodeError::SandboxViolation("import os".into()),
        };
        assert!(transport.is_retryable());
        assert!(!violation.is_retryable());
        assert_eq!(violation.kind(), ErrorKind::SandboxViolation);
        assert!(EngineError::Timeout { node_id: "n".into(), timeout_ms: 5 }.is_retryable());
    }

    #[test]
    fn placeholder_message_shows_braces() {
        let err = EngineError::UnresolvedPlaceholder {
            node_id: "b".into(),
            placeholder: "a.out".into(),
            reason: "missing key 'out'".into(),
        };
        assert_eq!(
            err.to_string(),
            "node 'b': cannot resolve '{{a.out}}': missing key 'out'"
        );
    }
}
