//! Node dispatch: one executor per node type, and the wrapper that turns an
//! executor's outcome into a recorded result.
//!
//! Rules applied to every node, whatever its type:
//!   1. Leaf nodes (tool, llm, code) time out per attempt inside their
//!      collaborator calls. Every other type times out as a whole here.
//!   2. A declared output schema is checked against the produced output.
//!   3. Errors fatal to the run (budget, agent caps, build-time) are handed
//!      back to the scheduler as an abort alongside the failed result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{EngineError, NodeFailure};
use crate::executors;
use crate::models::{NodeConfig, NodeExecutionResult, NodeType};
use crate::runtime::NodeCx;

/// Runs one kind of node. Implementations resolve their own placeholders
/// from `cx.snapshot()` and return the node's output.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError>;
}

#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Executors for all built-in node types.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(NodeType::Tool, Arc::new(executors::ToolExecutor));
        registry.register(NodeType::Llm, Arc::new(executors::LlmExecutor));
        registry.register(NodeType::Agent, Arc::new(executors::AgentExecutor));
        registry.register(NodeType::Code, Arc::new(executors::CodeExecutor));
        registry.register(NodeType::Condition, Arc::new(executors::ConditionExecutor));
        registry.register(NodeType::Loop, Arc::new(executors::LoopExecutor));
        registry.register(NodeType::Parallel, Arc::new(executors::ParallelExecutor));
        registry.register(NodeType::Recursive, Arc::new(executors::RecursiveExecutor));
        registry.register(NodeType::Workflow, Arc::new(executors::SubWorkflowExecutor));
        registry
    }

    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type)
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.executors.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("ExecutorRegistry").field("types", &types).finish()
    }
}

/// A finished node: its result, plus the error that must stop the run, if any.
#[derive(Debug)]
pub(crate) struct Dispatched {
    pub result: NodeExecutionResult,
    pub abort: Option<EngineError>,
}

fn times_out_per_attempt(node_type: NodeType) -> bool {
    matches!(node_type, NodeType::Tool | NodeType::Llm | NodeType::Code)
}

pub(crate) async fn dispatch(node: Arc<NodeConfig>, cx: NodeCx) -> Dispatched {
    let started_at = Utc::now();
    let clock = Instant::now();
    let node_type = node.node_type();
    debug!(node_id = %node.id, %node_type, level = cx.level(), "dispatching node");

    let outcome = match cx.engine().executors().get(node_type) {
        None => Err(EngineError::invalid(
            &node.id,
            format!("no executor registered for '{node_type}' nodes"),
        )),
        Some(executor) => {
            let limit = if times_out_per_attempt(node_type) {
                None
            } else {
                node.timeout().or_else(|| cx.config().default_timeout())
            };
            let run = executor.execute(&node, &cx);
            match limit {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EngineError::Timeout {
                        node_id: node.id.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => run.await,
            }
        }
    };
    let outcome = outcome.and_then(|output| {
        cx.check_output(&output)?;
        Ok(output)
    });

    let metadata = cx.metadata(started_at, clock.elapsed());
    let budget = &cx.scope.budget;
    match outcome {
        Ok(output) => {
            budget.record_completion(node_type, true);
            debug!(node_id = %node.id, duration_ms = metadata.duration_ms, "node succeeded");
            Dispatched {
                result: NodeExecutionResult::succeeded(&node.id, node_type, output, metadata),
                abort: None,
            }
        }
        Err(err) => {
            budget.record_completion(node_type, false);
            let failure = NodeFailure::from(&err);
            let abort = if err.is_fatal_to_run() {
                error!(
                    node_id = %node.id,
                    kind = ?failure.kind,
                    error = %err,
                    "node failed, stopping run"
                );
                Some(err)
            } else {
                warn!(node_id = %node.id, kind = ?failure.kind, error = %err, "node failed");
                None
            };
            Dispatched {
                result: NodeExecutionResult::failed(&node.id, node_type, failure, metadata),
                abort,
            }
        }
    }
}
