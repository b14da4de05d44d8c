//! Level-by-level execution of a dependency graph.
//!
//! 1. Every node of a level is gated against the results recorded so far.
//! 2. Activated nodes are spawned together; leaf nodes wait for a worker slot
//!    from the run's shared semaphore before doing any work.
//! 3. The level ends at a barrier: results are recorded in completion order
//!    and the next level sees all of them.
//! 4. A run-fatal error, or a failure under `halt`, cancels the scope's token.
//!    In-flight siblings are recorded as cancelled and no later level starts.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::branch::{Activation, BranchGate};
use crate::context::WorkflowExecutionContext;
use crate::dag::DependencyGraph;
use crate::dispatch::{dispatch, Dispatched};
use crate::error::{EngineError, ErrorKind, NodeFailure};
use crate::events::EngineEvent;
use crate::models::{
    FailurePolicy, NodeConfig, NodeExecutionResult, NodeKind, NodeMetadata, NodeType,
};
use crate::runtime::{NodeCx, RunScope};

/// How a pass over the levels ended.
#[derive(Debug, Default)]
pub(crate) struct LevelsOutcome {
    /// Run-fatal error raised by some node.
    pub abort: Option<EngineError>,
    /// Node whose failure stopped the scope under `halt`.
    pub halted_by: Option<String>,
    /// The scope was cancelled from outside before it finished.
    pub cancelled: bool,
}

impl LevelsOutcome {
    pub fn stopped(&self) -> bool {
        self.abort.is_some() || self.halted_by.is_some() || self.cancelled
    }
}

pub(crate) async fn run_levels(
    graph: &DependencyGraph,
    ctx: &mut WorkflowExecutionContext,
    scope: &RunScope,
) -> LevelsOutcome {
    let mut gate = BranchGate::default();
    let mut outcome = LevelsOutcome::default();

    for (level_index, level) in graph.levels().iter().enumerate() {
        if scope.cancel.is_cancelled() {
            outcome.cancelled = true;
            return outcome;
        }
        debug!(run_id = %scope.run_id, level = level_index, nodes = level.len(), "starting level");

        let snapshot = ctx.snapshot();
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<String, NodeType> = HashMap::new();
        for node_id in level {
            let Some(node) = scope.plan.node(node_id).cloned() else {
                continue;
            };
            let deps = graph.dependencies(node_id);
            let activation = gate.activation(node_id, deps, ctx, |id| scope.policy_for(id));
            if let Activation::Skip(reason) = activation {
                debug!(node_id = %node_id, ?reason, "skipping node");
                scope.events.emit(EngineEvent::NodeSkipped {
                    run_id: scope.run_id,
                    node_id: scope.event_id(node_id),
                    reason: reason.clone(),
                });
                let skipped =
                    NodeExecutionResult::skipped(node_id, node.node_type(), reason, level_index);
                ctx.record(skipped);
                continue;
            }
            pending.insert(node_id.clone(), node.node_type());
            let cx = NodeCx::new(
                scope.clone(),
                Arc::clone(&node),
                Arc::clone(&snapshot),
                level_index,
            );
            tasks.spawn(run_node(node, cx));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(dispatched) => {
                    pending.remove(&dispatched.result.node_id);
                    settle(dispatched, scope, ctx, &mut gate, &mut outcome);
                }
                Err(join_error) => error!(error = %join_error, "node task ended abnormally"),
            }
        }
        for dispatched in abandoned(level, &pending, level_index) {
            settle(dispatched, scope, ctx, &mut gate, &mut outcome);
        }

        if outcome.abort.is_some() || outcome.halted_by.is_some() {
            return outcome;
        }
    }
    outcome
}

/// Records one finished node and applies the failure policy.
fn settle(
    dispatched: Dispatched,
    scope: &RunScope,
    ctx: &mut WorkflowExecutionContext,
    gate: &mut BranchGate,
    outcome: &mut LevelsOutcome,
) {
    let Dispatched { result, abort } = dispatched;

    if result.node_type == NodeType::Condition && result.success {
        let decision = result.output.get("decision").and_then(Value::as_bool);
        let spec = scope.plan.node(&result.node_id).map(|n| &n.kind);
        if let (Some(decision), Some(NodeKind::Condition(condition))) = (decision, spec) {
            ctx.record_decision(&result.node_id, decision);
            gate.record_decision(&result.node_id, condition, decision);
        }
    }

    if let Some(err) = abort {
        if outcome.abort.is_none() {
            scope.cancel.cancel();
            outcome.abort = Some(err);
        }
    } else if result.is_failed()
        && outcome.halted_by.is_none()
        && scope.policy_for(&result.node_id) == FailurePolicy::Halt
        && result
            .error
            .as_ref()
            .is_some_and(|e| e.kind != ErrorKind::Cancelled)
    {
        info!(node_id = %result.node_id, "halting after failure");
        scope.cancel.cancel();
        outcome.halted_by = Some(result.node_id.clone());
    }

    scope.events.emit(EngineEvent::NodeCompleted {
        run_id: scope.run_id,
        node_id: scope.event_id(&result.node_id),
        result: Box::new(result.clone()),
    });
    ctx.record(result);
}

/// Failed results for spawned nodes whose task never reported back, in
/// level order.
fn abandoned(
    level: &[String],
    pending: &HashMap<String, NodeType>,
    level_index: usize,
) -> Vec<Dispatched> {
    level
        .iter()
        .filter_map(|node_id| {
            let node_type = *pending.get(node_id)?;
            let err = EngineError::fatal(node_id, "node task ended abnormally");
            Some(failed(node_id, node_type, level_index, &err))
        })
        .collect()
}

fn failed(node_id: &str, node_type: NodeType, level: usize, err: &EngineError) -> Dispatched {
    let metadata = NodeMetadata {
        level,
        ..NodeMetadata::default()
    };
    Dispatched {
        result: NodeExecutionResult::failed(node_id, node_type, NodeFailure::from(err), metadata),
        abort: None,
    }
}

async fn run_node(node: Arc<NodeConfig>, cx: NodeCx) -> Dispatched {
    let cancel = cx.scope.cancel.clone();
    let node_id = node.id.clone();
    let node_type = node.node_type();
    let level = cx.level();

    let work = async {
        let _permit = if node_type.holds_worker_slot() {
            match Arc::clone(&cx.scope.semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return cancelled(&node_id, node_type, level),
            }
        } else {
            None
        };
        cx.scope.events.emit(EngineEvent::NodeStarted {
            run_id: cx.scope.run_id,
            node_id: cx.scope.event_id(&node_id),
        });
        AssertUnwindSafe(dispatch(node, cx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| panicked(&node_id, node_type, level, panic))
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => cancelled(&node_id, node_type, level),
        dispatched = work => dispatched,
    }
}

fn cancelled(node_id: &str, node_type: NodeType, level: usize) -> Dispatched {
    let err = EngineError::Cancelled {
        node_id: node_id.to_owned(),
    };
    failed(node_id, node_type, level, &err)
}

fn panicked(
    node_id: &str,
    node_type: NodeType,
    level: usize,
    panic: Box<dyn Any + Send>,
) -> Dispatched {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "executor panicked".to_owned());
    error!(node_id, %message, "executor panicked");
    let err = EngineError::fatal(node_id, format!("executor panicked: {message}"));
    failed(node_id, node_type, level, &err)
}
