//! Control-flow executors: `condition`, `loop` and `parallel`.
//!
//! None of them holds a worker slot. A loop drives its body through the
//! same scheduler as the run, so body nodes compete for the shared slots.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::context::WorkflowExecutionContext;
use crate::dispatch::NodeExecutor;
use crate::error::{EngineError, ErrorKind};
use crate::expression;
use crate::models::{FailurePolicy, NodeConfig, NodeKind, NodeStatus, NodeType};
use crate::runtime::NodeCx;
use crate::scheduler::{self, LevelsOutcome};
use crate::template;

// ---------------------------------------------------------------------------
// condition
// ---------------------------------------------------------------------------

/// Output: `{"decision": bool, "branch": "true" | "false", "activated": [ids]}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Condition(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Condition));
        };
        let decision = match cx.snapshot().decision(&node.id) {
            Some(cached) => cached,
            None => expression::evaluate_bool(&spec.expression, cx.snapshot(), &node.id)?,
        };
        let activated = if decision { &spec.true_branch } else { &spec.false_branch };
        debug!(node_id = %node.id, decision, "condition evaluated");
        Ok(json!({
            "decision": decision,
            "branch": if decision { "true" } else { "false" },
            "activated": activated,
        }))
    }
}

// ---------------------------------------------------------------------------
// loop
// ---------------------------------------------------------------------------

/// Runs the body once per item, all iterations concurrently.
///
/// Each iteration gets its own context with `loop.item` and `loop.index`.
/// Output is one entry per item, in item order:
/// `{"index", "item", "success", "outputs": {id: output}, "errors": {id: message}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopExecutor;

struct Iteration {
    index: usize,
    item: Value,
    ctx: WorkflowExecutionContext,
    outcome: LevelsOutcome,
}

impl Iteration {
    fn failed(&self) -> bool {
        self.outcome.stopped() || self.ctx.results().any(|r| r.is_failed())
    }

    /// First failure that is not just a cancellation caused by another one.
    fn failure(&self) -> Option<String> {
        let mut failures: Vec<_> = self
            .ctx
            .results()
            .filter_map(|r| r.error.as_ref().map(|e| (r.node_id.as_str(), e)))
            .collect();
        failures.sort_by_key(|(_, e)| e.kind == ErrorKind::Cancelled);
        failures
            .first()
            .map(|(id, e)| format!("'{id}': {}", e.message))
            .or_else(|| self.outcome.cancelled.then(|| "cancelled".to_owned()))
    }

    /// Failed only because a sibling iteration stopped the loop.
    fn cancelled_only(&self) -> bool {
        self.ctx
            .results()
            .filter_map(|r| r.error.as_ref())
            .all(|e| e.kind == ErrorKind::Cancelled)
    }

    fn into_value(self) -> Value {
        let success = !self.failed();
        let mut outputs = Map::new();
        let mut errors = Map::new();
        for result in self.ctx.results() {
            match result.status {
                NodeStatus::Succeeded => {
                    outputs.insert(result.node_id.clone(), result.output.clone());
                }
                NodeStatus::Failed => {
                    let message =
                        result.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
                    errors.insert(result.node_id.clone(), Value::String(message));
                }
                NodeStatus::Skipped => {}
            }
        }
        json!({
            "index": self.index,
            "item": self.item,
            "success": success,
            "outputs": outputs,
            "errors": errors,
        })
    }
}

#[async_trait]
impl NodeExecutor for LoopExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Loop(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Loop));
        };
        let items = match template::resolve_source(&spec.items_source, cx.snapshot(), &node.id)? {
            Value::Array(items) => items,
            other => {
                return Err(EngineError::fatal(
                    &node.id,
                    format!(
                        "items_source '{}' resolved to {}, expected an array",
                        spec.items_source,
                        template::type_name(&other)
                    ),
                ))
            }
        };
        if node.input_schema.is_some() {
            cx.check_input(&Value::Array(items.clone()))?;
        }
        if items.is_empty() {
            debug!(node_id = %node.id, "loop over empty list");
            return Ok(json!([]));
        }
        let body = cx
            .plan()
            .graph()
            .body(&node.id)
            .cloned()
            .ok_or_else(|| EngineError::invalid(&node.id, "loop body was not planned"))?;

        let policy = spec.iteration_policy.unwrap_or(cx.scope.policy);
        let loop_cancel = cx.scope.cancel.child_token();
        debug!(node_id = %node.id, iterations = items.len(), ?policy, "running loop");

        let iterations = items.into_iter().enumerate().map(|(index, item)| {
            let label = format!("{}{}[{index}]/", cx.scope.label, node.id);
            let scope = cx.scope.iteration(loop_cancel.child_token(), label);
            let mut locals = Map::new();
            locals.insert("loop".to_owned(), json!({"item": item.clone(), "index": index}));
            let ctx = WorkflowExecutionContext::scoped(Arc::clone(cx.snapshot()), locals);
            let body = Arc::clone(&body);
            let loop_cancel = loop_cancel.clone();
            async move {
                let mut ctx = ctx;
                let outcome = scheduler::run_levels(&body, &mut ctx, &scope).await;
                let iteration = Iteration {
                    index,
                    item,
                    ctx,
                    outcome,
                };
                if policy == FailurePolicy::Halt && iteration.failed() {
                    loop_cancel.cancel();
                }
                iteration
            }
        });
        let mut iterations = join_all(iterations).await;

        for iteration in &mut iterations {
            if let Some(err) = iteration.outcome.abort.take() {
                return Err(err);
            }
        }
        if policy == FailurePolicy::Halt {
            let failed: Vec<&Iteration> = iterations.iter().filter(|it| it.failed()).collect();
            let culprit = failed.iter().find(|it| !it.cancelled_only()).or(failed.first());
            if let Some(iteration) = culprit {
                return Err(EngineError::fatal(
                    &node.id,
                    format!(
                        "iteration {} failed: {}",
                        iteration.index,
                        iteration.failure().unwrap_or_else(|| "unknown failure".to_owned())
                    ),
                ));
            }
        }
        Ok(Value::Array(iterations.into_iter().map(Iteration::into_value).collect()))
    }
}

// ---------------------------------------------------------------------------
// parallel
// ---------------------------------------------------------------------------

/// Joins its branches, which the planner made its dependencies.
///
/// Output: `{"branches": [{id: output | null}], "failed": [ids], "skipped": [ids]}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Parallel(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Parallel));
        };
        let snapshot = cx.snapshot();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        let branches: Vec<Value> = spec
            .branches
            .iter()
            .map(|branch| {
                let mut outputs = Map::new();
                for id in branch {
                    let output = match snapshot.result(id) {
                        Some(r) if r.status == NodeStatus::Succeeded => r.output.clone(),
                        Some(r) if r.is_failed() => {
                            failed.push(id.clone());
                            Value::Null
                        }
                        _ => {
                            skipped.push(id.clone());
                            Value::Null
                        }
                    };
                    outputs.insert(id.clone(), output);
                }
                Value::Object(outputs)
            })
            .collect();

        Ok(json!({
            "branches": branches,
            "failed": failed,
            "skipped": skipped,
        }))
    }
}
