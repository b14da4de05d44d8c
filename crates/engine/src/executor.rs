//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the entry point:
//! 1. Builds the execution plan (graph, caps, placeholder lint) and checks
//!    that every collaborator the plan needs is configured.
//! 2. Creates the run's worker semaphore, budget and cancellation token.
//! 3. Runs the graph level by level; see [`crate::scheduler`].
//! 4. Evicts the run's working memory and reports a [`RunResult`].
//!
//! Build-time problems are returned as `Err`. Everything that happens once
//! the run has started is reported inside the `RunResult`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::error::{EngineError, ErrorKind, RunFailure};
use crate::events::{EngineEvent, EventSender, EventSink};
use crate::models::{Blueprint, RunResult};
use crate::plan::ExecutionPlan;
use crate::runtime::{EngineContext, RunScope};
use crate::scheduler;

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Runs blueprints against one [`EngineContext`].
///
/// Cheap to clone; runs started from the same executor share nothing but
/// the engine's collaborators and long-term memory.
#[derive(Clone)]
pub struct WorkflowExecutor {
    engine: Arc<EngineContext>,
    events: EventSink,
}

impl WorkflowExecutor {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        Self {
            engine,
            events: EventSink::default(),
        }
    }

    /// Stream lifecycle events of every run to `sender`.
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = EventSink::new(sender);
        self
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    /// Validates `blueprint` without running it.
    pub fn plan(&self, blueprint: &Blueprint) -> Result<ExecutionPlan, EngineError> {
        let plan = ExecutionPlan::build(blueprint, self.engine.config())?;
        self.engine.check_plan(&plan)?;
        Ok(plan)
    }

    /// Run the blueprint with its declared inputs.
    ///
    /// # Errors
    /// Returns `EngineError` only for problems found before any node runs:
    /// duplicate ids, unknown dependencies, cycles, missing caps,
    /// unresolvable placeholders, malformed expressions or missing
    /// collaborators.
    pub async fn run(&self, blueprint: &Blueprint) -> Result<RunResult, EngineError> {
        self.run_with_inputs(blueprint, Value::Null).await
    }

    /// Like [`run`](Self::run), with `inputs` merged over the blueprint's own.
    #[instrument(skip(self, blueprint, inputs), fields(blueprint = %blueprint.name))]
    pub async fn run_with_inputs(
        &self,
        blueprint: &Blueprint,
        inputs: Value,
    ) -> Result<RunResult, EngineError> {
        let plan = Arc::new(self.plan(blueprint)?);

        let mut merged = plan.inputs().clone();
        match inputs {
            Value::Object(map) => merged.extend(map),
            Value::Null => {}
            other => {
                return Err(EngineError::invalid(
                    "<inputs>",
                    format!(
                        "run inputs must be an object, found {}",
                        crate::template::type_name(&other)
                    ),
                ))
            }
        }

        let config = self.engine.config();
        let max_parallel = plan.max_parallel().unwrap_or(config.max_parallel);
        let limits = plan.budget().cloned().unwrap_or_else(|| config.budget.clone());
        let scope = RunScope::root(
            Arc::clone(&self.engine),
            plan,
            max_parallel,
            limits,
            self.events.clone(),
        );

        Ok(execute_run(scope, Value::Object(merged)).await.result)
    }
}

// ---------------------------------------------------------------------------
// One run, top-level or nested
// ---------------------------------------------------------------------------

pub(crate) struct CompletedRun {
    pub result: RunResult,
    /// Run-fatal error that must propagate to an enclosing run.
    pub abort: Option<EngineError>,
}

pub(crate) async fn execute_run(scope: RunScope, inputs: Value) -> CompletedRun {
    let plan = Arc::clone(&scope.plan);
    let graph = plan.graph();
    info!(
        run_id = %scope.run_id,
        blueprint = plan.name(),
        nodes = graph.len(),
        levels = graph.levels().len(),
        "run started"
    );
    scope.events.emit(EngineEvent::WorkflowStarted {
        run_id: scope.run_id,
        name: plan.name().to_owned(),
        levels: graph.levels().len(),
    });

    let mut ctx = crate::context::WorkflowExecutionContext::new(scope.run_id, inputs);
    let outcome = scheduler::run_levels(graph, &mut ctx, &scope).await;

    let evicted = scope.engine.memory().end_run(scope.run_id);
    if evicted > 0 {
        info!(run_id = %scope.run_id, evicted, "working memory released");
    }

    let node_results: BTreeMap<_, _> = ctx.into_results().map(|r| (r.node_id.clone(), r)).collect();
    let failure_of = |node_id: &str| {
        node_results.get(node_id).and_then(|r| {
            r.error.as_ref().map(|e| RunFailure {
                kind: e.kind,
                node_id: Some(node_id.to_owned()),
                message: e.message.clone(),
            })
        })
    };

    let error = if let Some(err) = &outcome.abort {
        Some(RunFailure::from(err))
    } else if let Some(node_id) = &outcome.halted_by {
        failure_of(node_id)
    } else if outcome.cancelled {
        Some(RunFailure {
            kind: ErrorKind::Cancelled,
            node_id: None,
            message: "run was cancelled".to_owned(),
        })
    } else {
        graph
            .levels()
            .iter()
            .flatten()
            .find_map(|id| failure_of(id))
    };

    let metrics = scope.budget.snapshot();
    let result = RunResult {
        run_id: scope.run_id,
        success: error.is_none(),
        node_results,
        total_cost: metrics.cost,
        total_tokens: metrics.tokens,
        metrics,
        error,
    };

    match &result.error {
        None => info!(
            run_id = %result.run_id,
            tokens = result.total_tokens,
            cost = result.total_cost,
            "run succeeded"
        ),
        Some(failure) if failure.kind.is_governance() => error!(
            run_id = %result.run_id,
            kind = ?failure.kind,
            message = %failure.message,
            "run stopped by a limit"
        ),
        Some(failure) => warn!(
            run_id = %result.run_id,
            node_id = ?failure.node_id,
            message = %failure.message,
            "run failed"
        ),
    }
    scope.events.emit(EngineEvent::WorkflowFinished {
        run_id: result.run_id,
        result: Box::new(result.clone()),
    });

    CompletedRun {
        result,
        abort: outcome.abort,
    }
}
