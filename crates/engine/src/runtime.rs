//! Collaborators and the handles passed down to executors.
//!
//! `EngineContext` is built once per process and shared by every run.
//! `RunScope` is the per-run state every node task carries: the plan, the
//! worker semaphore, the budget, the cancellation token and the event sink.
//! `NodeCx` is what a single executor sees; its collaborator helpers apply
//! retries, budget checks and metering so executors don't have to.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use memory::MemorySystem;
use nodes::{Generation, ModelConfig, ModelProvider, Sandbox, Tool, ToolContext, ToolRegistry};

use crate::budget::{BudgetLimits, BudgetTracker};
use crate::config::EngineConfig;
use crate::context::ContextSnapshot;
use crate::dispatch::{ExecutorRegistry, NodeExecutor};
use crate::error::EngineError;
use crate::events::EventSink;
use crate::models::{FailurePolicy, NodeConfig, NodeKind, NodeMetadata, NodeType};
use crate::plan::{ExecutionPlan, RECALL_TOOL, REMEMBER_TOOL};
use crate::retry::{with_retry, RetryPolicy};

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

pub struct EngineContext {
    config: EngineConfig,
    tools: ToolRegistry,
    model: Option<Arc<dyn ModelProvider>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    memory: Arc<MemorySystem>,
    executors: ExecutorRegistry,
}

impl EngineContext {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn memory(&self) -> &Arc<MemorySystem> {
        &self.memory
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn model(&self, node_id: &str) -> Result<&Arc<dyn ModelProvider>, EngineError> {
        self.model
            .as_ref()
            .ok_or_else(|| EngineError::invalid(node_id, "no model provider is configured"))
    }

    pub fn sandbox(&self, node_id: &str) -> Result<&Arc<dyn Sandbox>, EngineError> {
        self.sandbox
            .as_ref()
            .ok_or_else(|| EngineError::invalid(node_id, "no sandbox is configured"))
    }

    /// Checks that every collaborator a plan needs is present.
    pub fn check_plan(&self, plan: &ExecutionPlan) -> Result<(), EngineError> {
        let mut outcome = Ok(());
        plan.walk(&mut |owner, node| {
            if outcome.is_ok() {
                outcome = self.check_node(owner, node);
            }
        });
        outcome
    }

    fn check_node(&self, plan: &ExecutionPlan, node: &NodeConfig) -> Result<(), EngineError> {
        if !self.executors.contains(node.node_type()) {
            return Err(EngineError::invalid(
                &node.id,
                format!("no executor registered for '{}' nodes", node.node_type()),
            ));
        }
        match &node.kind {
            NodeKind::Tool(spec) => {
                if !self.tools.contains(&spec.tool_name) {
                    return Err(EngineError::invalid(
                        &node.id,
                        format!("tool '{}' is not registered", spec.tool_name),
                    ));
                }
            }
            NodeKind::Llm(_) => {
                self.model(&node.id)?;
            }
            NodeKind::Code(_) => {
                self.sandbox(&node.id)?;
            }
            NodeKind::Agent(agent) => {
                self.model(&node.id)?;
                self.check_agent_tools(plan, &node.id, &agent.tools)?;
            }
            NodeKind::Recursive(spec) => {
                self.model(&node.id)?;
                for participant in &spec.participants {
                    self.check_agent_tools(plan, &node.id, &participant.tools)?;
                }
            }
            NodeKind::Condition(_)
            | NodeKind::Loop(_)
            | NodeKind::Parallel(_)
            | NodeKind::Workflow(_) => {}
        }
        Ok(())
    }

    fn check_agent_tools(
        &self,
        plan: &ExecutionPlan,
        node_id: &str,
        tools: &[String],
    ) -> Result<(), EngineError> {
        for tool in tools {
            let known = self.tools.contains(tool)
                || plan.agent(tool).is_some()
                || tool == REMEMBER_TOOL
                || tool == RECALL_TOOL;
            if !known {
                return Err(EngineError::invalid(
                    node_id,
                    format!("agent tool '{tool}' is neither a registered tool nor an agent"),
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("tools", &self.tools.names())
            .field("model", &self.model.is_some())
            .field("sandbox", &self.sandbox.is_some())
            .finish()
    }
}

/// Assembles an [`EngineContext`]. Executors for every built-in node type
/// are registered up front; `executor` replaces one explicitly.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    tools: ToolRegistry,
    model: Option<Arc<dyn ModelProvider>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    memory: Option<Arc<MemorySystem>>,
    executors: ExecutorRegistry,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn memory(mut self, memory: Arc<MemorySystem>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn executor(mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.register(node_type, executor);
        self
    }

    pub fn build(self) -> Arc<EngineContext> {
        Arc::new(EngineContext {
            config: self.config,
            tools: self.tools,
            model: self.model,
            sandbox: self.sandbox,
            memory: self.memory.unwrap_or_default(),
            executors: self.executors,
        })
    }
}

// ---------------------------------------------------------------------------
// RunScope
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct RunScope {
    pub run_id: Uuid,
    pub engine: Arc<EngineContext>,
    pub plan: Arc<ExecutionPlan>,
    pub budget: Arc<BudgetTracker>,
    pub semaphore: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub events: EventSink,
    /// Default failure policy of this run.
    pub policy: FailurePolicy,
    /// Prefix for node ids in events, e.g. `each[2]/` inside a loop iteration.
    pub label: String,
}

impl RunScope {
    pub fn root(
        engine: Arc<EngineContext>,
        plan: Arc<ExecutionPlan>,
        max_parallel: usize,
        limits: BudgetLimits,
        events: EventSink,
    ) -> Self {
        let policy = plan.failure_policy().unwrap_or(engine.config().failure_policy);
        Self {
            run_id: Uuid::new_v4(),
            engine,
            plan,
            budget: Arc::new(BudgetTracker::new(limits)),
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            cancel: CancellationToken::new(),
            events,
            policy,
            label: String::new(),
        }
    }

    /// A nested run: fresh id and context, shared workers, budget and events.
    pub fn nested(&self, plan: Arc<ExecutionPlan>) -> Self {
        let policy = plan.failure_policy().unwrap_or(self.engine.config().failure_policy);
        Self {
            run_id: Uuid::new_v4(),
            engine: Arc::clone(&self.engine),
            plan,
            budget: Arc::new(BudgetTracker::child(&self.budget)),
            semaphore: Arc::clone(&self.semaphore),
            cancel: self.cancel.child_token(),
            events: self.events.clone(),
            policy,
            label: String::new(),
        }
    }

    /// One loop iteration of this run.
    pub fn iteration(&self, cancel: CancellationToken, label: String) -> Self {
        Self {
            cancel,
            label,
            ..self.clone()
        }
    }

    pub fn policy_for(&self, node_id: &str) -> FailurePolicy {
        self.plan
            .node(node_id)
            .and_then(|n| n.failure_policy)
            .unwrap_or(self.policy)
    }

    pub fn event_id(&self, node_id: &str) -> String {
        format!("{}{node_id}", self.label)
    }
}

// ---------------------------------------------------------------------------
// NodeCx
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct NodeMeter {
    attempts: AtomicU32,
    calls: AtomicU64,
    tokens: AtomicU64,
    cost_micros: AtomicU64,
}

/// Everything an executor may use while running one node.
pub struct NodeCx {
    pub(crate) scope: RunScope,
    node: Arc<NodeConfig>,
    snapshot: Arc<ContextSnapshot>,
    level: usize,
    meter: NodeMeter,
}

impl NodeCx {
    pub(crate) fn new(
        scope: RunScope,
        node: Arc<NodeConfig>,
        snapshot: Arc<ContextSnapshot>,
        level: usize,
    ) -> Self {
        Self {
            scope,
            node,
            snapshot,
            level,
            meter: NodeMeter::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.scope.run_id
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node.node_type()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Results and inputs visible to this node.
    pub fn snapshot(&self) -> &Arc<ContextSnapshot> {
        &self.snapshot
    }

    pub fn engine(&self) -> &EngineContext {
        &self.scope.engine
    }

    pub fn config(&self) -> &EngineConfig {
        self.scope.engine.config()
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.scope.plan
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.cancel.is_cancelled()
    }

    /// Checks `value` against this node's compiled input schema, if any.
    pub fn check_input(&self, value: &Value) -> Result<(), EngineError> {
        match self.plan().schemas(self.node_id()) {
            Some(schemas) => schemas.check_input(self.node_id(), value),
            None => Ok(()),
        }
    }

    pub fn check_output(&self, value: &Value) -> Result<(), EngineError> {
        match self.plan().schemas(self.node_id()) {
            Some(schemas) => schemas.check_output(self.node_id(), value),
            None => Ok(()),
        }
    }

    /// This node's retry settings, with its per-attempt timeout.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::for_node(&self.node, self.config())
    }

    /// Invokes a registered tool with retries; each attempt counts as a call.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        args: Value,
        policy: &RetryPolicy,
    ) -> Result<Value, EngineError> {
        let node_id = self.node_id();
        let tool = self
            .engine()
            .tools()
            .get(tool_name)
            .ok_or_else(|| {
                EngineError::fatal(node_id, format!("tool '{tool_name}' is not registered"))
            })?;

        let (value, _) = with_retry(node_id, policy, |attempt| {
            let tool = Arc::clone(&tool);
            let args = args.clone();
            async move {
                self.before_call()?;
                debug!(node_id, tool = tool_name, attempt, "calling tool");
                let ctx = ToolContext {
                    run_id: self.run_id(),
                    node_id: node_id.to_owned(),
                    attempt,
                };
                tool.execute(args, &ctx).await.map_err(|source| EngineError::Tool {
                    node_id: node_id.to_owned(),
                    tool: tool_name.to_owned(),
                    source,
                })
            }
        })
        .await?;
        Ok(value)
    }

    /// One model generation with the budget preflight before every attempt.
    pub async fn generate(
        &self,
        prompt: &str,
        config: &ModelConfig,
        policy: &RetryPolicy,
    ) -> Result<Generation, EngineError> {
        let node_id = self.node_id();
        let model = Arc::clone(self.engine().model(node_id)?);

        let (generation, _) = with_retry(node_id, policy, |_| {
            let model = Arc::clone(&model);
            async move {
                self.scope.budget.check_model_call(node_id, config.max_tokens)?;
                self.before_call()?;
                let generation = model
                    .generate(prompt, config)
                    .await
                    .map_err(|source| EngineError::Model {
                        node_id: node_id.to_owned(),
                        source,
                    })?;
                let tokens = generation.usage.total();
                let cost = generation
                    .usage
                    .cost
                    .unwrap_or(tokens as f64 / 1000.0 * self.config().cost_per_1k_tokens);
                self.absorb_usage(tokens, cost, 0);
                self.scope
                    .budget
                    .record_usage(node_id, self.node_type(), tokens, cost)?;
                Ok(generation)
            }
        })
        .await?;
        Ok(generation)
    }

    /// Runs untrusted code; import violations are never retried.
    pub async fn run_sandboxed(
        &self,
        code: &str,
        inputs: Value,
        allowed_imports: &[String],
        policy: &RetryPolicy,
    ) -> Result<Value, EngineError> {
        let node_id = self.node_id();
        let sandbox = Arc::clone(self.engine().sandbox(node_id)?);

        let (value, _) = with_retry(node_id, policy, |_| {
            let sandbox = Arc::clone(&sandbox);
            let inputs = inputs.clone();
            async move {
                self.before_call()?;
                sandbox
                    .run_sandboxed(code, inputs, allowed_imports)
                    .await
                    .map_err(|source| EngineError::Sandbox {
                        node_id: node_id.to_owned(),
                        source,
                    })
            }
        })
        .await?;
        Ok(value)
    }

    fn before_call(&self) -> Result<(), EngineError> {
        self.scope
            .budget
            .reserve_call(self.node_id(), self.node_type())?;
        self.meter.attempts.fetch_add(1, Ordering::Relaxed);
        self.meter.calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Adds usage to this node's metadata without touching the budget.
    pub(crate) fn absorb_usage(&self, tokens: u64, cost: f64, calls: u64) {
        self.meter.tokens.fetch_add(tokens, Ordering::Relaxed);
        self.meter
            .cost_micros
            .fetch_add((cost.max(0.0) * 1_000_000.0).round() as u64, Ordering::Relaxed);
        self.meter.calls.fetch_add(calls, Ordering::Relaxed);
    }

    pub(crate) fn metadata(&self, started_at: DateTime<Utc>, elapsed: Duration) -> NodeMetadata {
        NodeMetadata {
            level: self.level,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            duration_ms: elapsed.as_millis() as u64,
            attempts: self.meter.attempts.load(Ordering::Relaxed),
            tokens: self.meter.tokens.load(Ordering::Relaxed),
            cost: self.meter.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            calls: self.meter.calls.load(Ordering::Relaxed),
        }
    }
}
