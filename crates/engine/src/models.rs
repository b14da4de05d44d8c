//! Core domain models for the workflow engine.
//!
//! A `Blueprint` is the declarative description of a workflow; it is
//! deserialised from JSON and never mutated during a run. Results flow back
//! out as `NodeExecutionResult`s collected into a `RunResult`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::budget::{BudgetLimits, BudgetSnapshot};
use crate::error::{EngineError, NodeFailure, RunFailure};

// ---------------------------------------------------------------------------
// FailurePolicy
// ---------------------------------------------------------------------------

/// What the scheduler does after a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the current level; later levels are never started.
    #[default]
    Halt,
    /// Keep running everything that does not depend on the failed node.
    ContinuePossible,
    /// Run every node; dependents see the failure in their context.
    Always,
}

// ---------------------------------------------------------------------------
// NodeType
// ---------------------------------------------------------------------------

/// Discriminant of the closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Tool,
    Llm,
    Agent,
    Code,
    Condition,
    Loop,
    Parallel,
    Recursive,
    Workflow,
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::Tool,
        NodeType::Llm,
        NodeType::Agent,
        NodeType::Code,
        NodeType::Condition,
        NodeType::Loop,
        NodeType::Parallel,
        NodeType::Recursive,
        NodeType::Workflow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Tool => "tool",
            NodeType::Llm => "llm",
            NodeType::Agent => "agent",
            NodeType::Code => "code",
            NodeType::Condition => "condition",
            NodeType::Loop => "loop",
            NodeType::Parallel => "parallel",
            NodeType::Recursive => "recursive",
            NodeType::Workflow => "workflow",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Leaf nodes talk to a collaborator and occupy a worker slot while they
    /// run. Orchestrating nodes only wait on other nodes and must not hold a
    /// slot, otherwise a loop could starve its own body.
    pub fn holds_worker_slot(self) -> bool {
        matches!(
            self,
            NodeType::Tool | NodeType::Llm | NodeType::Agent | NodeType::Code | NodeType::Recursive
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// Invoke a registered tool with resolved arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolNode {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// A single model generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmNode {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Also used as the token reservation for the budget preflight.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Long-term memory wiring for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    pub domain: String,
    /// Episodic session; the run id when unset.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
    /// Persist the episode and the procedural outcome when the agent finishes.
    #[serde(default = "default_true")]
    pub remember: bool,
}

fn default_recall_limit() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// A multi-step tool-using agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    /// Identity on the agent call stack; the node id when unset.
    #[serde(default)]
    pub agent_id: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Registered tools, other agents by id, or the built-ins `remember` and `recall`.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Required; a blueprint without it is rejected.
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub memory: Option<AgentMemory>,
}

impl AgentNode {
    pub fn new(prompt: impl Into<String>, max_steps: u32) -> Self {
        Self {
            agent_id: None,
            prompt: prompt.into(),
            system_prompt: None,
            tools: Vec::new(),
            max_steps: Some(max_steps),
            model: None,
            memory: None,
        }
    }

    pub fn with_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_memory(mut self, domain: impl Into<String>) -> Self {
        self.memory = Some(AgentMemory {
            domain: domain.into(),
            session_id: None,
            recall_limit: default_recall_limit(),
            remember: true,
        });
        self
    }
}

/// Sandboxed code execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeNode {
    pub code: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub allowed_imports: Vec<String>,
}

/// Routes execution to one of two branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub expression: String,
    #[serde(default)]
    pub true_branch: Vec<String>,
    #[serde(default)]
    pub false_branch: Vec<String>,
}

/// Runs `body_nodes` once per element of the resolved `items_source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNode {
    /// Path or single placeholder resolving to an array, e.g. `inputs.items`.
    pub items_source: String,
    pub body_nodes: Vec<String>,
    /// Whether one failed iteration stops the others; the run default when unset.
    #[serde(default)]
    pub iteration_policy: Option<FailurePolicy>,
}

/// Joins independent branches into one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelNode {
    pub branches: Vec<Vec<String>>,
}

/// Multi-agent rounds until convergence or the round cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecursiveNode {
    pub participants: Vec<AgentNode>,
    pub prompt: String,
    /// Required; a blueprint without it is rejected.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// Convergence predicate over `round`, `last` and `transcript`.
    #[serde(default)]
    pub until: Option<String>,
}

/// Executes a nested blueprint with its own context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub blueprint: Box<Blueprint>,
    /// Templates resolved against the parent context and merged over the
    /// nested blueprint's own inputs.
    #[serde(default)]
    pub inputs: Value,
}

/// The per-type payload of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Tool(ToolNode),
    Llm(LlmNode),
    Agent(AgentNode),
    Code(CodeNode),
    Condition(ConditionNode),
    Loop(LoopNode),
    Parallel(ParallelNode),
    Recursive(RecursiveNode),
    Workflow(WorkflowNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Tool(_) => NodeType::Tool,
            NodeKind::Llm(_) => NodeType::Llm,
            NodeKind::Agent(_) => NodeType::Agent,
            NodeKind::Code(_) => NodeType::Code,
            NodeKind::Condition(_) => NodeType::Condition,
            NodeKind::Loop(_) => NodeType::Loop,
            NodeKind::Parallel(_) => NodeType::Parallel,
            NodeKind::Recursive(_) => NodeType::Recursive,
            NodeKind::Workflow(_) => NodeType::Workflow,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier within this blueprint.
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Overrides the engine's `max_retries`.
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    /// Overrides the run's failure policy for failures of this node.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            dependencies: Vec::new(),
            retries: None,
            timeout_ms: None,
            input_schema: None,
            output_schema: None,
            failure_policy: None,
        }
    }

    pub fn tool(id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self::new(
            id,
            NodeKind::Tool(ToolNode {
                tool_name: tool_name.into(),
                args,
            }),
        )
    }

    pub fn llm(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Llm(LlmNode {
                prompt: prompt.into(),
                system_prompt: None,
                model: None,
                temperature: None,
                max_tokens: None,
            }),
        )
    }

    pub fn agent(id: impl Into<String>, agent: AgentNode) -> Self {
        Self::new(id, NodeKind::Agent(agent))
    }

    pub fn code(id: impl Into<String>, code: impl Into<String>, inputs: Value) -> Self {
        Self::new(
            id,
            NodeKind::Code(CodeNode {
                code: code.into(),
                inputs,
                allowed_imports: Vec::new(),
            }),
        )
    }

    pub fn condition(
        id: impl Into<String>,
        expression: impl Into<String>,
        true_branch: &[&str],
        false_branch: &[&str],
    ) -> Self {
        Self::new(
            id,
            NodeKind::Condition(ConditionNode {
                expression: expression.into(),
                true_branch: true_branch.iter().map(|s| s.to_string()).collect(),
                false_branch: false_branch.iter().map(|s| s.to_string()).collect(),
            }),
        )
    }

    pub fn loop_over(
        id: impl Into<String>,
        items_source: impl Into<String>,
        body: &[&str],
    ) -> Self {
        Self::new(
            id,
            NodeKind::Loop(LoopNode {
                items_source: items_source.into(),
                body_nodes: body.iter().map(|s| s.to_string()).collect(),
                iteration_policy: None,
            }),
        )
    }

    pub fn parallel(id: impl Into<String>, branches: &[&[&str]]) -> Self {
        Self::new(
            id,
            NodeKind::Parallel(ParallelNode {
                branches: branches
                    .iter()
                    .map(|b| b.iter().map(|s| s.to_string()).collect())
                    .collect(),
            }),
        )
    }

    pub fn recursive(id: impl Into<String>, recursive: RecursiveNode) -> Self {
        Self::new(id, NodeKind::Recursive(recursive))
    }

    pub fn workflow(id: impl Into<String>, blueprint: Blueprint, inputs: Value) -> Self {
        Self::new(
            id,
            NodeKind::Workflow(WorkflowNode {
                blueprint: Box::new(blueprint),
                inputs,
            }),
        )
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Blueprint
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default = "default_blueprint_name")]
    pub name: String,
    pub nodes: Vec<NodeConfig>,
    /// Run inputs, addressable as `{{inputs.*}}`.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Overrides the engine's `max_parallel`.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Overrides the engine's default failure policy.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    /// Overrides the engine's budget limits.
    #[serde(default)]
    pub budget: Option<BudgetLimits>,
}

fn default_blueprint_name() -> String {
    "blueprint".to_string()
}

impl Blueprint {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            name: name.into(),
            nodes,
            inputs: Map::new(),
            max_parallel: None,
            failure_policy: None,
            budget: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::invalid("<blueprint>", e.to_string()))
    }

    /// Replaces the run inputs. Non-object values are ignored.
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        if let Value::Object(map) = inputs {
            self.inputs = map;
        }
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn with_budget(mut self, budget: BudgetLimits) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Why a node was recorded without running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Sits on the branch a condition did not take.
    BranchNotTaken { condition: String },
    /// Every dependency was skipped.
    DependenciesSkipped,
    /// Pruned because a dependency failed (or was itself pruned).
    UpstreamFailed { dependency: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub level: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub attempts: u32,
    pub tokens: u64,
    pub cost: f64,
    pub calls: u64,
}

/// Outcome of a single node, recorded exactly once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub node_id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub success: bool,
    pub output: Value,
    pub error: Option<NodeFailure>,
    pub skip_reason: Option<SkipReason>,
    pub metadata: NodeMetadata,
}

impl NodeExecutionResult {
    pub fn succeeded(
        node_id: impl Into<String>,
        node_type: NodeType,
        output: Value,
        metadata: NodeMetadata,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            status: NodeStatus::Succeeded,
            success: true,
            output,
            error: None,
            skip_reason: None,
            metadata,
        }
    }

    pub fn failed(
        node_id: impl Into<String>,
        node_type: NodeType,
        error: NodeFailure,
        metadata: NodeMetadata,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            status: NodeStatus::Failed,
            success: false,
            output: Value::Null,
            error: Some(error),
            skip_reason: None,
            metadata,
        }
    }

    pub fn skipped(
        node_id: impl Into<String>,
        node_type: NodeType,
        reason: SkipReason,
        level: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            status: NodeStatus::Skipped,
            success: false,
            output: Value::Null,
            error: None,
            skip_reason: Some(reason),
            metadata: NodeMetadata {
                level,
                ..NodeMetadata::default()
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == NodeStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == NodeStatus::Skipped
    }
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub success: bool,
    pub node_results: BTreeMap<String, NodeExecutionResult>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub metrics: BudgetSnapshot,
    pub error: Option<RunFailure>,
}

impl RunResult {
    pub fn result(&self, node_id: &str) -> Option<&NodeExecutionResult> {
        self.node_results.get(node_id)
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.node_results.get(node_id).map(|r| &r.output)
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_results.get(node_id).map(|r| r.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blueprint_parses_from_json() {
        let bp = Blueprint::from_json(
            r#"{
                "name": "triage",
                "inputs": {"ticket": "printer on fire"},
                "nodes": [
                    {"id": "fetch", "type": "tool", "tool_name": "http_get",
                     "args": {"url": "{{inputs.ticket}}"}, "retries": 2},
                    {"id": "gate", "type": "condition", "expression": "{{fetch.status}} == 200",
                     "true_branch": ["summarize"], "dependencies": ["fetch"]},
                    {"id": "summarize", "type": "llm", "prompt": "Summarize {{fetch.body}}",
                     "max_tokens": 256, "failure_policy": "continue_possible"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(bp.name, "triage");
        assert_eq!(bp.nodes.len(), 3);
        assert_eq!(bp.nodes[0].node_type(), NodeType::Tool);
        assert_eq!(bp.nodes[0].retries, Some(2));
        match &bp.nodes[2].kind {
            NodeKind::Llm(llm) => assert_eq!(llm.max_tokens, Some(256)),
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(bp.nodes[2].failure_policy, Some(FailurePolicy::ContinuePossible));
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let err =
            Blueprint::from_json(r#"{"nodes": [{"id": "x", "type": "teleport"}]}"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBlueprint { .. }));
    }

    #[test]
    fn agent_memory_defaults() {
        let bp = Blueprint::from_json(
            r#"{"nodes": [{"id": "a", "type": "agent", "prompt": "hi", "max_steps": 3,
                           "memory": {"domain": "support"}}]}"#,
        )
        .unwrap();
        let NodeKind::Agent(agent) = &bp.nodes[0].kind else {
            panic!("expected agent");
        };
        let memory = agent.memory.as_ref().unwrap();
        assert_eq!(memory.recall_limit, 5);
        assert!(memory.remember);
    }

    #[test]
    fn only_leaf_kinds_hold_worker_slots() {
        let leaves: Vec<_> = NodeType::ALL.iter().filter(|t| t.holds_worker_slot()).collect();
        assert_eq!(leaves.len(), 5);
        assert!(!NodeType::Loop.holds_worker_slot());
        assert!(!NodeType::Workflow.holds_worker_slot());
    }

    #[test]
    fn skipped_result_serialises_reason() {
        let result = NodeExecutionResult::skipped(
            "x",
            NodeType::Tool,
            SkipReason::BranchNotTaken { condition: "gate".into() },
            2,
        );
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["status"], "skipped");
        assert_eq!(v["skip_reason"], json!({"reason": "branch_not_taken", "condition": "gate"}));
        assert_eq!(v["metadata"]["level"], 2);
    }
}
