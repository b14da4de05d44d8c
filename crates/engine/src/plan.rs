//! Build-time validation: everything that can be rejected before a run starts.
//!
//! An `ExecutionPlan` is a blueprint that passed graph construction, cap
//! checks, expression parsing, schema compilation and the placeholder lint. Nested `workflow`
//! nodes are planned recursively up to `max_workflow_depth`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::budget::BudgetLimits;
use crate::config::EngineConfig;
use crate::dag::DependencyGraph;
use crate::error::EngineError;
use crate::expression;
use crate::models::{AgentNode, Blueprint, FailurePolicy, NodeConfig, NodeKind};
use crate::schema::NodeSchemas;
use crate::template::{self, Placeholder};

/// Built-in agent tools backed by semantic memory.
pub const REMEMBER_TOOL: &str = "remember";
pub const RECALL_TOOL: &str = "recall";

/// Locals available to a recursive node's `until` and participant prompts.
const ROUND_LOCALS: [&str; 3] = ["round", "last", "transcript"];

#[derive(Debug)]
pub struct ExecutionPlan {
    name: String,
    graph: DependencyGraph,
    order: Vec<String>,
    nodes: HashMap<String, Arc<NodeConfig>>,
    /// Agent identity to node id.
    agents: HashMap<String, String>,
    nested: HashMap<String, Arc<ExecutionPlan>>,
    /// Compiled contracts of the nodes that declare any.
    schemas: HashMap<String, NodeSchemas>,
    inputs: Map<String, Value>,
    max_parallel: Option<usize>,
    failure_policy: Option<FailurePolicy>,
    budget: Option<BudgetLimits>,
    depth: u32,
}

impl ExecutionPlan {
    pub fn build(blueprint: &Blueprint, config: &EngineConfig) -> Result<Self, EngineError> {
        Self::build_at(blueprint, config, 0)
    }

    fn build_at(
        blueprint: &Blueprint,
        config: &EngineConfig,
        depth: u32,
    ) -> Result<Self, EngineError> {
        let graph = DependencyGraph::build(&blueprint.nodes)?;

        let mut agents = HashMap::new();
        let mut nested = HashMap::new();
        let mut schemas = HashMap::new();
        for node in &blueprint.nodes {
            let compiled = NodeSchemas::compile(node)?;
            if !compiled.is_empty() {
                schemas.insert(node.id.clone(), compiled);
            }
            match &node.kind {
                NodeKind::Agent(agent) => {
                    check_agent(&node.id, agent)?;
                    let identity = agent.agent_id.clone().unwrap_or_else(|| node.id.clone());
                    if let Some(other) = agents.insert(identity.clone(), node.id.clone()) {
                        return Err(EngineError::invalid(
                            &node.id,
                            format!("agent id '{identity}' is also used by node '{other}'"),
                        ));
                    }
                }
                NodeKind::Recursive(spec) => {
                    match spec.max_rounds {
                        Some(rounds) if rounds > 0 => {}
                        _ => {
                            return Err(EngineError::RecursionLimit {
                                node_id: node.id.clone(),
                                message: "max_rounds must be set to a positive number".into(),
                            })
                        }
                    }
                    if spec.participants.is_empty() {
                        return Err(EngineError::invalid(
                            &node.id,
                            "a recursive node needs participants",
                        ));
                    }
                    for participant in &spec.participants {
                        check_agent(&node.id, participant)?;
                    }
                    if let Some(until) = &spec.until {
                        parse_expression(&node.id, until)?;
                    }
                }
                NodeKind::Condition(spec) => parse_expression(&node.id, &spec.expression)?,
                NodeKind::Loop(spec) => {
                    let source = spec.items_source.trim();
                    let braced = source.strip_prefix("{{").and_then(|s| s.strip_suffix("}}"));
                    let parsed = match braced {
                        Some(inner) => Placeholder::parse(inner),
                        None => Placeholder::parse(source),
                    };
                    parsed.map_err(|reason| EngineError::UnresolvedPlaceholder {
                        node_id: node.id.clone(),
                        placeholder: spec.items_source.clone(),
                        reason,
                    })?;
                }
                NodeKind::Workflow(spec) => {
                    if depth + 1 > config.max_workflow_depth {
                        return Err(EngineError::RecursionLimit {
                            node_id: node.id.clone(),
                            message: format!(
                                "workflow nesting exceeds depth {}",
                                config.max_workflow_depth
                            ),
                        });
                    }
                    let child = Self::build_at(&spec.blueprint, config, depth + 1)?;
                    nested.insert(node.id.clone(), Arc::new(child));
                }
                NodeKind::Tool(_)
                | NodeKind::Llm(_)
                | NodeKind::Code(_)
                | NodeKind::Parallel(_) => {}
            }
        }

        let plan = Self {
            name: blueprint.name.clone(),
            graph,
            order: blueprint.nodes.iter().map(|n| n.id.clone()).collect(),
            nodes: blueprint
                .nodes
                .iter()
                .map(|n| (n.id.clone(), Arc::new(n.clone())))
                .collect(),
            agents,
            nested,
            schemas,
            inputs: blueprint.inputs.clone(),
            max_parallel: blueprint.max_parallel,
            failure_policy: blueprint.failure_policy,
            budget: blueprint.budget.clone(),
            depth,
        };
        plan.lint()?;
        Ok(plan)
    }

    /// Every placeholder must name `inputs`, a loop local inside a loop body,
    /// a round local inside a recursive node, or one of the node's own
    /// declared or implicit dependencies that is visible from its scope.
    fn lint(&self) -> Result<(), EngineError> {
        for id in &self.order {
            let node = &self.nodes[id];
            let direct = self.graph.direct_dependencies(id);
            let in_loop = self.graph.owner(id).is_some();
            let visible = |dep: &str| match self.graph.owner(dep) {
                Some(loop_id) => self.graph.encloses(loop_id, id),
                None => true,
            };

            let check = |placeholders: Vec<Placeholder>, extra: &[&str]| {
                for placeholder in placeholders {
                    let root = placeholder.root.as_str();
                    let allowed = root == "inputs"
                        || (in_loop && root == "loop")
                        || extra.contains(&root)
                        || (direct.iter().any(|d| d == root) && visible(root));
                    if !allowed {
                        let reason = if self.nodes.contains_key(root) {
                            format!("'{root}' is not a direct dependency of '{id}'")
                        } else {
                            format!("unknown root '{root}'")
                        };
                        return Err(EngineError::UnresolvedPlaceholder {
                            node_id: id.clone(),
                            placeholder: placeholder.raw,
                            reason,
                        });
                    }
                }
                Ok::<(), EngineError>(())
            };
            let malformed = |reason: String| EngineError::UnresolvedPlaceholder {
                node_id: id.clone(),
                placeholder: String::new(),
                reason,
            };
            let text = |s: &str| template::placeholders(s).map_err(malformed);
            let value = |v: &Value| template::placeholders_in_value(v).map_err(malformed);

            match &node.kind {
                NodeKind::Tool(spec) => check(value(&spec.args)?, &[])?,
                NodeKind::Llm(spec) => {
                    check(text(&spec.prompt)?, &[])?;
                    if let Some(system) = &spec.system_prompt {
                        check(text(system)?, &[])?;
                    }
                }
                NodeKind::Agent(spec) => {
                    check(text(&spec.prompt)?, &[])?;
                    if let Some(system) = &spec.system_prompt {
                        check(text(system)?, &[])?;
                    }
                }
                NodeKind::Code(spec) => check(value(&spec.inputs)?, &[])?,
                NodeKind::Condition(spec) => check(text(&spec.expression)?, &[])?,
                NodeKind::Loop(spec) => {
                    let source = spec.items_source.trim();
                    if source.contains("{{") {
                        check(text(source)?, &[])?;
                    } else {
                        check(vec![Placeholder::parse(source).map_err(malformed)?], &[])?;
                    }
                }
                NodeKind::Parallel(_) => {}
                NodeKind::Recursive(spec) => {
                    check(text(&spec.prompt)?, &[])?;
                    for participant in &spec.participants {
                        check(text(&participant.prompt)?, &ROUND_LOCALS)?;
                    }
                    if let Some(until) = &spec.until {
                        check(text(until)?, &ROUND_LOCALS)?;
                    }
                }
                NodeKind::Workflow(spec) => check(value(&spec.inputs)?, &[])?,
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<NodeConfig>> {
        self.nodes.get(node_id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.order.iter().filter_map(|id| self.nodes.get(id).map(Arc::as_ref))
    }

    pub fn schemas(&self, node_id: &str) -> Option<&NodeSchemas> {
        self.schemas.get(node_id)
    }

    pub fn nested(&self, node_id: &str) -> Option<&Arc<ExecutionPlan>> {
        self.nested.get(node_id)
    }

    pub fn nested_plans(&self) -> impl Iterator<Item = &ExecutionPlan> {
        self.nested.values().map(Arc::as_ref)
    }

    /// The agent node answering to `identity`, if any.
    pub fn agent(&self, identity: &str) -> Option<(&NodeConfig, &AgentNode)> {
        let node = self.nodes.get(self.agents.get(identity)?)?;
        match &node.kind {
            NodeKind::Agent(agent) => Some((node.as_ref(), agent)),
            _ => None,
        }
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }

    pub fn failure_policy(&self) -> Option<FailurePolicy> {
        self.failure_policy
    }

    pub fn budget(&self) -> Option<&BudgetLimits> {
        self.budget.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Levels, loop bodies and nested plans as JSON, for display.
    pub fn describe(&self) -> Value {
        let levels = |graph: &DependencyGraph| -> Value {
            graph
                .levels()
                .iter()
                .map(|level| {
                    level
                        .iter()
                        .map(|id| {
                            let kind = self
                                .nodes
                                .get(id)
                                .map(|n| n.node_type().as_str())
                                .unwrap_or("?");
                            json!({"id": id, "type": kind})
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
                .into()
        };

        let mut bodies = Map::new();
        let mut nested = Map::new();
        for node in self.nodes() {
            if let Some(body) = self.graph.body(&node.id) {
                bodies.insert(node.id.clone(), levels(body));
            }
            if let Some(child) = self.nested.get(&node.id) {
                nested.insert(node.id.clone(), child.describe());
            }
        }
        json!({
            "name": self.name,
            "nodes": self.order.len(),
            "levels": levels(&self.graph),
            "loop_bodies": bodies,
            "workflows": nested,
        })
    }

    /// Visits every node of this plan and of its nested plans.
    pub(crate) fn walk(&self, visit: &mut dyn FnMut(&ExecutionPlan, &NodeConfig)) {
        for node in self.nodes() {
            visit(self, node);
        }
        for child in self.nested.values() {
            child.walk(visit);
        }
    }
}

fn check_agent(node_id: &str, agent: &AgentNode) -> Result<(), EngineError> {
    match agent.max_steps {
        Some(steps) if steps > 0 => {}
        _ => {
            return Err(EngineError::RecursionLimit {
                node_id: node_id.to_owned(),
                message: format!(
                    "agent '{}' needs max_steps set to a positive number",
                    agent.agent_id.as_deref().unwrap_or(node_id)
                ),
            })
        }
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = agent.tools.iter().find(|t| !seen.insert(t.as_str())) {
        return Err(EngineError::invalid(node_id, format!("tool '{duplicate}' listed twice")));
    }
    let uses_memory_tools = agent.tools.iter().any(|t| t == REMEMBER_TOOL || t == RECALL_TOOL);
    if uses_memory_tools && agent.memory.is_none() {
        return Err(EngineError::invalid(
            node_id,
            "the remember and recall tools need a memory domain",
        ));
    }
    Ok(())
}

fn parse_expression(node_id: &str, src: &str) -> Result<(), EngineError> {
    expression::parse(src)
        .map(|_| ())
        .map_err(|message| EngineError::InvalidExpression {
            node_id: node_id.to_owned(),
            message,
        })
}
