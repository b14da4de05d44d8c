//! Per-run execution state.
//!
//! `WorkflowExecutionContext` is owned by the scheduler and is the only
//! thing that records results. Node tasks never see it directly; before each
//! level the scheduler publishes an immutable `ContextSnapshot` that tasks
//! read placeholders from. Loop iterations and convergence checks layer a
//! child snapshot with extra locals over their parent's.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::models::{NodeExecutionResult, NodeStatus};

#[derive(Debug)]
pub struct WorkflowExecutionContext {
    run_id: Uuid,
    inputs: Arc<Value>,
    locals: Map<String, Value>,
    parent: Option<Arc<ContextSnapshot>>,
    results: HashMap<String, Arc<NodeExecutionResult>>,
    decisions: HashMap<String, bool>,
}

impl WorkflowExecutionContext {
    pub fn new(run_id: Uuid, inputs: Value) -> Self {
        Self {
            run_id,
            inputs: Arc::new(inputs),
            locals: Map::new(),
            parent: None,
            results: HashMap::new(),
            decisions: HashMap::new(),
        }
    }

    /// A scope for one loop iteration: sees everything `parent` sees plus `locals`.
    pub fn scoped(parent: Arc<ContextSnapshot>, locals: Map<String, Value>) -> Self {
        Self {
            run_id: parent.run_id,
            inputs: Arc::clone(&parent.inputs),
            locals,
            parent: Some(parent),
            results: HashMap::new(),
            decisions: HashMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Records a node's result. A second result for the same node is dropped.
    pub fn record(&mut self, result: NodeExecutionResult) {
        if self.results.contains_key(&result.node_id) {
            warn!(node_id = %result.node_id, "ignoring duplicate result");
            return;
        }
        self.results.insert(result.node_id.clone(), Arc::new(result));
    }

    /// Caches a condition's decision so it is evaluated at most once per run.
    pub fn record_decision(&mut self, condition_id: &str, decision: bool) {
        self.decisions.entry(condition_id.to_owned()).or_insert(decision);
    }

    pub fn result(&self, node_id: &str) -> Option<&NodeExecutionResult> {
        self.results.get(node_id).map(Arc::as_ref)
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.result(node_id).map(|r| r.status)
    }

    pub fn results(&self) -> impl Iterator<Item = &NodeExecutionResult> {
        self.results.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn snapshot(&self) -> Arc<ContextSnapshot> {
        Arc::new(ContextSnapshot {
            run_id: self.run_id,
            inputs: Arc::clone(&self.inputs),
            locals: self.locals.clone(),
            results: self.results.clone(),
            decisions: self.decisions.clone(),
            parent: self.parent.clone(),
        })
    }

    pub fn into_results(self) -> impl Iterator<Item = NodeExecutionResult> {
        self.results
            .into_values()
            .map(|r| Arc::try_unwrap(r).unwrap_or_else(|shared| (*shared).clone()))
    }
}

/// What a placeholder root refers to.
#[derive(Debug, Clone, Copy)]
pub enum Root<'a> {
    Value(&'a Value),
    Node(&'a NodeExecutionResult),
}

/// Immutable view of a context at a level boundary.
#[derive(Debug)]
pub struct ContextSnapshot {
    pub run_id: Uuid,
    inputs: Arc<Value>,
    locals: Map<String, Value>,
    results: HashMap<String, Arc<NodeExecutionResult>>,
    decisions: HashMap<String, bool>,
    parent: Option<Arc<ContextSnapshot>>,
}

impl ContextSnapshot {
    /// A child view with extra locals and no results of its own.
    pub fn with_locals(self: &Arc<Self>, locals: Map<String, Value>) -> Arc<ContextSnapshot> {
        Arc::new(ContextSnapshot {
            run_id: self.run_id,
            inputs: Arc::clone(&self.inputs),
            locals,
            results: HashMap::new(),
            decisions: HashMap::new(),
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    /// Resolves a placeholder root. Locals shadow `inputs`, which shadows
    /// node ids; the parent chain is searched last.
    pub fn root(&self, name: &str) -> Option<Root<'_>> {
        if let Some(value) = self.locals.get(name) {
            return Some(Root::Value(value));
        }
        if name == "inputs" {
            return Some(Root::Value(&self.inputs));
        }
        if let Some(result) = self.results.get(name) {
            return Some(Root::Node(result.as_ref()));
        }
        self.parent.as_deref().and_then(|p| p.root(name))
    }

    pub fn result(&self, node_id: &str) -> Option<&NodeExecutionResult> {
        match self.results.get(node_id) {
            Some(r) => Some(r.as_ref()),
            None => self.parent.as_deref().and_then(|p| p.result(node_id)),
        }
    }

    pub fn decision(&self, condition_id: &str) -> Option<bool> {
        match self.decisions.get(condition_id) {
            Some(d) => Some(*d),
            None => self.parent.as_deref().and_then(|p| p.decision(condition_id)),
        }
    }

    /// Outputs of the given nodes that succeeded, keyed by node id.
    pub fn outputs_of<'a>(
        &self,
        node_ids: impl IntoIterator<Item = &'a String>,
    ) -> Map<String, Value> {
        node_ids
            .into_iter()
            .filter_map(|id| {
                self.result(id)
                    .filter(|r| r.status == NodeStatus::Succeeded)
                    .map(|r| (id.clone(), r.output.clone()))
            })
            .collect()
    }
}
