//! Dependency graph construction: run this before executing a blueprint.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the blueprint.
//! 2. Every dependency, branch member and loop body entry must name a node.
//! 3. Each scope (the top level and every loop body) must be acyclic.
//!
//! Besides declared dependencies the graph adds implicit edges: every node on
//! a condition's branch depends on the condition, and a parallel node depends
//! on every member of its branches. Loop body nodes are removed from the top
//! level and get a graph of their own; a body node's dependency on something
//! outside the loop becomes a dependency of the loop node.
//!
//! Nodes are grouped into levels: a node's level is one more than the highest
//! level among its dependencies. Within a level, declaration order is kept.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::EngineError;
use crate::models::{NodeConfig, NodeKind};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    levels: Vec<Vec<String>>,
    level_of: HashMap<String, usize>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    /// Loop id to the graph of its body. Only the top-level graph has these.
    bodies: HashMap<String, Arc<DependencyGraph>>,
    /// Body node id to the loop that owns it.
    owner: HashMap<String, String>,
    /// Declared and implicit edges as written, before lifting across loops.
    direct: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Validate the blueprint's nodes and group them into levels.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`EngineError::UnknownDependency`] if a node references a missing node.
    /// - [`EngineError::CycleDetected`] naming the nodes on the cycle.
    /// - [`EngineError::InvalidBlueprint`] for malformed loop or branch wiring.
    pub fn build(nodes: &[NodeConfig]) -> Result<Self, EngineError> {
        // -------------------------------------------------------------------
        // 1. Ensure node IDs are unique
        // -------------------------------------------------------------------
        let mut declared: HashMap<&str, usize> = HashMap::new();
        for (position, node) in nodes.iter().enumerate() {
            if declared.insert(node.id.as_str(), position).is_some() {
                return Err(EngineError::DuplicateNodeId(node.id.clone()));
            }
        }

        let known = |node_id: &str, reference: &str| {
            if declared.contains_key(reference) {
                Ok(())
            } else {
                Err(EngineError::UnknownDependency {
                    node_id: node_id.to_owned(),
                    dependency: reference.to_owned(),
                })
            }
        };

        // -------------------------------------------------------------------
        // 2. Loop ownership
        // -------------------------------------------------------------------
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for node in nodes {
            if let NodeKind::Loop(spec) = &node.kind {
                for body in &spec.body_nodes {
                    known(&node.id, body)?;
                    if body == &node.id {
                        return Err(EngineError::invalid(&node.id, "a loop cannot contain itself"));
                    }
                    if let Some(previous) = owner.insert(body.as_str(), node.id.as_str()) {
                        return Err(EngineError::invalid(
                            body,
                            format!("claimed by both loop '{previous}' and loop '{}'", node.id),
                        ));
                    }
                }
            }
        }
        for &body in owner.keys() {
            let mut seen = HashSet::new();
            let mut current = body;
            while let Some(&loop_id) = owner.get(current) {
                if !seen.insert(loop_id) {
                    return Err(EngineError::invalid(loop_id, "loops contain each other"));
                }
                current = loop_id;
            }
        }
        let scope_of = |id: &str| owner.get(id).copied();

        // -------------------------------------------------------------------
        // 3. Declared and implicit edges, as (node, dependency)
        // -------------------------------------------------------------------
        let mut edges: Vec<(&str, &str)> = Vec::new();
        for node in nodes {
            for dep in &node.dependencies {
                known(&node.id, dep)?;
                edges.push((node.id.as_str(), dep.as_str()));
            }
            let same_scope = |member: &str| {
                if scope_of(member) == scope_of(&node.id) {
                    Ok(())
                } else {
                    Err(EngineError::invalid(
                        &node.id,
                        format!("branch member '{member}' must sit in the same loop scope"),
                    ))
                }
            };
            match &node.kind {
                NodeKind::Condition(spec) => {
                    for member in spec.true_branch.iter().chain(&spec.false_branch) {
                        known(&node.id, member)?;
                        same_scope(member)?;
                        edges.push((member.as_str(), node.id.as_str()));
                    }
                }
                NodeKind::Parallel(spec) => {
                    for member in spec.branches.iter().flatten() {
                        known(&node.id, member)?;
                        same_scope(member)?;
                        edges.push((node.id.as_str(), member.as_str()));
                    }
                }
                _ => {}
            }
        }

        // -------------------------------------------------------------------
        // 4. Lift every edge into the innermost scope both ends share
        // -------------------------------------------------------------------
        let mut scoped: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut direct: HashMap<String, Vec<String>> = HashMap::new();
        for (node, dep) in edges {
            if node == dep {
                return Err(EngineError::CycleDetected {
                    nodes: vec![node.to_owned()],
                });
            }
            let node_chain = chain(&owner, node);
            let dep_chain = chain(&owner, dep);
            let (from, to) = node_chain
                .iter()
                .find_map(|a| {
                    dep_chain
                        .iter()
                        .find(|b| scope_of(a) == scope_of(b))
                        .map(|b| (*a, *b))
                })
                .unwrap_or((node_chain[node_chain.len() - 1], dep_chain[dep_chain.len() - 1]));
            if from == to {
                return Err(EngineError::invalid(
                    node,
                    format!("'{node}' and '{dep}' are on opposite sides of the same loop boundary"),
                ));
            }
            let deps = scoped.entry(from).or_default();
            if !deps.contains(&to) {
                deps.push(to);
            }
            let written = direct.entry(node.to_owned()).or_default();
            if !written.iter().any(|d| d == dep) {
                written.push(dep.to_owned());
            }
        }

        // -------------------------------------------------------------------
        // 5. Level assignment per scope (Kahn's algorithm)
        // -------------------------------------------------------------------
        let mut members: HashMap<Option<&str>, Vec<&str>> = HashMap::new();
        members.entry(None).or_default();
        for node in nodes {
            if let NodeKind::Loop(_) = node.kind {
                members.entry(Some(node.id.as_str())).or_default();
            }
            members.entry(scope_of(&node.id)).or_default().push(node.id.as_str());
        }

        let mut root = Self::scope(&members[&None], &scoped, &declared)?;
        for (scope, ids) in &members {
            if let Some(loop_id) = scope {
                let body = Self::scope(ids, &scoped, &declared)?;
                root.bodies.insert(loop_id.to_string(), Arc::new(body));
            }
        }
        root.owner = owner
            .into_iter()
            .map(|(body, loop_id)| (body.to_owned(), loop_id.to_owned()))
            .collect();
        root.direct = direct;
        Ok(root)
    }

    fn scope(
        members: &[&str],
        scoped: &HashMap<&str, Vec<&str>>,
        declared: &HashMap<&str, usize>,
    ) -> Result<Self, EngineError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for &id in members {
            let deps = scoped.get(id).map(Vec::as_slice).unwrap_or_default();
            in_degree.insert(id, deps.len());
            for &dep in deps {
                dependents.entry(dep).or_default().push(id);
            }
        }

        // Seed the frontier with nodes that have no dependencies.
        let mut frontier: Vec<&str> =
            members.iter().copied().filter(|id| in_degree[id] == 0).collect();
        let mut graph = DependencyGraph::default();

        while !frontier.is_empty() {
            let level = graph.levels.len();
            let mut next = Vec::new();
            for &id in &frontier {
                graph.level_of.insert(id.to_owned(), level);
                for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            next.sort_by_key(|id| declared[id]);
            graph.levels.push(frontier.iter().map(|id| id.to_string()).collect());
            frontier = next;
        }

        // If we didn't place every node the scope contains a cycle.
        if graph.level_of.len() != members.len() {
            let mut stuck: HashSet<&str> = members
                .iter()
                .copied()
                .filter(|id| !graph.level_of.contains_key(*id))
                .collect();
            // Drop nodes that merely wait on the cycle: keep only those that
            // something else on the cycle waits for.
            loop {
                let waiting: Vec<&str> = stuck
                    .iter()
                    .copied()
                    .filter(|id| {
                        !dependents
                            .get(id)
                            .is_some_and(|ds| ds.iter().any(|d| stuck.contains(d)))
                    })
                    .collect();
                if waiting.is_empty() {
                    break;
                }
                for id in waiting {
                    stuck.remove(id);
                }
            }
            let mut nodes: Vec<&str> = stuck.into_iter().collect();
            nodes.sort_by_key(|id| declared[id]);
            return Err(EngineError::CycleDetected {
                nodes: nodes.into_iter().map(str::to_owned).collect(),
            });
        }

        for &id in members {
            let deps: Vec<String> = scoped
                .get(id)
                .map(|ds| ds.iter().map(|d| d.to_string()).collect())
                .unwrap_or_default();
            graph.dependencies.insert(id.to_owned(), deps);
            graph.dependents.insert(
                id.to_owned(),
                dependents
                    .get(id)
                    .map(|ds| ds.iter().map(|d| d.to_string()).collect())
                    .unwrap_or_default(),
            );
        }
        Ok(graph)
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn level_of(&self, node_id: &str) -> Option<usize> {
        self.level_of.get(node_id).copied()
    }

    /// Effective dependencies inside this graph's scope.
    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.dependencies.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn dependents(&self, node_id: &str) -> &[String] {
        self.dependents.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.level_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.level_of.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.level_of.contains_key(node_id)
    }

    pub fn body(&self, loop_id: &str) -> Option<&Arc<DependencyGraph>> {
        self.bodies.get(loop_id)
    }

    pub fn owner(&self, node_id: &str) -> Option<&str> {
        self.owner.get(node_id).map(String::as_str)
    }

    /// Declared and implicit dependencies of `node_id` as the blueprint wrote
    /// them, without lifting body edges onto their loop. Top-level graph only.
    pub fn direct_dependencies(&self, node_id: &str) -> &[String] {
        self.direct.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// True when `node_id` sits inside `loop_id`, at any depth.
    pub fn encloses(&self, loop_id: &str, node_id: &str) -> bool {
        std::iter::successors(self.owner(node_id), |id| self.owner(id)).any(|id| id == loop_id)
    }
}

/// `id` followed by each enclosing loop, innermost first.
fn chain<'a>(owner: &HashMap<&'a str, &'a str>, id: &'a str) -> Vec<&'a str> {
    std::iter::successors(Some(id), |current| owner.get(current).copied()).collect()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailurePolicy, NodeConfig};
    use serde_json::json;

    fn make_node(id: &str, deps: &[&str]) -> NodeConfig {
        NodeConfig::tool(id, "mock", json!({})).depends_on(deps)
    }

    fn levels(graph: &DependencyGraph) -> Vec<Vec<&str>> {
        graph
            .levels()
            .iter()
            .map(|level| level.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn linear_chain_gets_one_node_per_level() {
        // A → B → C
        let graph = DependencyGraph::build(&[
            make_node("a", &[]),
            make_node("b", &["a"]),
            make_node("c", &["b"]),
        ])
        .expect("should be valid");
        assert_eq!(levels(&graph), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_groups_siblings() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let graph = DependencyGraph::build(&[
            make_node("a", &[]),
            make_node("c", &["a"]),
            make_node("b", &["a"]),
            make_node("d", &["b", "c"]),
        ])
        .expect("should be valid");
        // Declaration order within a level.
        assert_eq!(levels(&graph), vec![vec!["a"], vec!["c", "b"], vec!["d"]]);
        assert_eq!(graph.level_of("d"), Some(2));
    }

    #[test]
    fn level_is_one_past_the_deepest_dependency() {
        let graph = DependencyGraph::build(&[
            make_node("a", &[]),
            make_node("b", &["a"]),
            make_node("c", &["b"]),
            make_node("x", &["a", "c"]),
            make_node("y", &[]),
        ])
        .unwrap();
        assert_eq!(graph.level_of("x"), Some(3));
        assert_eq!(graph.level_of("y"), Some(0));
        for level in graph.levels() {
            for id in level {
                let own = graph.level_of(id).unwrap();
                assert!(graph.dependencies(id).iter().all(|d| graph.level_of(d).unwrap() < own));
            }
        }
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        assert!(matches!(
            DependencyGraph::build(&[make_node("a", &[]), make_node("a", &[])]),
            Err(EngineError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn dependency_on_missing_node_is_rejected() {
        assert!(matches!(
            DependencyGraph::build(&[make_node("a", &["ghost"])]),
            Err(EngineError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn cycle_names_its_participants_only() {
        // A → B → C → A, and D waits on C.
        let err = DependencyGraph::build(&[
            make_node("a", &["c"]),
            make_node("b", &["a"]),
            make_node("c", &["b"]),
            make_node("d", &["c"]),
            make_node("e", &[]),
        ])
        .unwrap_err();
        match err {
            EngineError::CycleDetected { nodes } => assert_eq!(nodes, vec!["a", "b", "c"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(matches!(
            DependencyGraph::build(&[make_node("solo", &["solo"])]),
            Err(EngineError::CycleDetected { nodes }) if nodes == vec!["solo"]
        ));
    }

    #[test]
    fn single_node_is_valid() {
        let graph =
            DependencyGraph::build(&[make_node("solo", &[])]).expect("single node should be valid");
        assert_eq!(levels(&graph), vec![vec!["solo"]]);
    }

    #[test]
    fn condition_branches_depend_on_the_condition() {
        let graph = DependencyGraph::build(&[
            make_node("fetch", &[]),
            NodeConfig::condition("gate", "{{fetch.ok}}", &["x"], &["y"]).depends_on(&["fetch"]),
            make_node("x", &[]),
            make_node("y", &[]),
        ])
        .unwrap();
        assert_eq!(levels(&graph), vec![vec!["fetch"], vec!["gate"], vec!["x", "y"]]);
        assert_eq!(graph.dependencies("x"), ["gate".to_string()]);
    }

    #[test]
    fn parallel_waits_for_every_branch_member() {
        let graph = DependencyGraph::build(&[
            NodeConfig::parallel("join", &[&["a1", "a2"], &["b"]]),
            make_node("a1", &[]),
            make_node("a2", &["a1"]),
            make_node("b", &[]),
        ])
        .unwrap();
        assert_eq!(graph.level_of("join"), Some(2));
    }

    #[test]
    fn loop_body_gets_its_own_graph() {
        let mut each = NodeConfig::loop_over("each", "inputs.items", &["fetch", "summarize"]);
        each.failure_policy = Some(FailurePolicy::ContinuePossible);
        let graph = DependencyGraph::build(&[
            make_node("setup", &[]),
            each,
            make_node("fetch", &["setup"]),
            NodeConfig::llm("summarize", "{{fetch}}").depends_on(&["fetch"]),
            make_node("report", &["each"]),
        ])
        .unwrap();

        // The body's outer dependency moved onto the loop.
        assert_eq!(levels(&graph), vec![vec!["setup"], vec!["each"], vec!["report"]]);
        assert!(!graph.contains("fetch"));
        let body = graph.body("each").unwrap();
        assert_eq!(levels(body), vec![vec!["fetch"], vec!["summarize"]]);
        assert_eq!(graph.owner("summarize"), Some("each"));

        assert_eq!(graph.direct_dependencies("fetch"), ["setup".to_string()]);
        assert_eq!(graph.direct_dependencies("summarize"), ["fetch".to_string()]);
        assert!(graph.encloses("each", "summarize"));
        assert!(!graph.encloses("each", "report"));
    }

    #[test]
    fn depending_on_a_body_node_means_depending_on_its_loop() {
        let graph = DependencyGraph::build(&[
            NodeConfig::loop_over("each", "inputs.items", &["inner"]),
            make_node("inner", &[]),
            make_node("after", &["inner"]),
        ])
        .unwrap();
        assert_eq!(graph.dependencies("after"), ["each".to_string()]);
    }

    #[test]
    fn body_node_claimed_twice_is_invalid() {
        let err = DependencyGraph::build(&[
            NodeConfig::loop_over("l1", "inputs.a", &["x"]),
            NodeConfig::loop_over("l2", "inputs.b", &["x"]),
            make_node("x", &[]),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBlueprint { .. }));
    }

    #[test]
    fn body_node_depending_on_its_own_loop_is_invalid() {
        let err = DependencyGraph::build(&[
            NodeConfig::loop_over("each", "inputs.a", &["x"]),
            make_node("x", &["each"]),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBlueprint { .. }));
    }
}
