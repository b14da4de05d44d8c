//! Decides, at the level barrier, whether a node runs or is recorded as skipped.

use std::collections::{HashMap, HashSet};

use crate::context::WorkflowExecutionContext;
use crate::models::{ConditionNode, FailurePolicy, SkipReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Activation {
    Run,
    Skip(SkipReason),
}

/// Branch bookkeeping for one scope (a run or one loop iteration).
#[derive(Debug, Default)]
pub(crate) struct BranchGate {
    /// Node id to the condition that did not select it.
    not_taken: HashMap<String, String>,
    taken: HashSet<String>,
}

impl BranchGate {
    pub fn record_decision(
        &mut self,
        condition_id: &str,
        condition: &ConditionNode,
        decision: bool,
    ) {
        let (taken, not_taken) = if decision {
            (&condition.true_branch, &condition.false_branch)
        } else {
            (&condition.false_branch, &condition.true_branch)
        };
        self.taken.extend(taken.iter().cloned());
        for id in not_taken {
            self.not_taken
                .entry(id.clone())
                .or_insert_with(|| condition_id.to_owned());
        }
    }

    /// A node on an untaken branch is skipped unless some decided condition
    /// also selected it. Otherwise its dependencies decide:
    ///   - a failed dependency prunes it, unless that dependency runs under `always`
    ///   - a dependency pruned for an upstream failure prunes it too
    ///   - if every dependency was skipped, so is the node
    pub fn activation(
        &self,
        node_id: &str,
        dependencies: &[String],
        ctx: &WorkflowExecutionContext,
        policy_of: impl Fn(&str) -> FailurePolicy,
    ) -> Activation {
        if let Some(condition) = self.not_taken.get(node_id) {
            if !self.taken.contains(node_id) {
                return Activation::Skip(SkipReason::BranchNotTaken {
                    condition: condition.clone(),
                });
            }
        }

        let mut all_skipped = !dependencies.is_empty();
        for dep in dependencies {
            match ctx.result(dep) {
                Some(result) if result.is_failed() => {
                    if policy_of(dep) != FailurePolicy::Always {
                        return Activation::Skip(SkipReason::UpstreamFailed {
                            dependency: dep.clone(),
                        });
                    }
                    all_skipped = false;
                }
                Some(result)
                    if matches!(result.skip_reason, Some(SkipReason::UpstreamFailed { .. })) =>
                {
                    return Activation::Skip(SkipReason::UpstreamFailed {
                        dependency: dep.clone(),
                    });
                }
                Some(result) if result.is_skipped() => {}
                _ => all_skipped = false,
            }
        }
        if all_skipped {
            Activation::Skip(SkipReason::DependenciesSkipped)
        } else {
            Activation::Run
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, NodeFailure};
    use crate::models::{NodeExecutionResult, NodeMetadata, NodeType};
    use serde_json::json;
    use uuid::Uuid;

    fn gate_node() -> ConditionNode {
        ConditionNode {
            expression: "true".into(),
            true_branch: vec!["x".into(), "both".into()],
            false_branch: vec!["y".into(), "both".into()],
        }
    }

    fn ctx() -> WorkflowExecutionContext {
        let mut ctx = WorkflowExecutionContext::new(Uuid::new_v4(), json!({}));
        ctx.record(NodeExecutionResult::succeeded(
            "ok",
            NodeType::Tool,
            json!(1),
            NodeMetadata::default(),
        ));
        ctx.record(NodeExecutionResult::failed(
            "bad",
            NodeType::Tool,
            NodeFailure {
                kind: ErrorKind::Execution,
                message: "boom".into(),
            },
            NodeMetadata::default(),
        ));
        ctx.record(NodeExecutionResult::skipped(
            "off",
            NodeType::Tool,
            SkipReason::DependenciesSkipped,
            0,
        ));
        ctx
    }

    #[test]
    fn untaken_branch_is_skipped_unless_also_taken() {
        let mut gate = BranchGate::default();
        gate.record_decision("g", &gate_node(), true);
        let ctx = ctx();
        let halt = |_: &str| FailurePolicy::Halt;

        assert_eq!(gate.activation("x", &[], &ctx, halt), Activation::Run);
        assert_eq!(gate.activation("both", &[], &ctx, halt), Activation::Run);
        assert_eq!(
            gate.activation("y", &[], &ctx, halt),
            Activation::Skip(SkipReason::BranchNotTaken { condition: "g".into() })
        );
    }

    #[test]
    fn failed_dependency_prunes_unless_always() {
        let gate = BranchGate::default();
        let ctx = ctx();
        let deps = vec!["ok".to_string(), "bad".to_string()];

        assert_eq!(
            gate.activation("n", &deps, &ctx, |_| FailurePolicy::ContinuePossible),
            Activation::Skip(SkipReason::UpstreamFailed { dependency: "bad".into() })
        );
        assert_eq!(gate.activation("n", &deps, &ctx, |_| FailurePolicy::Always), Activation::Run);
    }

    #[test]
    fn all_skipped_dependencies_skip_the_node() {
        let gate = BranchGate::default();
        let ctx = ctx();
        let halt = |_: &str| FailurePolicy::Halt;
        assert_eq!(
            gate.activation("n", &["off".to_string()], &ctx, halt),
            Activation::Skip(SkipReason::DependenciesSkipped)
        );
        assert_eq!(
            gate.activation("n", &["off".to_string(), "ok".to_string()], &ctx, halt),
            Activation::Run
        );
    }
}
