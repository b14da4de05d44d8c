//! Run-wide resource metering.
//!
//! A `BudgetTracker` counts tokens, cost and collaborator calls with atomics
//! so concurrent nodes can update it without a lock. Limits are checked
//! before every call (preflight) and again after usage is recorded, so a
//! call that overshoots still fails the run even when two preflights raced.
//! Nested workflows get a child tracker that forwards everything to the root,
//! which is where limits are enforced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::models::NodeType;

/// Cost is stored as an integer number of micro-units.
const COST_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_tokens: Option<u64>,
    pub max_cost: Option<f64>,
    pub max_calls: Option<u64>,
    /// Fraction of any limit at which a single warning is logged.
    pub warn_ratio: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_tokens: None,
            max_cost: None,
            max_calls: None,
            warn_ratio: 0.8,
        }
    }
}

impl BudgetLimits {
    pub fn tokens(max_tokens: u64) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..Self::default()
        }
    }

    pub fn calls(max_calls: u64) -> Self {
        Self {
            max_calls: Some(max_calls),
            ..Self::default()
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_tokens.is_none() && self.max_cost.is_none() && self.max_calls.is_none()
    }
}

#[derive(Debug, Default)]
struct Counters {
    tokens: AtomicU64,
    cost_micros: AtomicU64,
    calls: AtomicU64,
    model_calls: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn metrics(&self) -> TypeMetrics {
        TypeMetrics {
            calls: self.calls.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
            cost: self.cost_micros.load(Ordering::Relaxed) as f64 / COST_SCALE,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Per-node-type counters in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMetrics {
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
    pub completed: u64,
    pub failed: u64,
}

/// Point-in-time copy of a tracker's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub tokens: u64,
    pub cost: f64,
    pub calls: u64,
    pub model_calls: u64,
    pub by_type: BTreeMap<NodeType, TypeMetrics>,
}

#[derive(Debug)]
pub struct BudgetTracker {
    limits: BudgetLimits,
    totals: Counters,
    by_type: [Counters; 9],
    warned: AtomicBool,
    parent: Option<Arc<BudgetTracker>>,
}

impl BudgetTracker {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            totals: Counters::default(),
            by_type: Default::default(),
            warned: AtomicBool::new(false),
            parent: None,
        }
    }

    /// A tracker for a nested run. It keeps its own counters for the nested
    /// `RunResult` and forwards every update to `parent`.
    pub fn child(parent: &Arc<BudgetTracker>) -> Self {
        Self {
            limits: BudgetLimits {
                max_tokens: None,
                max_cost: None,
                max_calls: None,
                warn_ratio: parent.limits.warn_ratio,
            },
            totals: Counters::default(),
            by_type: Default::default(),
            warned: AtomicBool::new(true),
            parent: Some(Arc::clone(parent)),
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    fn root(&self) -> &BudgetTracker {
        let mut tracker = self;
        while let Some(parent) = tracker.parent.as_deref() {
            tracker = parent;
        }
        tracker
    }

    /// Walks this tracker and every ancestor.
    fn chain(&self) -> impl Iterator<Item = &BudgetTracker> {
        std::iter::successors(Some(self), |t| t.parent.as_deref())
    }

    /// Preflight for any collaborator call.
    pub fn check_call(&self, node_id: &str) -> Result<(), EngineError> {
        let root = self.root();
        if let Some(max) = root.limits.max_calls {
            let used = root.totals.calls.load(Ordering::Acquire);
            if used + 1 > max {
                return Err(exceeded(
                    node_id,
                    format!("call limit {max} reached ({used} calls made)"),
                ));
            }
        }
        Ok(())
    }

    /// Preflight for a model call.
    ///
    /// The reservation is the node's declared `max_tokens`; without one it is
    /// the mean tokens per model call observed so far in the run.
    pub fn check_model_call(
        &self,
        node_id: &str,
        declared_max_tokens: Option<u32>,
    ) -> Result<(), EngineError> {
        self.check_call(node_id)?;
        let root = self.root();

        if let Some(max) = root.limits.max_tokens {
            let used = root.totals.tokens.load(Ordering::Acquire);
            let reservation = match declared_max_tokens {
                Some(declared) => u64::from(declared),
                None => {
                    let calls = root.totals.model_calls.load(Ordering::Acquire);
                    if calls == 0 {
                        0
                    } else {
                        used / calls
                    }
                }
            };
            if used + reservation > max {
                return Err(exceeded(
                    node_id,
                    format!("token limit {max}: {used} used, next call may need {reservation}"),
                ));
            }
        }

        if let Some(max) = root.limits.max_cost {
            let used = root.total_cost();
            if used >= max {
                return Err(exceeded(
                    node_id,
                    format!("cost limit {max:.4} reached ({used:.4} spent)"),
                ));
            }
        }
        Ok(())
    }

    /// Takes one call from the run's allowance and counts it against
    /// `node_type`.
    ///
    /// The root counter is bumped with a compare-and-swap, so concurrent
    /// callers can never take more than `max_calls` between them.
    pub fn reserve_call(&self, node_id: &str, node_type: NodeType) -> Result<(), EngineError> {
        let root = self.root();
        match root.limits.max_calls {
            Some(max) => {
                root.totals
                    .calls
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                        (used < max).then_some(used + 1)
                    })
                    .map_err(|used| {
                        exceeded(node_id, format!("call limit {max} reached ({used} calls made)"))
                    })?;
            }
            None => {
                root.totals.calls.fetch_add(1, Ordering::AcqRel);
            }
        }
        for tracker in self.chain() {
            if !std::ptr::eq(tracker, root) {
                tracker.totals.calls.fetch_add(1, Ordering::AcqRel);
            }
            tracker.by_type[node_type.index()].calls.fetch_add(1, Ordering::AcqRel);
        }
        root.warn_if_close();
        Ok(())
    }

    /// Counts a collaborator call against `node_type` without enforcing the
    /// call limit.
    pub fn record_call(&self, node_type: NodeType) {
        for tracker in self.chain() {
            tracker.totals.calls.fetch_add(1, Ordering::AcqRel);
            tracker.by_type[node_type.index()].calls.fetch_add(1, Ordering::AcqRel);
        }
        self.root().warn_if_close();
    }

    /// Records model usage and fails when a limit is now exceeded.
    pub fn record_usage(
        &self,
        node_id: &str,
        node_type: NodeType,
        tokens: u64,
        cost: f64,
    ) -> Result<(), EngineError> {
        let micros = (cost.max(0.0) * COST_SCALE).round() as u64;
        for tracker in self.chain() {
            tracker.totals.tokens.fetch_add(tokens, Ordering::AcqRel);
            tracker.totals.cost_micros.fetch_add(micros, Ordering::AcqRel);
            tracker.totals.model_calls.fetch_add(1, Ordering::AcqRel);
            let per_type = &tracker.by_type[node_type.index()];
            per_type.tokens.fetch_add(tokens, Ordering::AcqRel);
            per_type.cost_micros.fetch_add(micros, Ordering::AcqRel);
        }

        let root = self.root();
        root.warn_if_close();

        if let Some(max) = root.limits.max_tokens {
            let used = root.totals.tokens.load(Ordering::Acquire);
            if used > max {
                return Err(exceeded(node_id, format!("token limit {max} overshot ({used} used)")));
            }
        }
        if let Some(max) = root.limits.max_cost {
            let used = root.total_cost();
            if used > max {
                return Err(exceeded(
                    node_id,
                    format!("cost limit {max:.4} overshot ({used:.4} spent)"),
                ));
            }
        }
        Ok(())
    }

    pub fn record_completion(&self, node_type: NodeType, success: bool) {
        for tracker in self.chain() {
            let per_type = &tracker.by_type[node_type.index()];
            if success {
                per_type.completed.fetch_add(1, Ordering::AcqRel);
            } else {
                per_type.failed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn warn_if_close(&self) {
        if self.warned.load(Ordering::Relaxed) {
            return;
        }
        let ratio = self.limits.warn_ratio;
        let tokens = self
            .limits
            .max_tokens
            .map(|max| self.total_tokens() as f64 / max as f64);
        let cost = self.limits.max_cost.map(|max| self.total_cost() / max);
        let calls = self
            .limits
            .max_calls
            .map(|max| self.total_calls() as f64 / max as f64);
        let worst = [tokens, cost, calls].into_iter().flatten().fold(0.0, f64::max);
        if worst >= ratio && !self.warned.swap(true, Ordering::AcqRel) {
            warn!(
                usage = format!("{:.0}%", worst * 100.0),
                tokens = self.total_tokens(),
                cost = self.total_cost(),
                calls = self.total_calls(),
                "run is approaching its budget"
            );
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.totals.tokens.load(Ordering::Acquire)
    }

    pub fn total_cost(&self) -> f64 {
        self.totals.cost_micros.load(Ordering::Acquire) as f64 / COST_SCALE
    }

    pub fn total_calls(&self) -> u64 {
        self.totals.calls.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let by_type = NodeType::ALL
            .iter()
            .filter_map(|t| {
                let metrics = self.by_type[t.index()].metrics();
                (metrics != TypeMetrics::default()).then_some((*t, metrics))
            })
            .collect();
        BudgetSnapshot {
            tokens: self.total_tokens(),
            cost: self.total_cost(),
            calls: self.total_calls(),
            model_calls: self.totals.model_calls.load(Ordering::Acquire),
            by_type,
        }
    }
}

fn exceeded(node_id: &str, message: String) -> EngineError {
    EngineError::BudgetExceeded {
        node_id: node_id.to_owned(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_usage_reserves_tokens_for_the_next_call() {
        let tracker = BudgetTracker::new(BudgetLimits::tokens(1000));

        tracker.check_model_call("a", None).unwrap();
        tracker.record_usage("a", NodeType::Llm, 400, 0.0).unwrap();
        tracker.check_model_call("b", None).unwrap();
        tracker.record_usage("b", NodeType::Llm, 400, 0.0).unwrap();

        let err = tracker.check_model_call("c", None).unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { ref node_id, .. } if node_id == "c"));
        assert_eq!(tracker.total_tokens(), 800);
    }

    #[test]
    fn declared_max_tokens_is_the_reservation() {
        let tracker = BudgetTracker::new(BudgetLimits::tokens(1000));
        tracker.record_usage("a", NodeType::Llm, 100, 0.0).unwrap();
        assert!(tracker.check_model_call("b", Some(900)).is_ok());
        assert!(tracker.check_model_call("b", Some(901)).is_err());
    }

    #[test]
    fn overshoot_is_reported_after_the_call() {
        let tracker = BudgetTracker::new(BudgetLimits::tokens(100));
        let err = tracker.record_usage("a", NodeType::Agent, 150, 0.0).unwrap_err();
        assert!(err.is_governance());
    }

    #[test]
    fn call_limit_counts_every_call() {
        let tracker = BudgetTracker::new(BudgetLimits::calls(2));
        tracker.reserve_call("t", NodeType::Tool).unwrap();
        tracker.reserve_call("t", NodeType::Tool).unwrap();
        assert!(tracker.check_call("t").is_err());

        let err = tracker.reserve_call("t", NodeType::Tool).unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { ref node_id, .. } if node_id == "t"));
        assert_eq!(tracker.total_calls(), 2);
    }

    #[test]
    fn concurrent_reservations_never_exceed_the_call_limit() {
        let tracker = Arc::new(BudgetTracker::new(BudgetLimits::calls(32)));
        let barrier = Arc::new(std::sync::Barrier::new(64));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    tracker.reserve_call("t", NodeType::Tool).is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 32);
        assert_eq!(tracker.total_calls(), 32);
        assert_eq!(tracker.snapshot().by_type[&NodeType::Tool].calls, 32);
    }

    #[test]
    fn call_only_budget_warns_near_the_limit() {
        let tracker = BudgetTracker::new(BudgetLimits::calls(10));
        for _ in 0..7 {
            tracker.reserve_call("t", NodeType::Code).unwrap();
        }
        assert!(!tracker.warned.load(Ordering::Acquire));

        tracker.reserve_call("t", NodeType::Code).unwrap();
        assert!(tracker.warned.load(Ordering::Acquire));
    }

    #[test]
    fn child_forwards_to_parent_and_parent_enforces() {
        let parent = Arc::new(BudgetTracker::new(BudgetLimits::tokens(500)));
        let child = BudgetTracker::child(&parent);

        child.record_call(NodeType::Llm);
        child.record_usage("nested", NodeType::Llm, 300, 0.01).unwrap();
        assert_eq!(child.total_tokens(), 300);
        assert_eq!(parent.total_tokens(), 300);
        assert_eq!(parent.total_calls(), 1);

        let err = child.check_model_call("nested", Some(300)).unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { .. }));
    }

    #[test]
    fn snapshot_groups_by_node_type() {
        let tracker = BudgetTracker::new(BudgetLimits::default());
        tracker.record_call(NodeType::Tool);
        tracker.record_completion(NodeType::Tool, true);
        tracker.record_call(NodeType::Llm);
        tracker.record_usage("l", NodeType::Llm, 42, 0.5).unwrap();
        tracker.record_completion(NodeType::Llm, false);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.calls, 2);
        assert_eq!(snapshot.tokens, 42);
        assert_eq!(snapshot.by_type.len(), 2);
        assert_eq!(snapshot.by_type[&NodeType::Tool].completed, 1);
        assert_eq!(snapshot.by_type[&NodeType::Llm].failed, 1);
        assert!((snapshot.cost - 0.5).abs() < 1e-9);
    }
}
