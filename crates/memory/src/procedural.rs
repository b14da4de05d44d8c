//! Procedural memory: learned action patterns and how well they work.
//!
//! Procedures are indexed by domain, then category, then name. Every
//! recorded outcome updates the procedure's counters, which roll up into
//! per-category metrics.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    pub category: String,
    pub domain: String,
    /// The action sequence, e.g. tool names in call order.
    pub steps: Vec<String>,
    pub attempts: u64,
    pub successes: u64,
    pub total_duration_ms: u64,
    pub last_used: DateTime<Utc>,
}

impl Procedure {
    pub fn new(
        domain: impl Into<String>,
        category: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            domain: domain.into(),
            steps,
            attempts: 0,
            successes: 0,
            total_duration_ms: 0,
            last_used: Utc::now(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn mean_duration_ms(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.attempts as f64
        }
    }
}

/// Aggregated success metrics for one (domain, category) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetrics {
    pub procedures: usize,
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub mean_duration_ms: f64,
}

type CategoryIndex = HashMap<String, BTreeMap<String, Procedure>>;

#[derive(Debug, Default)]
pub struct ProceduralMemory {
    domains: DashMap<String, CategoryIndex>,
}

impl ProceduralMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a procedure, keeping nothing of a previous version.
    pub fn store(&self, procedure: Procedure) {
        self.domains
            .entry(procedure.domain.clone())
            .or_default()
            .entry(procedure.category.clone())
            .or_default()
            .insert(procedure.name.clone(), procedure);
    }

    /// Record one use of a procedure, creating it on first use.
    ///
    /// Returns the updated procedure.
    pub fn record_outcome(
        &self,
        domain: &str,
        category: &str,
        name: &str,
        steps: &[String],
        success: bool,
        duration: Duration,
    ) -> Procedure {
        let mut categories = self.domains.entry(domain.to_owned()).or_default();
        let procedure = categories
            .entry(category.to_owned())
            .or_default()
            .entry(name.to_owned())
            .or_insert_with(|| Procedure::new(domain, category, name, steps.to_vec()));

        procedure.attempts += 1;
        if success {
            procedure.successes += 1;
        }
        procedure.total_duration_ms += duration.as_millis() as u64;
        procedure.last_used = Utc::now();
        procedure.clone()
    }

    /// Procedures of one category, best success rate first.
    pub fn by_category(&self, domain: &str, category: &str) -> Vec<Procedure> {
        let mut procedures: Vec<Procedure> = self
            .domains
            .get(domain)
            .and_then(|categories| categories.get(category).map(|p| p.values().cloned().collect()))
            .unwrap_or_default();
        procedures.sort_by(|a, b| {
            b.success_rate()
                .partial_cmp(&a.success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.attempts.cmp(&a.attempts))
                .then_with(|| a.name.cmp(&b.name))
        });
        procedures
    }

    pub fn best(&self, domain: &str, category: &str) -> Option<Procedure> {
        self.by_category(domain, category).into_iter().next()
    }

    pub fn metrics(&self, domain: &str, category: &str) -> CategoryMetrics {
        let procedures = self.by_category(domain, category);
        aggregate(&procedures)
    }

    /// Metrics for every category of a domain.
    pub fn domain_metrics(&self, domain: &str) -> BTreeMap<String, CategoryMetrics> {
        let Some(categories) = self.domains.get(domain) else {
            return BTreeMap::new();
        };
        categories
            .iter()
            .map(|(category, procedures)| {
                let list: Vec<Procedure> = procedures.values().cloned().collect();
                (category.clone(), aggregate(&list))
            })
            .collect()
    }
}

fn aggregate(procedures: &[Procedure]) -> CategoryMetrics {
    let attempts: u64 = procedures.iter().map(|p| p.attempts).sum();
    let successes: u64 = procedures.iter().map(|p| p.successes).sum();
    let total_ms: u64 = procedures.iter().map(|p| p.total_duration_ms).sum();
    CategoryMetrics {
        procedures: procedures.len(),
        attempts,
        successes,
        success_rate: if attempts == 0 { 0.0 } else { successes as f64 / attempts as f64 },
        mean_duration_ms: if attempts == 0 { 0.0 } else { total_ms as f64 / attempts as f64 },
    }
}
