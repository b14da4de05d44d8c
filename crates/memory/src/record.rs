//! The generic memory record and its kind tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// The four memory kinds, differing in lifetime and content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Scratch state confined to one run.
    Working,
    /// Append-only interaction history.
    Episodic,
    /// Entities, facts and relationships.
    Semantic,
    /// Learned action patterns.
    Procedural,
}

/// A keyed value owned by the memory subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub key: String,
    pub value: Value,
    pub domain: String,
    pub kind: MemoryKind,
    /// Time-to-live in seconds; `None` never expires.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Relationship strength or relevance score in `[0, 1]`.
    #[serde(default)]
    pub strength: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(
        kind: MemoryKind,
        domain: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            domain: domain.into(),
            kind,
            ttl_secs: None,
            strength: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength.clamp(0.0, 1.0));
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_secs
            .map(|secs| self.created_at + chrono::Duration::seconds(secs as i64))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }
}
