//! The long-term memory backend contract and an in-process implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use crate::MemoryError;

/// Storage for cross-run memory (episodic, semantic, procedural).
///
/// Real deployments back this with a database; the engine only relies on
/// keyed, domain-scoped access.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn get(&self, domain: &str, key: &str) -> Result<Option<Value>, MemoryError>;

    async fn put(
        &self,
        domain: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), MemoryError>;

    /// Every live `(key, value)` pair of a domain, ordered by key.
    async fn query_domain(&self, domain: &str) -> Result<Vec<(String, Value)>, MemoryError>;
}

#[derive(Debug, Clone)]
struct Stored {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Stored {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A process-local backend, useful for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    domains: DashMap<String, BTreeMap<String, Stored>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn get(&self, domain: &str, key: &str) -> Result<Option<Value>, MemoryError> {
        let now = Utc::now();
        Ok(self
            .domains
            .get(domain)
            .and_then(|bucket| bucket.get(key).filter(|s| s.is_live(now)).map(|s| s.value.clone())))
    }

    async fn put(
        &self,
        domain: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), MemoryError> {
        let expires_at = ttl
            .map(|ttl| {
                chrono::Duration::from_std(ttl)
                    .map(|ttl| Utc::now() + ttl)
                    .map_err(|e| MemoryError::Backend(format!("invalid ttl: {e}")))
            })
            .transpose()?;
        self.domains
            .entry(domain.to_owned())
            .or_default()
            .insert(key.to_owned(), Stored { value, expires_at });
        Ok(())
    }

    async fn query_domain(&self, domain: &str) -> Result<Vec<(String, Value)>, MemoryError> {
        let now = Utc::now();
        Ok(self
            .domains
            .get(domain)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|(_, stored)| stored.is_live(now))
                    .map(|(key, stored)| (key.clone(), stored.value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
