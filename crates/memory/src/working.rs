//! Working memory: scratch state scoped to a single run.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::record::{MemoryKind, MemoryRecord};

/// Per-run key/value store, indexed by domain then key.
///
/// Writes to one domain serialize on that domain's shard; reads of other
/// domains are not blocked by them.
#[derive(Debug)]
pub struct WorkingMemory {
    run_id: Uuid,
    domains: DashMap<String, HashMap<String, MemoryRecord>>,
}

impl WorkingMemory {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            domains: DashMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Store `value` under `domain`/`key`, overwriting any previous value.
    pub fn put(&self, domain: &str, key: &str, value: Value, ttl: Option<Duration>) {
        let mut record = MemoryRecord::new(MemoryKind::Working, domain, key, value);
        if let Some(ttl) = ttl {
            record = record.with_ttl(ttl);
        }
        self.domains
            .entry(domain.to_owned())
            .or_default()
            .insert(key.to_owned(), record);
    }

    pub fn get(&self, domain: &str, key: &str) -> Option<Value> {
        let now = Utc::now();
        self.domains
            .get(domain)?
            .get(key)
            .filter(|record| !record.is_expired_at(now))
            .map(|record| record.value.clone())
    }

    /// Live records of one domain, oldest first.
    pub fn domain(&self, domain: &str) -> Vec<MemoryRecord> {
        let now = Utc::now();
        let Some(entries) = self.domains.get(domain) else {
            return Vec::new();
        };
        let mut records: Vec<MemoryRecord> = entries
            .values()
            .filter(|record| !record.is_expired_at(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        records
    }

    pub fn len(&self) -> usize {
        self.domains.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.domains.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_key_overwrites() {
        let memory = WorkingMemory::new(Uuid::new_v4());
        memory.put("research", "draft", json!("v1"), None);
        memory.put("research", "draft", json!("v2"), None);

        assert_eq!(memory.get("research", "draft"), Some(json!("v2")));
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn domains_are_isolated() {
        let memory = WorkingMemory::new(Uuid::new_v4());
        memory.put("a", "k", json!(1), None);
        memory.put("b", "k", json!(2), None);

        assert_eq!(memory.get("a", "k"), Some(json!(1)));
        assert_eq!(memory.domain("b").len(), 1);
        assert!(memory.domain("c").is_empty());
    }

    #[test]
    fn expired_entries_are_invisible() {
        let memory = WorkingMemory::new(Uuid::new_v4());
        memory.put("a", "gone", json!(1), Some(Duration::from_secs(0)));
        assert_eq!(memory.get("a", "gone"), None);
        assert!(memory.domain("a").is_empty());
    }
}
