//! Episodic memory: append-only interaction history.
//!
//! Episodes are indexed twice: by session (conversation) id for replaying a
//! conversation, and by domain for cross-session lookups.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub session_id: String,
    pub domain: String,
    /// Who produced the entry (agent id, "user", tool name, ...).
    pub actor: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl Episode {
    pub fn new(
        session_id: impl Into<String>,
        domain: impl Into<String>,
        actor: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            domain: domain.into(),
            actor: actor.into(),
            content,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct EpisodicMemory {
    by_session: DashMap<String, Vec<Episode>>,
    by_domain: DashMap<String, Vec<Episode>>,
}

impl EpisodicMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an episode and return its id.
    pub fn append(&self, episode: Episode) -> Uuid {
        let id = episode.id;
        self.by_domain
            .entry(episode.domain.clone())
            .or_default()
            .push(episode.clone());
        self.by_session
            .entry(episode.session_id.clone())
            .or_default()
            .push(episode);
        id
    }

    /// Every episode of a session, in append order.
    pub fn session(&self, session_id: &str) -> Vec<Episode> {
        self.by_session
            .get(session_id)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    /// The last `limit` episodes of a session, oldest first.
    pub fn recent(&self, session_id: &str, limit: usize) -> Vec<Episode> {
        let Some(entries) = self.by_session.get(session_id) else {
            return Vec::new();
        };
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn by_domain(&self, domain: &str) -> Vec<Episode> {
        self.by_domain
            .get(domain)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_session.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sessions_keep_append_order() {
        let memory = EpisodicMemory::new();
        memory.append(Episode::new("s1", "support", "user", json!("hi")));
        memory.append(Episode::new("s2", "support", "user", json!("other")));
        memory.append(Episode::new("s1", "support", "agent", json!("hello")));

        let session = memory.session("s1");
        assert_eq!(session.len(), 2);
        assert_eq!(session[0].content, json!("hi"));
        assert_eq!(session[1].actor, "agent");
        assert_eq!(memory.by_domain("support").len(), 3);
    }

    #[test]
    fn recent_returns_tail() {
        let memory = EpisodicMemory::new();
        for i in 0..5 {
            memory.append(Episode::new("s", "d", "agent", json!(i)));
        }
        let recent: Vec<Value> = memory.recent("s", 2).into_iter().map(|e| e.content).collect();
        assert_eq!(recent, vec![json!(3), json!(4)]);
        assert!(memory.recent("unknown", 3).is_empty());
    }
}
