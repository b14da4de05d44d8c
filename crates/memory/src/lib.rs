//! `memory` crate: the four-kind memory subsystem used by agent nodes.
//!
//! - **Working**: per-run scratch state, evicted when the run ends.
//! - **Episodic**: append-only interaction history, queryable by session.
//! - **Semantic**: entities and typed relationships, indexed by domain/type.
//! - **Procedural**: learned action patterns with success metrics.
//!
//! Every store is indexed by domain first, so domain-scoped lookups never
//! scan the whole store. Cross-run kinds can be written through to a
//! [`MemoryBackend`].

pub mod backend;
pub mod episodic;
pub mod error;
pub mod procedural;
pub mod record;
pub mod semantic;
pub mod working;

pub use backend::{InMemoryBackend, MemoryBackend};
pub use episodic::{Episode, EpisodicMemory};
pub use error::MemoryError;
pub use procedural::{CategoryMetrics, ProceduralMemory, Procedure};
pub use record::{MemoryKind, MemoryRecord};
pub use semantic::{Entity, Relationship, SemanticMemory};
pub use working::WorkingMemory;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

const ENTITY_PREFIX: &str = "entity:";
const RELATIONSHIP_PREFIX: &str = "relationship:";
const PROCEDURE_PREFIX: &str = "procedure:";
const EPISODE_PREFIX: &str = "episode:";

/// Entry point to all memory kinds, shared by every run of a process.
#[derive(Default)]
pub struct MemorySystem {
    working: DashMap<Uuid, Arc<WorkingMemory>>,
    episodic: EpisodicMemory,
    semantic: SemanticMemory,
    procedural: ProceduralMemory,
    backend: Option<Arc<dyn MemoryBackend>>,
}

impl MemorySystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write semantic, procedural and episodic records through to `backend`.
    pub fn with_backend(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    /// Working memory for a run, created on first access.
    pub fn working(&self, run_id: Uuid) -> Arc<WorkingMemory> {
        self.working
            .entry(run_id)
            .or_insert_with(|| Arc::new(WorkingMemory::new(run_id)))
            .clone()
    }

    /// Evict a run's working memory. Returns the number of records dropped.
    pub fn end_run(&self, run_id: Uuid) -> usize {
        match self.working.remove(&run_id) {
            Some((_, memory)) => {
                let dropped = memory.len();
                memory.clear();
                debug!(%run_id, dropped, "evicted working memory");
                dropped
            }
            None => 0,
        }
    }

    pub fn active_runs(&self) -> usize {
        self.working.len()
    }

    pub fn episodic(&self) -> &EpisodicMemory {
        &self.episodic
    }

    pub fn semantic(&self) -> &SemanticMemory {
        &self.semantic
    }

    pub fn procedural(&self) -> &ProceduralMemory {
        &self.procedural
    }

    pub async fn record_episode(&self, episode: Episode) -> Result<Uuid, MemoryError> {
        self.write_through(
            &episode.domain,
            &format!("{EPISODE_PREFIX}{}", episode.id),
            serde_json::to_value(&episode)?,
        )
        .await?;
        Ok(self.episodic.append(episode))
    }

    pub async fn remember_entity(&self, entity: Entity) -> Result<(), MemoryError> {
        self.write_through(
            &entity.domain,
            &format!("{ENTITY_PREFIX}{}", entity.name),
            serde_json::to_value(&entity)?,
        )
        .await?;
        self.semantic.store_entity(entity);
        Ok(())
    }

    pub async fn remember_relationship(
        &self,
        relationship: Relationship,
    ) -> Result<(), MemoryError> {
        self.write_through(
            &relationship.domain,
            &format!(
                "{RELATIONSHIP_PREFIX}{}:{}:{}",
                relationship.relation_type, relationship.from, relationship.to
            ),
            serde_json::to_value(&relationship)?,
        )
        .await?;
        self.semantic.store_relationship(relationship);
        Ok(())
    }

    /// Record a procedure outcome and persist the updated counters.
    pub async fn record_procedure_outcome(
        &self,
        domain: &str,
        category: &str,
        name: &str,
        steps: &[String],
        success: bool,
        duration: Duration,
    ) -> Result<Procedure, MemoryError> {
        let procedure = self
            .procedural
            .record_outcome(domain, category, name, steps, success, duration);
        self.write_through(
            domain,
            &format!("{PROCEDURE_PREFIX}{category}:{name}"),
            serde_json::to_value(&procedure)?,
        )
        .await?;
        Ok(procedure)
    }

    /// Load a domain's entities, relationships and procedures from the backend.
    ///
    /// Returns the number of records restored; without a backend this is 0.
    pub async fn restore_domain(&self, domain: &str) -> Result<usize, MemoryError> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let mut restored = 0;
        for (key, value) in backend.query_domain(domain).await? {
            if key.starts_with(ENTITY_PREFIX) {
                self.semantic.store_entity(serde_json::from_value(value)?);
            } else if key.starts_with(RELATIONSHIP_PREFIX) {
                self.semantic.store_relationship(serde_json::from_value(value)?);
            } else if key.starts_with(PROCEDURE_PREFIX) {
                self.procedural.store(serde_json::from_value(value)?);
            } else {
                continue;
            }
            restored += 1;
        }
        debug!(domain, restored, "restored memory domain");
        Ok(restored)
    }

    async fn write_through(
        &self,
        domain: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), MemoryError> {
        if let Some(backend) = &self.backend {
            backend.put(domain, key, value, None).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemorySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySystem")
            .field("active_runs", &self.working.len())
            .field("episodes", &self.episodic.len())
            .field("entities", &self.semantic.entity_count())
            .field("backend", &self.backend.is_some())
            .finish()
    }
}
