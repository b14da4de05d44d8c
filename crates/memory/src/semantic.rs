//! Semantic memory: entities, facts and typed relationships.
//!
//! Entities are indexed by domain then name, relationships by domain, then
//! type, then `(from, to)`. Domain-scoped lookups touch only the matching
//! bucket regardless of total store size.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub entity_type: String,
    pub domain: String,
    /// Facts about the entity.
    #[serde(default)]
    pub attributes: Value,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(
        domain: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        attributes: Value,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            domain: domain.into(),
            attributes,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from: String,
    pub to: String,
    pub relation_type: String,
    pub domain: String,
    /// Confidence in `[0, 1]`.
    pub strength: f64,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        domain: impl Into<String>,
        from: impl Into<String>,
        relation_type: impl Into<String>,
        to: impl Into<String>,
        strength: f64,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.into(),
            domain: domain.into(),
            strength: strength.clamp(0.0, 1.0),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SemanticMemory {
    entities: DashMap<String, BTreeMap<String, Entity>>,
    relationships: DashMap<String, BTreeMap<String, BTreeMap<(String, String), Relationship>>>,
}

impl SemanticMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity (keyed by domain + name).
    pub fn store_entity(&self, entity: Entity) {
        self.entities
            .entry(entity.domain.clone())
            .or_default()
            .insert(entity.name.clone(), entity);
    }

    pub fn entity(&self, domain: &str, name: &str) -> Option<Entity> {
        self.entities.get(domain)?.get(name).cloned()
    }

    /// All entities of one domain, ordered by name.
    pub fn entities_by_domain(&self, domain: &str) -> Vec<Entity> {
        self.entities
            .get(domain)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entities_of_type(&self, domain: &str, entity_type: &str) -> Vec<Entity> {
        self.entities_by_domain(domain)
            .into_iter()
            .filter(|entity| entity.entity_type == entity_type)
            .collect()
    }

    /// Insert or replace a relationship (keyed by domain + type + from + to).
    pub fn store_relationship(&self, relationship: Relationship) {
        self.relationships
            .entry(relationship.domain.clone())
            .or_default()
            .entry(relationship.relation_type.clone())
            .or_default()
            .insert(
                (relationship.from.clone(), relationship.to.clone()),
                relationship,
            );
    }

    /// Relationships of one type within one domain, ordered by `(from, to)`.
    pub fn relationships_of_type(&self, domain: &str, relation_type: &str) -> Vec<Relationship> {
        self.relationships
            .get(domain)
            .and_then(|bucket| {
                bucket
                    .get(relation_type)
                    .map(|r| r.values().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Relationships of one type across every domain, ordered by domain.
    pub fn relationships_by_type(&self, relation_type: &str) -> Vec<Relationship> {
        let mut found: Vec<Relationship> = self
            .relationships
            .iter()
            .filter_map(|bucket| {
                bucket
                    .value()
                    .get(relation_type)
                    .map(|r| r.values().cloned().collect::<Vec<_>>())
            })
            .flatten()
            .collect();
        found.sort_by(|a, b| (&a.domain, &a.from, &a.to).cmp(&(&b.domain, &b.from, &b.to)));
        found
    }

    /// Every relationship of one domain, ordered by type then `(from, to)`.
    pub fn relationships_by_domain(&self, domain: &str) -> Vec<Relationship> {
        self.relationships
            .get(domain)
            .map(|bucket| bucket.values().flat_map(|r| r.values().cloned()).collect())
            .unwrap_or_default()
    }

    /// Adjust a relationship's strength by `delta`, clamped to `[0, 1]`.
    ///
    /// Returns the new strength, or `None` if the relationship is unknown.
    pub fn reinforce(
        &self,
        domain: &str,
        relation_type: &str,
        from: &str,
        to: &str,
        delta: f64,
    ) -> Option<f64> {
        let mut bucket = self.relationships.get_mut(domain)?;
        let relationship = bucket
            .get_mut(relation_type)?
            .get_mut(&(from.to_owned(), to.to_owned()))?;
        relationship.strength = (relationship.strength + delta).clamp(0.0, 1.0);
        relationship.updated_at = Utc::now();
        Some(relationship.strength)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.iter().map(|bucket| bucket.value().len()).sum()
    }
}
