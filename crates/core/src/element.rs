//! Extracted elements - entities and relationships pulled out of a chunk

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type given to a relationship endpoint its extraction never declared
pub const UNKNOWN_ENTITY_TYPE: &str = "unknown";

/// Canonicalize a name for deduplication: lowercase, trimmed, whitespace collapsed
pub fn canonicalize(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identity of a graph node: canonical name plus canonical type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(name: &str, entity_type: &str) -> Self {
        // `|` separates the two halves, so it may not appear inside them
        let name = canonicalize(name).replace('|', "/");
        let entity_type = canonicalize(entity_type).replace('|', "/");
        Self(format!("{}|{}", name, entity_type))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical name half of the key
    pub fn name_part(&self) -> &str {
        self.0.split_once('|').map_or(self.0.as_str(), |(name, _)| name)
    }

    /// Canonical type half of the key
    pub fn type_part(&self) -> &str {
        self.0.split_once('|').map_or("", |(_, ty)| ty)
    }

    pub fn is_untyped(&self) -> bool {
        self.type_part() == UNKNOWN_ENTITY_TYPE
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference to an entity by surface name and type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub name: String,
    pub entity_type: String,
}

impl EntityRef {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.name, &self.entity_type)
    }
}

/// An entity found in a chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityElement {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    /// Originating chunk id
    pub chunk_id: String,
}

impl EntityElement {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.name, &self.entity_type)
    }
}

/// A relationship between two entities found in a chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipElement {
    pub source: EntityRef,
    pub target: EntityRef,
    #[serde(default)]
    pub description: String,
    pub weight: f64,
    /// Originating chunk id
    pub chunk_id: String,
}

/// Either kind of extracted element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Element {
    Entity(EntityElement),
    Relationship(RelationshipElement),
}

impl Element {
    pub fn chunk_id(&self) -> &str {
        match self {
            Element::Entity(e) => &e.chunk_id,
            Element::Relationship(r) => &r.chunk_id,
        }
    }
}

/// Everything extracted from one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkExtraction {
    pub chunk_id: String,
    pub elements: Vec<Element>,
}

impl ChunkExtraction {
    pub fn entities(&self) -> impl Iterator<Item = &EntityElement> {
        self.elements.iter().filter_map(|e| match e {
            Element::Entity(entity) => Some(entity),
            Element::Relationship(_) => None,
        })
    }

    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipElement> {
        self.elements.iter().filter_map(|e| match e {
            Element::Relationship(rel) => Some(rel),
            Element::Entity(_) => None,
        })
    }
}
