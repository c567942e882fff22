//! The merged, attributed entity graph
//!
//! Every merge in this module is a union, a sum or a minimum, so the graph
//! built from a set of elements does not depend on the order the elements
//! arrive in. Chunk extractions can be folded in as they complete.

use crate::document::Chunk;
use crate::element::{ChunkExtraction, Element, EntityElement, EntityKey, EntityRef, RelationshipElement};
use crate::error::Result;
use crate::hashing::content_hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Description used when a relationship arrives without one
const DEFAULT_RELATION: &str = "related to";

/// Undirected edge identity: the two endpoint keys in sorted order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeKey(String);

impl EdgeKey {
    pub fn new(a: &EntityKey, b: &EntityKey) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}<>{}", lo, hi))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A merged entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub key: EntityKey,
    /// Display name: the smallest surface form seen
    pub name: String,
    pub entity_type: String,
    pub descriptions: BTreeSet<String>,
    /// One-paragraph digest of `descriptions`, when they were summarized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Number of entity elements merged into this node
    pub occurrences: u64,
    pub source_chunks: BTreeSet<String>,
}

impl NodeRecord {
    fn from_ref(entity: &EntityRef, chunk_id: &str) -> Self {
        Self {
            key: entity.key(),
            name: entity.name.trim().to_string(),
            entity_type: entity.entity_type.trim().to_string(),
            descriptions: BTreeSet::new(),
            summary: None,
            occurrences: 0,
            source_chunks: BTreeSet::from([chunk_id.to_string()]),
        }
    }

    fn from_element(entity: &EntityElement) -> Self {
        let mut node = Self::from_ref(
            &EntityRef::new(entity.name.clone(), entity.entity_type.clone()),
            &entity.chunk_id,
        );
        let description = entity.description.trim();
        if !description.is_empty() {
            node.descriptions.insert(description.to_string());
        }
        node.occurrences = 1;
        node
    }

    fn absorb(&mut self, other: NodeRecord) {
        if other.name < self.name {
            self.name = other.name;
        }
        if other.entity_type < self.entity_type {
            self.entity_type = other.entity_type;
        }
        self.descriptions.extend(other.descriptions);
        self.summary = None;
        self.occurrences += other.occurrences;
        self.source_chunks.extend(other.source_chunks);
    }

    /// The summary if there is one, else the distinct descriptions joined
    pub fn description(&self) -> String {
        match &self.summary {
            Some(summary) => summary.clone(),
            None => self.descriptions.iter().cloned().collect::<Vec<_>>().join("\n"),
        }
    }

    /// Documents this node was seen in
    pub fn documents(&self) -> BTreeSet<String> {
        self.source_chunks
            .iter()
            .map(|chunk| Chunk::document_of(chunk).to_string())
            .collect()
    }
}

/// Merged relationship evidence between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub key: EdgeKey,
    /// Smaller endpoint key
    pub source: EntityKey,
    /// Larger endpoint key
    pub target: EntityKey,
    /// `"A -> relation -> B"` statements, keeping the direction they were stated in
    pub descriptions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub weight: f64,
    pub occurrences: u64,
    pub source_chunks: BTreeSet<String>,
}

impl EdgeRecord {
    fn from_element(rel: &RelationshipElement) -> Self {
        let a = rel.source.key();
        let b = rel.target.key();
        let (source, target) = if a <= b { (a, b) } else { (b, a) };
        let relation = match rel.description.trim() {
            "" => DEFAULT_RELATION,
            text => text,
        };
        let weight = if rel.weight.is_finite() && rel.weight > 0.0 {
            rel.weight
        } else {
            1.0
        };
        Self {
            key: EdgeKey::new(&source, &target),
            source,
            target,
            descriptions: BTreeSet::from([format!(
                "{} -> {} -> {}",
                rel.source.name.trim(),
                relation,
                rel.target.name.trim()
            )]),
            summary: None,
            weight,
            occurrences: 1,
            source_chunks: BTreeSet::from([rel.chunk_id.clone()]),
        }
    }

    fn absorb(&mut self, other: EdgeRecord) {
        self.descriptions.extend(other.descriptions);
        self.summary = None;
        self.weight += other.weight;
        self.occurrences += other.occurrences;
        self.source_chunks.extend(other.source_chunks);
    }

    pub fn description(&self) -> String {
        match &self.summary {
            Some(summary) => summary.clone(),
            None => self.descriptions.iter().cloned().collect::<Vec<_>>().join("\n"),
        }
    }
}

/// The knowledge graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: BTreeMap<EntityKey, NodeRecord>,
    edges: BTreeMap<EdgeKey, EdgeRecord>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from stored records
    pub fn from_records(
        nodes: impl IntoIterator<Item = NodeRecord>,
        edges: impl IntoIterator<Item = EdgeRecord>,
    ) -> Self {
        let mut graph = Self::new();
        for node in nodes {
            graph.upsert_node(node);
        }
        for edge in edges {
            graph.upsert_edge(edge);
        }
        graph
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in key order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Edges in key order
    pub fn edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.values()
    }

    pub fn node(&self, key: &EntityKey) -> Option<&NodeRecord> {
        self.nodes.get(key)
    }

    pub fn edge(&self, a: &EntityKey, b: &EntityKey) -> Option<&EdgeRecord> {
        self.edges.get(&EdgeKey::new(a, b))
    }

    /// Edges whose endpoints both lie in `members`
    pub fn edges_within<'a>(
        &'a self,
        members: &'a BTreeSet<EntityKey>,
    ) -> impl Iterator<Item = &'a EdgeRecord> + 'a {
        self.edges
            .values()
            .filter(move |e| members.contains(&e.source) && members.contains(&e.target))
    }

    fn upsert_node(&mut self, node: NodeRecord) {
        match self.nodes.get_mut(&node.key) {
            Some(existing) => existing.absorb(node),
            None => {
                self.nodes.insert(node.key.clone(), node);
            }
        }
    }

    fn upsert_edge(&mut self, edge: EdgeRecord) {
        match self.edges.get_mut(&edge.key) {
            Some(existing) => existing.absorb(edge),
            None => {
                self.edges.insert(edge.key.clone(), edge);
            }
        }
    }

    /// Merge an entity element
    pub fn add_entity(&mut self, entity: &EntityElement) {
        if entity.name.trim().is_empty() {
            return;
        }
        self.upsert_node(NodeRecord::from_element(entity));
    }

    /// Merge a relationship element. Endpoints become nodes even when the
    /// entity elements naming them have not arrived yet.
    pub fn add_relationship(&mut self, rel: &RelationshipElement) {
        if rel.source.name.trim().is_empty() || rel.target.name.trim().is_empty() {
            return;
        }
        if rel.source.key() == rel.target.key() {
            debug!(entity = %rel.source.key(), "Skipping self-referencing relationship");
            return;
        }
        self.upsert_node(NodeRecord::from_ref(&rel.source, &rel.chunk_id));
        self.upsert_node(NodeRecord::from_ref(&rel.target, &rel.chunk_id));
        self.upsert_edge(EdgeRecord::from_element(rel));
    }

    pub fn add_element(&mut self, element: &Element) {
        match element {
            Element::Entity(entity) => self.add_entity(entity),
            Element::Relationship(rel) => self.add_relationship(rel),
        }
    }

    /// Merge another graph into this one
    pub fn merge(&mut self, other: Graph) {
        for node in other.nodes.into_values() {
            self.upsert_node(node);
        }
        for edge in other.edges.into_values() {
            self.upsert_edge(edge);
        }
    }

    /// Attach a summary to a node's descriptions. Returns false for an unknown key.
    pub fn set_node_summary(&mut self, key: &EntityKey, summary: String) -> bool {
        match self.nodes.get_mut(key) {
            Some(node) => {
                node.summary = Some(summary);
                true
            }
            None => false,
        }
    }

    pub fn set_edge_summary(&mut self, key: &EdgeKey, summary: String) -> bool {
        match self.edges.get_mut(key) {
            Some(edge) => {
                edge.summary = Some(summary);
                true
            }
            None => false,
        }
    }

    /// Fold each untyped node into the one typed node sharing its name.
    ///
    /// Names carried by several typed nodes are ambiguous and stay untyped.
    /// Edges follow their endpoints; an edge that collapses onto a single
    /// node is dropped. Returns the number of nodes folded.
    pub fn resolve_untyped(&mut self) -> usize {
        let mut typed: BTreeMap<&str, Vec<&EntityKey>> = BTreeMap::new();
        for key in self.nodes.keys().filter(|k| !k.is_untyped()) {
            typed.entry(key.name_part()).or_default().push(key);
        }
        let renames: BTreeMap<EntityKey, EntityKey> = self
            .nodes
            .keys()
            .filter(|k| k.is_untyped())
            .filter_map(|k| match typed.get(k.name_part()).map(Vec::as_slice) {
                Some([only]) => Some((k.clone(), (*only).clone())),
                _ => None,
            })
            .collect();
        if renames.is_empty() {
            return 0;
        }

        for (from, to) in &renames {
            let Some(mut node) = self.nodes.remove(from) else {
                continue;
            };
            node.key = to.clone();
            if let Some(target) = self.nodes.get(to) {
                node.entity_type = target.entity_type.clone();
            }
            self.upsert_node(node);
        }

        for mut edge in std::mem::take(&mut self.edges).into_values() {
            let a = renames.get(&edge.source).unwrap_or(&edge.source).clone();
            let b = renames.get(&edge.target).unwrap_or(&edge.target).clone();
            if a == b {
                debug!(entity = %a, "Dropping edge collapsed by type resolution");
                continue;
            }
            let (source, target) = if a <= b { (a, b) } else { (b, a) };
            edge.key = EdgeKey::new(&source, &target);
            edge.source = source;
            edge.target = target;
            self.upsert_edge(edge);
        }
        debug!(folded = renames.len(), "Resolved untyped entities");
        renames.len()
    }

    /// Content hash of the whole graph
    pub fn fingerprint(&self) -> Result<String> {
        Ok(content_hash(&serde_json::to_string(self)?))
    }
}

/// Folds chunk extractions into a [`Graph`] in whatever order they finish
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    chunks: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a set of elements
    pub fn build<'a>(elements: impl IntoIterator<Item = &'a Element>) -> Graph {
        let mut graph = Graph::new();
        for element in elements {
            graph.add_element(element);
        }
        graph.resolve_untyped();
        graph
    }

    /// Merge one chunk's extraction
    pub fn absorb(&mut self, extraction: &ChunkExtraction) {
        for element in &extraction.elements {
            self.graph.add_element(element);
        }
        self.chunks += 1;
    }

    /// Number of chunk extractions merged so far
    pub fn chunks_absorbed(&self) -> usize {
        self.chunks
    }

    /// The merged graph with untyped endpoints resolved
    pub fn finish(mut self) -> Graph {
        self.graph.resolve_untyped();
        self.graph
    }
}
