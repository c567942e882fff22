//! Storage access patterns used by the engine
//!
//! Each trait covers one pattern: keyed cache lookup, graph and community
//! persistence, and atomic read-modify-write of shared buckets. Handles are
//! passed explicitly so tests can swap in [`crate::MemoryStore`].

use crate::Result;
use async_trait::async_trait;
use graphrag_core::{BucketState, CacheEntry, CommunityHierarchy, CommunitySummary, Community, Graph};
use serde::{Deserialize, Serialize};

/// Keyed cache storage with per-key computation claims
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous value under the same key
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every entry whose key starts with `prefix`; returns how many
    async fn invalidate_prefix(&self, prefix: &str) -> Result<u64>;

    /// Take the computation lease for `key`.
    ///
    /// Succeeds when no lease exists, the existing one expired before
    /// `now_ms`, or `owner` already holds it.
    async fn try_claim(&self, key: &str, owner: &str, now_ms: i64, lease_ms: i64) -> Result<bool>;

    /// Drop the lease if `owner` still holds it
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

/// Shared token-bucket records
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn load(&self, bucket_id: &str) -> Result<Option<BucketState>>;

    /// Insert `state` unless a record already exists; returns the stored record
    async fn create_if_absent(&self, state: BucketState) -> Result<BucketState>;

    /// Replace the record iff its version is still `expected_version`
    async fn compare_and_swap(&self, expected_version: u64, next: BucketState) -> Result<bool>;
}

/// Summary record of one indexed graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMeta {
    pub graph_id: String,
    pub document_ids: Vec<String>,
    pub fingerprint: String,
    pub node_count: u64,
    pub edge_count: u64,
    pub community_count: u64,
    /// Modularity per hierarchy level
    pub modularity: Vec<f64>,
    pub indexed_at_ms: i64,
}

impl GraphMeta {
    pub fn levels(&self) -> usize {
        self.modularity.len()
    }
}

/// Record counts across the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbStats {
    #[serde(default)]
    pub cache_entries: i64,
    #[serde(default)]
    pub graphs: i64,
    #[serde(default)]
    pub nodes: i64,
    #[serde(default)]
    pub edges: i64,
    #[serde(default)]
    pub communities: i64,
    #[serde(default)]
    pub summaries: i64,
}

/// Graph, community and summary persistence
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert nodes and replace edges of `graph_id`
    async fn save_graph(&self, graph_id: &str, graph: &Graph) -> Result<()>;

    async fn load_graph(&self, graph_id: &str) -> Result<Option<Graph>>;

    /// Replace the stored hierarchy of `graph_id`
    async fn save_communities(&self, graph_id: &str, hierarchy: &CommunityHierarchy) -> Result<()>;

    /// Communities of one level, in index order
    async fn load_level(&self, graph_id: &str, level: u32) -> Result<Vec<Community>>;

    /// The whole hierarchy, with modularity taken from the graph's meta record
    async fn load_communities(&self, graph_id: &str) -> Result<CommunityHierarchy>;

    /// Upsert summaries
    async fn save_summaries(&self, graph_id: &str, summaries: &[CommunitySummary]) -> Result<()>;

    /// Summaries at `level`, or every level when `None`, ordered by community id
    async fn load_summaries(&self, graph_id: &str, level: Option<u32>) -> Result<Vec<CommunitySummary>>;

    async fn save_meta(&self, meta: &GraphMeta) -> Result<()>;

    async fn load_meta(&self, graph_id: &str) -> Result<Option<GraphMeta>>;

    async fn list_graphs(&self) -> Result<Vec<GraphMeta>>;

    /// Remove a graph with its communities and summaries
    async fn delete_graph(&self, graph_id: &str) -> Result<()>;

    async fn stats(&self) -> Result<DbStats>;
}
