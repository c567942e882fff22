//! In-process store for tests and single-process runs

use crate::store::{BucketStore, CacheStore, DbStats, GraphMeta, GraphStore};
use crate::Result;
use async_trait::async_trait;
use graphrag_core::{BucketState, CacheEntry, Community, CommunityHierarchy, CommunitySummary, CommunityId, Graph};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Claim {
    owner: String,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, CacheEntry>,
    claims: HashMap<String, Claim>,
    buckets: HashMap<String, BucketState>,
    graphs: HashMap<String, Graph>,
    hierarchies: HashMap<String, CommunityHierarchy>,
    summaries: HashMap<String, BTreeMap<CommunityId, CommunitySummary>>,
    metas: HashMap<String, GraphMeta>,
}

/// Implements every storage trait over in-memory maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.state.lock().await.entries.get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.state.lock().await.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.state.lock().await.entries.remove(key);
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - state.entries.len()) as u64)
    }

    async fn try_claim(&self, key: &str, owner: &str, now_ms: i64, lease_ms: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let available = match state.claims.get(key) {
            None => true,
            Some(claim) => claim.owner == owner || claim.expires_at_ms <= now_ms,
        };
        if available {
            state.claims.insert(
                key.to_string(),
                Claim {
                    owner: owner.to_string(),
                    expires_at_ms: now_ms.saturating_add(lease_ms),
                },
            );
        }
        Ok(available)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.claims.get(key).is_some_and(|c| c.owner == owner) {
            state.claims.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn load(&self, bucket_id: &str) -> Result<Option<BucketState>> {
        Ok(self.state.lock().await.buckets.get(bucket_id).cloned())
    }

    async fn create_if_absent(&self, state: BucketState) -> Result<BucketState> {
        let mut guard = self.state.lock().await;
        Ok(guard
            .buckets
            .entry(state.bucket_id.clone())
            .or_insert(state)
            .clone())
    }

    async fn compare_and_swap(&self, expected_version: u64, next: BucketState) -> Result<bool> {
        let mut guard = self.state.lock().await;
        match guard.buckets.get_mut(&next.bucket_id) {
            Some(current) if current.version == expected_version => {
                *current = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn save_graph(&self, graph_id: &str, graph: &Graph) -> Result<()> {
        self.state
            .lock()
            .await
            .graphs
            .insert(graph_id.to_string(), graph.clone());
        Ok(())
    }

    async fn load_graph(&self, graph_id: &str) -> Result<Option<Graph>> {
        let state = self.state.lock().await;
        if !state.metas.contains_key(graph_id) {
            return Ok(None);
        }
        Ok(Some(state.graphs.get(graph_id).cloned().unwrap_or_default()))
    }

    async fn save_communities(&self, graph_id: &str, hierarchy: &CommunityHierarchy) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .hierarchies
            .insert(graph_id.to_string(), hierarchy.clone());
        state.summaries.remove(graph_id);
        Ok(())
    }

    async fn load_level(&self, graph_id: &str, level: u32) -> Result<Vec<Community>> {
        let state = self.state.lock().await;
        Ok(state
            .hierarchies
            .get(graph_id)
            .map(|h| h.level(level).to_vec())
            .unwrap_or_default())
    }

    async fn load_communities(&self, graph_id: &str) -> Result<CommunityHierarchy> {
        let state = self.state.lock().await;
        Ok(state.hierarchies.get(graph_id).cloned().unwrap_or_default())
    }

    async fn save_summaries(&self, graph_id: &str, summaries: &[CommunitySummary]) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.summaries.entry(graph_id.to_string()).or_default();
        for summary in summaries {
            stored.insert(summary.community, summary.clone());
        }
        Ok(())
    }

    async fn load_summaries(&self, graph_id: &str, level: Option<u32>) -> Result<Vec<CommunitySummary>> {
        let state = self.state.lock().await;
        Ok(state
            .summaries
            .get(graph_id)
            .map(|stored| {
                stored
                    .values()
                    .filter(|s| level.map_or(true, |l| s.level() == l))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_meta(&self, meta: &GraphMeta) -> Result<()> {
        self.state
            .lock()
            .await
            .metas
            .insert(meta.graph_id.clone(), meta.clone());
        Ok(())
    }

    async fn load_meta(&self, graph_id: &str) -> Result<Option<GraphMeta>> {
        Ok(self.state.lock().await.metas.get(graph_id).cloned())
    }

    async fn list_graphs(&self) -> Result<Vec<GraphMeta>> {
        let state = self.state.lock().await;
        let mut graphs: Vec<GraphMeta> = state.metas.values().cloned().collect();
        graphs.sort_by(|a, b| {
            b.indexed_at_ms
                .cmp(&a.indexed_at_ms)
                .then_with(|| a.graph_id.cmp(&b.graph_id))
        });
        Ok(graphs)
    }

    async fn delete_graph(&self, graph_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.graphs.remove(graph_id);
        state.hierarchies.remove(graph_id);
        state.summaries.remove(graph_id);
        state.metas.remove(graph_id);
        Ok(())
    }

    async fn stats(&self) -> Result<DbStats> {
        let state = self.state.lock().await;
        Ok(DbStats {
            cache_entries: state.entries.len() as i64,
            graphs: state.metas.len() as i64,
            nodes: state.graphs.values().map(|g| g.node_count() as i64).sum(),
            edges: state.graphs.values().map(|g| g.edge_count() as i64).sum(),
            communities: state
                .hierarchies
                .values()
                .map(|h| h.communities().count() as i64)
                .sum(),
            summaries: state.summaries.values().map(|s| s.len() as i64).sum(),
        })
    }
}
