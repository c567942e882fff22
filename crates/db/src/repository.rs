//! SurrealDB implementation of the storage traits

use crate::store::{BucketStore, CacheStore, DbStats, GraphMeta, GraphStore};
use crate::{DbConnection, DbError, Result};
use async_trait::async_trait;
use graphrag_core::{
    BucketState, CacheEntry, Community, CommunityHierarchy, CommunityId, CommunitySummary,
    EdgeRecord, EntityKey, Graph, NodeRecord, Stage,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Repository for all database operations
#[derive(Clone)]
pub struct Repository {
    db: DbConnection,
}

impl Repository {
    /// Create a new repository
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Underlying connection
    pub fn connection(&self) -> &DbConnection {
        &self.db
    }

    /// Attach a graph id to each serialized record
    fn tag_rows<'a, T: Serialize + 'a>(
        graph_id: &str,
        records: impl Iterator<Item = &'a T>,
    ) -> Result<Vec<serde_json::Value>> {
        records
            .map(|record| {
                let mut value = serde_json::to_value(record)?;
                if let Some(object) = value.as_object_mut() {
                    object.insert("graph_id".into(), graph_id.into());
                }
                Ok(value)
            })
            .collect()
    }
}

// ==========================================
// ROW TYPES
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRow {
    key: String,
    stage: String,
    value: String,
    created_at_ms: i64,
    #[serde(default)]
    ttl_secs: Option<i64>,
}

impl CacheRow {
    fn from_entry(entry: CacheEntry) -> Self {
        Self {
            key: entry.key,
            stage: entry.stage.as_str().to_string(),
            value: entry.value,
            created_at_ms: entry.created_at_ms,
            ttl_secs: entry.ttl_secs.map(|t| t as i64),
        }
    }

    fn into_entry(self) -> Result<CacheEntry> {
        let stage: Stage = serde_json::from_value(serde_json::Value::String(self.stage))?;
        Ok(CacheEntry {
            key: self.key,
            stage,
            value: self.value,
            created_at_ms: self.created_at_ms,
            ttl_secs: self.ttl_secs.map(|t| t.max(0) as u64),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClaimRow {
    key: String,
    owner: String,
    expires_at_ms: i64,
    version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommunityRow {
    graph_id: String,
    level: u32,
    community_index: u32,
    members: Vec<EntityKey>,
    #[serde(default)]
    parent: Option<u32>,
    #[serde(default)]
    children: Vec<u32>,
    #[serde(default)]
    documents: Vec<String>,
    membership_hash: String,
}

impl CommunityRow {
    fn new(graph_id: &str, community: &Community) -> Self {
        Self {
            graph_id: graph_id.to_string(),
            level: community.id.level,
            community_index: community.id.index,
            members: community.members.clone(),
            parent: community.parent,
            children: community.children.clone(),
            documents: community.documents.iter().cloned().collect(),
            membership_hash: community.membership_hash(),
        }
    }

    fn into_community(self) -> Community {
        Community {
            id: CommunityId::new(self.level, self.community_index),
            members: self.members,
            parent: self.parent,
            children: self.children,
            documents: self.documents.into_iter().collect::<BTreeSet<_>>(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SummaryRow {
    graph_id: String,
    level: u32,
    community_index: u32,
    title: String,
    summary: String,
    membership_hash: String,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl SummaryRow {
    fn new(graph_id: &str, summary: &CommunitySummary) -> Self {
        Self {
            graph_id: graph_id.to_string(),
            level: summary.community.level,
            community_index: summary.community.index,
            title: summary.title.clone(),
            summary: summary.summary.clone(),
            membership_hash: summary.membership_hash.clone(),
            prompt_tokens: summary.prompt_tokens,
            completion_tokens: summary.completion_tokens,
        }
    }

    fn into_summary(self) -> CommunitySummary {
        CommunitySummary {
            community: CommunityId::new(self.level, self.community_index),
            title: self.title,
            summary: self.summary,
            membership_hash: self.membership_hash,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

// ==========================================
// CACHE OPERATIONS
// ==========================================

#[async_trait]
impl CacheStore for Repository {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row: Option<CacheRow> = self
            .db
            .query(
                "SELECT key, stage, value, created_at_ms, ttl_secs \
                 FROM type::thing('cache_entry', $key)",
            )
            .bind(("key", key.to_string()))
            .await?
            .check()?
            .take(0)?;

        row.map(CacheRow::into_entry).transpose()
    }

    #[instrument(skip(self, entry), fields(key = %entry.key))]
    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let row = CacheRow::from_entry(entry);
        self.db
            .query("UPSERT type::thing('cache_entry', $key) CONTENT $row RETURN NONE")
            .bind(("key", row.key.clone()))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove(&self, key: &str) -> Result<()> {
        self.db
            .query("DELETE type::thing('cache_entry', $key) RETURN NONE")
            .bind(("key", key.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT count() AS count FROM cache_entry
                    WHERE string::starts_with(key, $prefix) GROUP ALL;
                DELETE cache_entry WHERE string::starts_with(key, $prefix) RETURN NONE;
            "#,
            )
            .bind(("prefix", prefix.to_string()))
            .await?
            .check()?;

        let counts: Vec<CountRow> = response.take(0)?;
        let removed = counts.first().map(|c| c.count.max(0) as u64).unwrap_or(0);
        debug!(prefix, removed, "Invalidated cache entries");
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn try_claim(&self, key: &str, owner: &str, now_ms: i64, lease_ms: i64) -> Result<bool> {
        let existing: Option<ClaimRow> = self
            .db
            .query("SELECT key, owner, expires_at_ms, version FROM type::thing('cache_claim', $key)")
            .bind(("key", key.to_string()))
            .await?
            .check()?
            .take(0)?;

        let expires_at_ms = now_ms.saturating_add(lease_ms);
        match existing {
            None => {
                let claim = ClaimRow {
                    key: key.to_string(),
                    owner: owner.to_string(),
                    expires_at_ms,
                    version: 0,
                };
                let created = self
                    .db
                    .query("CREATE type::thing('cache_claim', $key) CONTENT $claim RETURN NONE")
                    .bind(("key", key.to_string()))
                    .bind(("claim", claim))
                    .await?
                    .check();
                match created {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        // Lost the creation race if a record now exists
                        let winner: Option<ClaimRow> = self
                            .db
                            .query("SELECT key, owner, expires_at_ms, version FROM type::thing('cache_claim', $key)")
                            .bind(("key", key.to_string()))
                            .await?
                            .check()?
                            .take(0)?;
                        match winner {
                            Some(row) => Ok(row.owner == owner),
                            None => Err(DbError::Surreal(e)),
                        }
                    }
                }
            }
            Some(row) if row.owner == owner || row.expires_at_ms <= now_ms => {
                let updated: Vec<ClaimRow> = self
                    .db
                    .query(
                        "UPDATE type::thing('cache_claim', $key) \
                         SET owner = $owner, expires_at_ms = $expires, version = version + 1 \
                         WHERE version = $version RETURN key, owner, expires_at_ms, version",
                    )
                    .bind(("key", key.to_string()))
                    .bind(("owner", owner.to_string()))
                    .bind(("expires", expires_at_ms))
                    .bind(("version", row.version))
                    .await?
                    .check()?
                    .take(0)?;
                Ok(!updated.is_empty())
            }
            Some(_) => Ok(false),
        }
    }

    #[instrument(skip(self))]
    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.db
            .query("DELETE type::thing('cache_claim', $key) WHERE owner = $owner RETURN NONE")
            .bind(("key", key.to_string()))
            .bind(("owner", owner.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}

// ==========================================
// RATE-LIMIT BUCKETS
// ==========================================

const BUCKET_FIELDS: &str = "bucket_id, tokens, capacity, refill_rate, last_refill_ms, version";

#[async_trait]
impl BucketStore for Repository {
    #[instrument(skip(self))]
    async fn load(&self, bucket_id: &str) -> Result<Option<BucketState>> {
        let state: Option<BucketState> = self
            .db
            .query(format!(
                "SELECT {} FROM type::thing('rate_bucket', $id)",
                BUCKET_FIELDS
            ))
            .bind(("id", bucket_id.to_string()))
            .await?
            .check()?
            .take(0)?;
        Ok(state)
    }

    #[instrument(skip(self, state), fields(bucket = %state.bucket_id))]
    async fn create_if_absent(&self, state: BucketState) -> Result<BucketState> {
        if let Some(existing) = self.load(&state.bucket_id).await? {
            return Ok(existing);
        }
        let bucket_id = state.bucket_id.clone();
        let created = self
            .db
            .query("CREATE type::thing('rate_bucket', $id) CONTENT $state RETURN NONE")
            .bind(("id", bucket_id.clone()))
            .bind(("state", state.clone()))
            .await?
            .check();
        match created {
            Ok(_) => Ok(state),
            Err(e) => self
                .load(&bucket_id)
                .await?
                .ok_or(DbError::Surreal(e)),
        }
    }

    #[instrument(skip(self, next), fields(bucket = %next.bucket_id))]
    async fn compare_and_swap(&self, expected_version: u64, next: BucketState) -> Result<bool> {
        let updated: Vec<BucketState> = self
            .db
            .query(format!(
                "UPDATE type::thing('rate_bucket', $id) MERGE $state \
                 WHERE version = $expected RETURN {}",
                BUCKET_FIELDS
            ))
            .bind(("id", next.bucket_id.clone()))
            .bind(("state", next))
            .bind(("expected", expected_version))
            .await?
            .check()?
            .take(0)?;
        Ok(!updated.is_empty())
    }
}

// ==========================================
// GRAPH OPERATIONS
// ==========================================

const COMMUNITY_FIELDS: &str =
    "graph_id, level, community_index, members, parent, children, documents, membership_hash";
const SUMMARY_FIELDS: &str = "graph_id, level, community_index, title, summary, membership_hash, prompt_tokens, completion_tokens";
const META_FIELDS: &str = "graph_id, document_ids, fingerprint, node_count, edge_count, community_count, modularity, indexed_at_ms";

#[async_trait]
impl GraphStore for Repository {
    #[instrument(skip(self, graph), fields(nodes = graph.node_count(), edges = graph.edge_count()))]
    async fn save_graph(&self, graph_id: &str, graph: &Graph) -> Result<()> {
        let nodes = Self::tag_rows(graph_id, graph.nodes())?;
        let edges = Self::tag_rows(graph_id, graph.edges())?;
        let keys: Vec<String> = graph.nodes().map(|n| n.key.to_string()).collect();

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE graph_edge WHERE graph_id = $graph_id RETURN NONE;
                DELETE graph_node WHERE graph_id = $graph_id AND key NOTINSIDE $keys RETURN NONE;
                FOR $node IN $nodes {
                    UPSERT type::thing('graph_node', [$graph_id, $node.key]) CONTENT $node RETURN NONE;
                };
                FOR $edge IN $edges {
                    LET $from = type::thing('graph_node', [$graph_id, $edge.source]);
                    LET $to = type::thing('graph_node', [$graph_id, $edge.target]);
                    RELATE $from->graph_edge->$to CONTENT $edge RETURN NONE;
                };
                COMMIT TRANSACTION;
            "#,
            )
            .bind(("graph_id", graph_id.to_string()))
            .bind(("keys", keys))
            .bind(("nodes", nodes))
            .bind(("edges", edges))
            .await?
            .check()?;

        debug!(graph_id, "Saved graph");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_graph(&self, graph_id: &str) -> Result<Option<Graph>> {
        if self.load_meta(graph_id).await?.is_none() {
            return Ok(None);
        }

        let mut response = self
            .db
            .query(
                r#"
                SELECT key, name, entity_type, descriptions, summary, occurrences, source_chunks
                    FROM graph_node WHERE graph_id = $graph_id ORDER BY key;
                SELECT key, source, target, descriptions, summary, weight, occurrences, source_chunks
                    FROM graph_edge WHERE graph_id = $graph_id ORDER BY key;
            "#,
            )
            .bind(("graph_id", graph_id.to_string()))
            .await?
            .check()?;

        let nodes: Vec<NodeRecord> = response.take(0)?;
        let edges: Vec<EdgeRecord> = response.take(1)?;
        Ok(Some(Graph::from_records(nodes, edges)))
    }

    #[instrument(skip(self, hierarchy), fields(levels = hierarchy.num_levels()))]
    async fn save_communities(&self, graph_id: &str, hierarchy: &CommunityHierarchy) -> Result<()> {
        let rows: Vec<CommunityRow> = hierarchy
            .communities()
            .map(|c| CommunityRow::new(graph_id, c))
            .collect();

        // Summaries belong to the hierarchy they were written for
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE community WHERE graph_id = $graph_id RETURN NONE;
                DELETE community_summary WHERE graph_id = $graph_id RETURN NONE;
                FOR $row IN $rows {
                    CREATE type::thing('community', [$graph_id, $row.level, $row.community_index])
                        CONTENT $row RETURN NONE;
                };
                COMMIT TRANSACTION;
            "#,
            )
            .bind(("graph_id", graph_id.to_string()))
            .bind(("rows", rows))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_level(&self, graph_id: &str, level: u32) -> Result<Vec<Community>> {
        let rows: Vec<CommunityRow> = self
            .db
            .query(format!(
                "SELECT {} FROM community WHERE graph_id = $graph_id AND level = $level \
                 ORDER BY community_index",
                COMMUNITY_FIELDS
            ))
            .bind(("graph_id", graph_id.to_string()))
            .bind(("level", level))
            .await?
            .check()?
            .take(0)?;
        Ok(rows.into_iter().map(CommunityRow::into_community).collect())
    }

    #[instrument(skip(self))]
    async fn load_communities(&self, graph_id: &str) -> Result<CommunityHierarchy> {
        let rows: Vec<CommunityRow> = self
            .db
            .query(format!(
                "SELECT {} FROM community WHERE graph_id = $graph_id \
                 ORDER BY level, community_index",
                COMMUNITY_FIELDS
            ))
            .bind(("graph_id", graph_id.to_string()))
            .await?
            .check()?
            .take(0)?;

        let mut levels: Vec<Vec<Community>> = Vec::new();
        for row in rows {
            let level = row.level as usize;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(row.into_community());
        }

        let modularity = self
            .load_meta(graph_id)
            .await?
            .map(|m| m.modularity)
            .unwrap_or_else(|| vec![0.0; levels.len()]);
        Ok(CommunityHierarchy::new(levels, modularity))
    }

    #[instrument(skip(self, summaries), fields(count = summaries.len()))]
    async fn save_summaries(&self, graph_id: &str, summaries: &[CommunitySummary]) -> Result<()> {
        let rows: Vec<SummaryRow> = summaries
            .iter()
            .map(|s| SummaryRow::new(graph_id, s))
            .collect();

        self.db
            .query(
                r#"
                FOR $row IN $rows {
                    UPSERT type::thing('community_summary', [$graph_id, $row.level, $row.community_index])
                        CONTENT $row RETURN NONE;
                };
            "#,
            )
            .bind(("graph_id", graph_id.to_string()))
            .bind(("rows", rows))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_summaries(&self, graph_id: &str, level: Option<u32>) -> Result<Vec<CommunitySummary>> {
        let query = match level {
            Some(_) => format!(
                "SELECT {} FROM community_summary WHERE graph_id = $graph_id AND level = $level \
                 ORDER BY level, community_index",
                SUMMARY_FIELDS
            ),
            None => format!(
                "SELECT {} FROM community_summary WHERE graph_id = $graph_id \
                 ORDER BY level, community_index",
                SUMMARY_FIELDS
            ),
        };

        let rows: Vec<SummaryRow> = self
            .db
            .query(query)
            .bind(("graph_id", graph_id.to_string()))
            .bind(("level", level.unwrap_or_default()))
            .await?
            .check()?
            .take(0)?;
        Ok(rows.into_iter().map(SummaryRow::into_summary).collect())
    }

    #[instrument(skip(self, meta), fields(graph_id = %meta.graph_id))]
    async fn save_meta(&self, meta: &GraphMeta) -> Result<()> {
        self.db
            .query("UPSERT type::thing('graph_index', $graph_id) CONTENT $meta RETURN NONE")
            .bind(("graph_id", meta.graph_id.clone()))
            .bind(("meta", meta.clone()))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_meta(&self, graph_id: &str) -> Result<Option<GraphMeta>> {
        let meta: Option<GraphMeta> = self
            .db
            .query(format!(
                "SELECT {} FROM type::thing('graph_index', $graph_id)",
                META_FIELDS
            ))
            .bind(("graph_id", graph_id.to_string()))
            .await?
            .check()?
            .take(0)?;
        Ok(meta)
    }

    #[instrument(skip(self))]
    async fn list_graphs(&self) -> Result<Vec<GraphMeta>> {
        let graphs: Vec<GraphMeta> = self
            .db
            .query(format!(
                "SELECT {} FROM graph_index ORDER BY indexed_at_ms DESC",
                META_FIELDS
            ))
            .await?
            .check()?
            .take(0)?;
        Ok(graphs)
    }

    #[instrument(skip(self))]
    async fn delete_graph(&self, graph_id: &str) -> Result<()> {
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE graph_edge WHERE graph_id = $graph_id RETURN NONE;
                DELETE graph_node WHERE graph_id = $graph_id RETURN NONE;
                DELETE community WHERE graph_id = $graph_id RETURN NONE;
                DELETE community_summary WHERE graph_id = $graph_id RETURN NONE;
                DELETE type::thing('graph_index', $graph_id) RETURN NONE;
                COMMIT TRANSACTION;
            "#,
            )
            .bind(("graph_id", graph_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<DbStats> {
        let stats: Vec<DbStats> = self
            .db
            .query(
                r#"
                RETURN {
                    cache_entries: (SELECT count() FROM cache_entry GROUP ALL)[0].count ?? 0,
                    graphs: (SELECT count() FROM graph_index GROUP ALL)[0].count ?? 0,
                    nodes: (SELECT count() FROM graph_node GROUP ALL)[0].count ?? 0,
                    edges: (SELECT count() FROM graph_edge GROUP ALL)[0].count ?? 0,
                    communities: (SELECT count() FROM community GROUP ALL)[0].count ?? 0,
                    summaries: (SELECT count() FROM community_summary GROUP ALL)[0].count ?? 0
                }
            "#,
            )
            .await?
            .check()?
            .take(0)?;

        stats
            .into_iter()
            .next()
            .ok_or_else(|| DbError::QueryFailed("stats".into()))
    }
}
