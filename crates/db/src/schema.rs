//! SurrealDB schema definitions

use crate::{DbConnection, DbError, Result};
use tracing::info;

/// Initialize the database schema
pub async fn initialize_schema(db: &DbConnection) -> Result<()> {
    info!("Initializing database schema...");

    db.query(SCHEMA_DEFINITION)
        .await?
        .check()
        .map_err(|e| DbError::SchemaInit(e.to_string()))?;

    info!("Schema initialized successfully");
    Ok(())
}

const SCHEMA_DEFINITION: &str = r#"
-- ============================================
-- CACHE
-- ============================================

-- Stage outputs, keyed by rendered cache key
DEFINE TABLE IF NOT EXISTS cache_entry SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS key ON cache_entry TYPE string;
DEFINE FIELD IF NOT EXISTS stage ON cache_entry TYPE string;
DEFINE FIELD IF NOT EXISTS value ON cache_entry TYPE string;
DEFINE FIELD IF NOT EXISTS created_at_ms ON cache_entry TYPE int;
DEFINE FIELD IF NOT EXISTS ttl_secs ON cache_entry TYPE option<int>;

-- Per-key computation leases
DEFINE TABLE IF NOT EXISTS cache_claim SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS key ON cache_claim TYPE string;
DEFINE FIELD IF NOT EXISTS owner ON cache_claim TYPE string;
DEFINE FIELD IF NOT EXISTS expires_at_ms ON cache_claim TYPE int;
DEFINE FIELD IF NOT EXISTS version ON cache_claim TYPE int;

-- ============================================
-- RATE LIMITING
-- ============================================

DEFINE TABLE IF NOT EXISTS rate_bucket SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS bucket_id ON rate_bucket TYPE string;
DEFINE FIELD IF NOT EXISTS tokens ON rate_bucket TYPE number;
DEFINE FIELD IF NOT EXISTS capacity ON rate_bucket TYPE number;
DEFINE FIELD IF NOT EXISTS refill_rate ON rate_bucket TYPE number;
DEFINE FIELD IF NOT EXISTS last_refill_ms ON rate_bucket TYPE int;
DEFINE FIELD IF NOT EXISTS version ON rate_bucket TYPE int;

-- ============================================
-- GRAPH
-- ============================================

DEFINE TABLE IF NOT EXISTS graph_index SCHEMALESS;

DEFINE TABLE IF NOT EXISTS graph_node SCHEMALESS;

DEFINE TABLE IF NOT EXISTS graph_edge TYPE RELATION IN graph_node OUT graph_node SCHEMALESS;

-- ============================================
-- COMMUNITIES
-- ============================================

DEFINE TABLE IF NOT EXISTS community SCHEMALESS;

DEFINE TABLE IF NOT EXISTS community_summary SCHEMALESS;

-- ============================================
-- INDEXES
-- ============================================

DEFINE INDEX IF NOT EXISTS idx_cache_key ON cache_entry FIELDS key UNIQUE;
DEFINE INDEX IF NOT EXISTS idx_cache_stage ON cache_entry FIELDS stage;
DEFINE INDEX IF NOT EXISTS idx_node_graph ON graph_node FIELDS graph_id;
DEFINE INDEX IF NOT EXISTS idx_edge_graph ON graph_edge FIELDS graph_id;
DEFINE INDEX IF NOT EXISTS idx_community_level ON community FIELDS graph_id, level;
DEFINE INDEX IF NOT EXISTS idx_summary_level ON community_summary FIELDS graph_id, level;
"#;

#[cfg(test)]
mod tests {
    use crate::init_memory;

    #[tokio::test]
    async fn test_schema_initialization() {
        let db = init_memory().await.expect("Failed to init db");

        let entries: Vec<serde_json::Value> = db.select("cache_entry").await.unwrap();
        assert!(entries.is_empty());

        let nodes: Vec<serde_json::Value> = db.select("graph_node").await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_schema_is_reentrant() {
        let db = init_memory().await.unwrap();
        super::initialize_schema(&db).await.unwrap();
    }
}
