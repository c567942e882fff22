//! Cache keys and entries
//!
//! Keys render as `{namespace}/{stage}/{digest}`. The namespace scopes an
//! entry to the document or graph it was derived from, so one prefix
//! invalidation removes everything downstream of that document or graph.

use crate::hashing::hash_parts;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Document,
    Chunks,
    Extract,
    Graph,
    Description,
    Communities,
    Summary,
    MapAnswer,
    Answer,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Document => "document",
            Stage::Chunks => "chunks",
            Stage::Extract => "extract",
            Stage::Graph => "graph",
            Stage::Description => "description",
            Stage::Communities => "communities",
            Stage::Summary => "summary",
            Stage::MapAnswer => "map_answer",
            Stage::Answer => "answer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub stage: Stage,
    pub digest: String,
}

impl CacheKey {
    /// Key for `stage` over the hashed `inputs`
    pub fn derive<I, S>(namespace: impl Into<String>, stage: Stage, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stage_name = stage.as_str();
        let parts = std::iter::once(stage_name.to_string())
            .chain(inputs.into_iter().map(|s| s.as_ref().to_string()));
        Self {
            namespace: namespace.into(),
            stage,
            digest: hash_parts(parts),
        }
    }

    /// Namespace for entries derived from one document
    pub fn document_scope(document_id: &str) -> String {
        format!("doc:{}", document_id)
    }

    /// Namespace for entries derived from one graph
    pub fn graph_scope(graph_id: &str) -> String {
        format!("graph:{}", graph_id)
    }

    /// Prefix matching every entry in `namespace`
    pub fn namespace_prefix(namespace: &str) -> String {
        format!("{}/", namespace)
    }

    /// Prefix matching every `stage` entry in `namespace`
    pub fn stage_prefix(namespace: &str, stage: Stage) -> String {
        format!("{}/{}/", namespace, stage)
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.stage, self.digest)
    }
}

/// A stored stage output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Rendered [`CacheKey`]
    pub key: String,
    pub stage: Stage,
    /// Serialized JSON value
    pub value: String,
    pub created_at_ms: i64,
    pub ttl_secs: Option<u64>,
}

impl CacheEntry {
    pub fn new(key: &CacheKey, value: String, created_at_ms: i64, ttl_secs: Option<u64>) -> Self {
        Self {
            key: key.render(),
            stage: key.stage,
            value,
            created_at_ms,
            ttl_secs,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl_secs {
            Some(ttl) => now_ms >= self.created_at_ms.saturating_add((ttl as i64).saturating_mul(1000)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::derive("doc:1", Stage::Extract, ["chunk text", "v1"]);
        let b = CacheKey::derive("doc:1", Stage::Extract, ["chunk text", "v1"]);
        assert_eq!(a, b);
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn test_key_depends_on_stage_and_inputs() {
        let extract = CacheKey::derive("doc:1", Stage::Extract, ["x"]);
        let summary = CacheKey::derive("doc:1", Stage::Summary, ["x"]);
        let other = CacheKey::derive("doc:1", Stage::Extract, ["y"]);
        assert_ne!(extract.digest, summary.digest);
        assert_ne!(extract.digest, other.digest);
    }

    #[test]
    fn test_rendering_and_prefixes() {
        let scope = CacheKey::document_scope("abc");
        let key = CacheKey::derive(scope.clone(), Stage::Chunks, ["600", "100"]);
        let rendered = key.render();

        assert!(rendered.starts_with("doc:abc/chunks/"));
        assert!(rendered.starts_with(&CacheKey::namespace_prefix(&scope)));
        assert!(rendered.starts_with(&CacheKey::stage_prefix(&scope, Stage::Chunks)));
        assert!(!rendered.starts_with(&CacheKey::namespace_prefix("doc:ab")));
        assert_eq!(CacheKey::graph_scope("g"), "graph:g");
    }

    #[test]
    fn test_ttl_expiry() {
        let key = CacheKey::derive("n", Stage::Answer, ["q"]);
        let forever = CacheEntry::new(&key, "1".into(), 0, None);
        let short = CacheEntry::new(&key, "1".into(), 1_000, Some(2));

        assert!(!forever.is_expired(i64::MAX));
        assert!(!short.is_expired(2_999));
        assert!(short.is_expired(3_000));
    }
}
