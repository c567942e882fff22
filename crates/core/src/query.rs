//! Query and answer types

use crate::community::CommunityId;
use serde::{Deserialize, Serialize};

/// Which part of the corpus a query targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTarget {
    #[default]
    All,
    /// Only communities containing entities from these documents
    Documents(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default)]
    pub target: QueryTarget,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            target: QueryTarget::All,
        }
    }

    pub fn for_documents(mut self, mut documents: Vec<String>) -> Self {
        documents.sort();
        documents.dedup();
        self.target = QueryTarget::Documents(documents);
        self
    }

    /// Stable text form of the target, for cache keys
    pub fn target_fingerprint(&self) -> String {
        match &self.target {
            QueryTarget::All => "all".to_string(),
            QueryTarget::Documents(docs) => format!("docs:{}", docs.join(",")),
        }
    }
}

/// Partial answer from one community
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapResult {
    pub community: CommunityId,
    pub answer: String,
    /// Relevance on a 0-100 scale; 0 means nothing relevant
    pub score: u8,
}

/// Final synthesized answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Communities whose partial answers fed the synthesis, highest score first
    pub communities: Vec<CommunityId>,
}

impl Answer {
    pub fn cites(&self, community: CommunityId) -> bool {
        self.communities.contains(&community)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_fingerprint_is_order_insensitive() {
        let a = Query::new("q").for_documents(vec!["b".into(), "a".into(), "a".into()]);
        let b = Query::new("q").for_documents(vec!["a".into(), "b".into()]);
        assert_eq!(a.target_fingerprint(), b.target_fingerprint());
        assert_eq!(Query::new("q").target_fingerprint(), "all");
    }

    #[test]
    fn test_query_deserializes_without_target() {
        let query: Query = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert_eq!(query.target, QueryTarget::All);
    }
}
