//! Pipeline error types
//!
//! Unit-level failures (one chunk, one community) carry the id needed to
//! retry just that unit.

use graphrag_core::CommunityId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Rate limit exceeded on bucket '{bucket_id}' for cost {cost}")]
    RateLimitExceeded { bucket_id: String, cost: f64 },

    #[error("Extraction failed for chunk {chunk_id}: {reason}")]
    ExtractionFailed { chunk_id: String, reason: String },

    #[error("Description failed for {unit}: {reason}")]
    DescriptionFailed { unit: String, reason: String },

    #[error("Summarization failed for community {community}: {reason}")]
    SummarizationFailed { community: CommunityId, reason: String },

    #[error("Completion provider failed after {attempts} attempt(s): {message}")]
    ProviderError { attempts: u32, message: String },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Deadline exceeded during {operation}")]
    TimeoutExceeded { operation: String },

    #[error("Only {succeeded}/{total} chunks extracted for graph {graph_id}, below threshold")]
    PartialIndex {
        graph_id: String,
        succeeded: usize,
        total: usize,
        failures: Vec<UnitFailure>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] graphrag_db::DbError),

    #[error("Core error: {0}")]
    Core(#[from] graphrag_core::CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Failures confined to one chunk, element or community; siblings keep going
    pub fn is_isolated(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimitExceeded { .. }
                | PipelineError::ExtractionFailed { .. }
                | PipelineError::DescriptionFailed { .. }
                | PipelineError::SummarizationFailed { .. }
                | PipelineError::ProviderError { .. }
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>) -> Self {
        PipelineError::TimeoutExceeded {
            operation: operation.into(),
        }
    }
}

/// A failed unit of work reported next to partial success
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UnitFailure {
    /// Chunk id, element key or community id
    pub unit: String,
    pub error: String,
}

impl UnitFailure {
    pub fn new(unit: impl Into<String>, error: &PipelineError) -> Self {
        Self {
            unit: unit.into(),
            error: error.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_classes() {
        let extraction = PipelineError::ExtractionFailed {
            chunk_id: "d:0".into(),
            reason: "bad json".into(),
        };
        assert!(extraction.is_isolated());
        assert!(extraction.to_string().contains("d:0"));

        assert!(!PipelineError::CacheUnavailable("down".into()).is_isolated());
        assert!(!PipelineError::timeout("query").is_isolated());
    }

    #[test]
    fn test_summarization_error_names_community() {
        let err = PipelineError::SummarizationFailed {
            community: CommunityId::new(1, 3),
            reason: "empty".into(),
        };
        assert!(err.to_string().contains("L1C3"));
    }
}
