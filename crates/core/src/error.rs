//! Error types for the core domain

use thiserror::Error;

/// Core domain errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid chunk parameters: window {window_size}, overlap {overlap}")]
    InvalidChunkParams { window_size: usize, overlap: usize },

    #[error("Invalid bucket parameters: capacity {capacity}, refill rate {refill_rate}")]
    InvalidBucketParams { capacity: f64, refill_rate: f64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
