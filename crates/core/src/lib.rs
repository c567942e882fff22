//! Core domain types for the GraphRAG pipeline
//!
//! This crate defines the data structures that flow between pipeline stages
//! (documents, chunks, extracted elements, the merged graph, the community
//! hierarchy, summaries and answers) together with the pure stages that need
//! no I/O: chunking, graph construction and community detection.

pub mod bucket;
pub mod cache;
pub mod chunker;
pub mod community;
pub mod document;
pub mod element;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod leiden;
pub mod query;

pub use bucket::{BucketParams, BucketState, Debit};
pub use cache::{CacheEntry, CacheKey, Stage};
pub use chunker::{ChunkParams, Chunker};
pub use community::{Community, CommunityHierarchy, CommunityId, CommunitySummary};
pub use document::{Chunk, Document};
pub use element::{
    ChunkExtraction, Element, EntityElement, EntityKey, EntityRef, RelationshipElement, UNKNOWN_ENTITY_TYPE,
};
pub use error::{CoreError, Result};
pub use graph::{EdgeKey, EdgeRecord, Graph, GraphBuilder, NodeRecord};
pub use leiden::{CommunityDetector, DetectorConfig};
pub use query::{Answer, MapResult, Query, QueryTarget};
