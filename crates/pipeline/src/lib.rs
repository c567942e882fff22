//! GraphRAG indexing and query engine
//!
//! Indexing runs documents through chunking, element extraction, graph
//! construction, element description, community detection and community
//! summarization. Querying answers a question by map-reduce over the stored
//! community summaries.
//!
//! Every completion call passes through the shared token bucket
//! ([`RateLimiter`]) and the single-flight cache ([`CacheManager`]).

pub mod cache;
pub mod clock;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod describer;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod rate_limiter;
pub mod resolver;
pub mod structured;
pub mod summarizer;

pub use cache::CacheManager;
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{
    Completion, CompletionClient, CompletionError, CompletionRequest, HttpCompletionClient, RequestKind,
};
pub use config::{PipelineConfig, ProviderConfig, ProviderKind};
pub use coordinator::{IndexReport, InvalidationReport, Pipeline};
pub use describer::{DescribedElement, DescriptionBatch, ElementDescriber};
pub use error::{PipelineError, Result, UnitFailure};
pub use extractor::{ElementExtractor, ExtractionBatch, ExtractionPayload};
pub use gateway::LlmGateway;
pub use rate_limiter::{Admission, RateLimiter};
pub use resolver::{QueryResolver, NO_INFORMATION_ANSWER};
pub use structured::{StructuredOutput, Validate};
pub use summarizer::{CommunitySummarizer, SummaryBatch};
