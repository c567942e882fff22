//! Element extraction from chunks
//!
//! Each chunk is one cached, rate-limited completion call. The cached value
//! is the validated payload, so identical chunk text inside one document is
//! only ever sent once.

use crate::cache::CacheManager;
use crate::completion::{CompletionRequest, RequestKind};
use crate::error::{PipelineError, Result, UnitFailure};
use crate::gateway::LlmGateway;
use crate::structured::{corrective_prompt, StructuredOutput, Validate};
use graphrag_core::element::canonicalize;
use graphrag_core::{
    CacheKey, Chunk, ChunkExtraction, Element, EntityElement, EntityRef, RelationshipElement, Stage,
    UNKNOWN_ENTITY_TYPE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Bumped whenever the extraction prompt changes, so old cache entries miss
pub const EXTRACTION_PROMPT_VERSION: &str = "extract-v1";

const EXTRACTION_SYSTEM: &str = "You are a strict JSON generator. Output MUST be a single JSON object matching the provided schema. No prose, no markdown.";

fn extraction_prompt(text: &str) -> String {
    format!(
        "Extract the named entities and the relationships between them from the text.\n\nSchema:\n{{\"entities\":[{{\"name\":string,\"type\":string,\"description\":string}}],\"relationships\":[{{\"source\":string,\"target\":string,\"description\":string,\"weight\":number}}]}}\n\nRules:\n- Relationship source and target must be entity names from the entities list\n- description is one short sentence\n- weight is the strength of the relationship from 1 to 10\n- If nothing is found, return empty arrays\n\nText:\n{}",
        text
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub name: String,
    #[serde(rename = "type", alias = "entity_type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// Schema of an extraction reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPayload {
    pub entities: Vec<EntityPayload>,
    #[serde(default)]
    pub relationships: Vec<RelationshipPayload>,
}

impl Validate for ExtractionPayload {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(i) = self.entities.iter().position(|e| e.name.trim().is_empty()) {
            return Err(format!("entity {} has an empty name", i));
        }
        for (i, rel) in self.relationships.iter().enumerate() {
            if rel.source.trim().is_empty() || rel.target.trim().is_empty() {
                return Err(format!("relationship {} has an empty endpoint", i));
            }
            if !rel.weight.is_finite() {
                return Err(format!("relationship {} has a non-numeric weight", i));
            }
        }
        Ok(())
    }
}

impl ExtractionPayload {
    /// Tag the payload with its chunk, resolving relationship endpoint types.
    /// Endpoints this payload never declares stay untyped until the graph
    /// resolves them.
    pub fn into_extraction(self, chunk_id: &str) -> ChunkExtraction {
        let mut types: HashMap<String, String> = HashMap::new();
        for entity in &self.entities {
            types
                .entry(canonicalize(&entity.name))
                .or_insert_with(|| entity.entity_type.clone());
        }
        let endpoint = |name: &str| {
            let entity_type = types
                .get(&canonicalize(name))
                .cloned()
                .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string());
            EntityRef::new(name, entity_type)
        };

        let mut elements = Vec::with_capacity(self.entities.len() + self.relationships.len());
        for rel in &self.relationships {
            elements.push(Element::Relationship(RelationshipElement {
                source: endpoint(&rel.source),
                target: endpoint(&rel.target),
                description: rel.description.clone(),
                weight: rel.weight,
                chunk_id: chunk_id.to_string(),
            }));
        }
        for entity in self.entities {
            elements.push(Element::Entity(EntityElement {
                name: entity.name,
                entity_type: entity.entity_type,
                description: entity.description,
                chunk_id: chunk_id.to_string(),
            }));
        }
        ChunkExtraction {
            chunk_id: chunk_id.to_string(),
            elements,
        }
    }
}

/// Outcome of extracting a batch of chunks
#[derive(Debug, Default)]
pub struct ExtractionBatch {
    /// Successful extractions ordered by chunk id
    pub extractions: Vec<ChunkExtraction>,
    pub failures: Vec<UnitFailure>,
    pub total: usize,
}

impl ExtractionBatch {
    pub fn succeeded(&self) -> usize {
        self.extractions.len()
    }

    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.succeeded() as f64 / self.total as f64
        }
    }
}

#[derive(Clone)]
pub struct ElementExtractor {
    gateway: LlmGateway,
    cache: Arc<CacheManager>,
    max_tokens: u32,
    concurrency: usize,
}

impl ElementExtractor {
    pub fn new(gateway: LlmGateway, cache: Arc<CacheManager>, max_tokens: u32, concurrency: usize) -> Self {
        Self {
            gateway,
            cache,
            max_tokens,
            concurrency: concurrency.max(1),
        }
    }

    pub fn cache_key(chunk: &Chunk) -> CacheKey {
        CacheKey::derive(
            CacheKey::document_scope(&chunk.document_id),
            Stage::Extract,
            [EXTRACTION_PROMPT_VERSION, chunk.text.as_str()],
        )
    }

    /// Extract one chunk's elements
    #[instrument(skip(self, chunk, deadline), fields(chunk_id = %chunk.id()))]
    pub async fn extract(&self, chunk: &Chunk, deadline: Instant) -> Result<ChunkExtraction> {
        let chunk_id = chunk.id();
        let payload: ExtractionPayload = self
            .cache
            .get_or_compute(&Self::cache_key(chunk), deadline, || {
                self.request_payload(&chunk_id, &chunk.text, deadline)
            })
            .await?;
        debug!(
            entities = payload.entities.len(),
            relationships = payload.relationships.len(),
            "Chunk extracted"
        );
        Ok(payload.into_extraction(&chunk_id))
    }

    async fn request_payload(&self, chunk_id: &str, text: &str, deadline: Instant) -> Result<ExtractionPayload> {
        let prompt = extraction_prompt(text);
        let request = CompletionRequest::new(RequestKind::Extract, EXTRACTION_SYSTEM, prompt.clone())
            .with_max_tokens(self.max_tokens)
            .json();

        let completion = self.gateway.complete(&request, deadline).await?;
        let (raw, reason) = match StructuredOutput::<ExtractionPayload>::parse(&completion.text) {
            StructuredOutput::Parsed(payload) => return Ok(payload),
            StructuredOutput::Malformed { raw, reason } => (raw, reason),
        };

        warn!(chunk_id, reason = %reason, "Malformed extraction, re-prompting");
        let retry = CompletionRequest {
            prompt: corrective_prompt(&prompt, &raw, &reason),
            ..request
        };
        let completion = self.gateway.complete(&retry, deadline).await?;
        match StructuredOutput::<ExtractionPayload>::parse(&completion.text) {
            StructuredOutput::Parsed(payload) => Ok(payload),
            StructuredOutput::Malformed { reason, .. } => Err(PipelineError::ExtractionFailed {
                chunk_id: chunk_id.to_string(),
                reason,
            }),
        }
    }

    /// Extract every chunk with bounded concurrency.
    ///
    /// Unit failures are collected; anything else (deadline, store outage)
    /// aborts the remaining work.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn extract_all(&self, chunks: Vec<Chunk>, deadline: Instant) -> Result<ExtractionBatch> {
        let total = chunks.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for chunk in chunks {
            let extractor = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let chunk_id = chunk.id();
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::timeout("extraction permits closed"))?;
                Ok::<_, PipelineError>(
                    extractor
                        .extract(&chunk, deadline)
                        .await
                        .map_err(|e| (chunk_id, e)),
                )
            });
        }

        let mut batch = ExtractionBatch {
            total,
            ..ExtractionBatch::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined?? {
                Ok(extraction) => batch.extractions.push(extraction),
                Err((chunk_id, e)) if e.is_isolated() => {
                    warn!(chunk_id, error = %e, "Chunk extraction failed");
                    batch.failures.push(UnitFailure::new(chunk_id, &e));
                }
                Err((_, e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        batch.extractions.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        batch.failures.sort_by(|a, b| a.unit.cmp(&b.unit));
        info!(
            succeeded = batch.succeeded(),
            failed = batch.failures.len(),
            total,
            "Extraction finished"
        );
        Ok(batch)
    }
}
