//! Pipeline coordinator
//!
//! Sequences chunking, extraction, graph construction, element description,
//! community detection and summarization for indexing, and exposes the query path. Every stage
//! boundary goes through the cache, so re-running an index over unchanged
//! documents costs no completion calls.

use crate::cache::CacheManager;
use crate::clock::{Clock, SystemClock};
use crate::completion::CompletionClient;
use crate::config::PipelineConfig;
use crate::describer::{DescriptionBatch, ElementDescriber, DESCRIBE_PROMPT_VERSION};
use crate::error::{PipelineError, Result, UnitFailure};
use crate::extractor::{ElementExtractor, EXTRACTION_PROMPT_VERSION};
use crate::gateway::LlmGateway;
use crate::rate_limiter::RateLimiter;
use crate::resolver::{QueryResolver, MAP_PROMPT_VERSION, REDUCE_PROMPT_VERSION};
use crate::summarizer::{CommunitySummarizer, SUMMARY_PROMPT_VERSION};
use graphrag_core::hashing::hash_parts;
use graphrag_core::{
    Answer, CacheKey, Chunk, Chunker, CommunityDetector, CommunityHierarchy, Document, Graph,
    GraphBuilder, Query, Stage,
};
use graphrag_db::{BucketStore, CacheStore, DbStats, GraphMeta, GraphStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Hex digits kept from the graph hash
const GRAPH_ID_LEN: usize = 16;

/// What an index run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub graph_id: String,
    pub document_ids: Vec<String>,
    pub chunks_total: usize,
    pub chunks_extracted: usize,
    pub node_count: usize,
    pub edge_count: usize,
    /// Nodes and edges carrying a merged description
    pub described: usize,
    pub community_count: usize,
    pub levels: usize,
    pub summaries: usize,
    /// Chunks, elements and communities that failed, with the reason
    pub failures: Vec<UnitFailure>,
}

/// What an invalidation removed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidationReport {
    pub cache_entries: u64,
    pub graphs: Vec<String>,
}

pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<CacheManager>,
    graphs: Arc<dyn GraphStore>,
    limiter: RateLimiter,
    chunker: Chunker,
    detector: CommunityDetector,
    extractor: ElementExtractor,
    describer: ElementDescriber,
    summarizer: CommunitySummarizer,
    resolver: QueryResolver,
}

impl Pipeline {
    /// Engine over one store that serves cache, graph and bucket records
    pub fn new<S>(config: PipelineConfig, store: Arc<S>, client: Arc<dyn CompletionClient>) -> Self
    where
        S: CacheStore + GraphStore + BucketStore + 'static,
    {
        Self::with_clock(config, store, client, Arc::new(SystemClock))
    }

    pub fn with_clock<S>(
        config: PipelineConfig,
        store: Arc<S>,
        client: Arc<dyn CompletionClient>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: CacheStore + GraphStore + BucketStore + 'static,
    {
        let cache = Arc::new(
            CacheManager::new(store.clone(), clock.clone())
                .with_ttl(config.cache_ttl_secs)
                .with_lease(config.lease),
        );
        let limiter = RateLimiter::new(store.clone(), clock.clone(), config.bucket);
        let gateway = LlmGateway::new(client, limiter.clone(), &config);
        let graphs: Arc<dyn GraphStore> = store;

        Self {
            chunker: Chunker::new(config.chunk),
            detector: CommunityDetector::with_config(config.detector.clone()),
            extractor: ElementExtractor::new(
                gateway.clone(),
                cache.clone(),
                config.max_tokens,
                config.index_concurrency,
            ),
            describer: ElementDescriber::new(
                gateway.clone(),
                cache.clone(),
                config.max_tokens,
                config.index_concurrency,
                config.describe_min_descriptions,
            ),
            summarizer: CommunitySummarizer::new(
                gateway.clone(),
                cache.clone(),
                config.max_tokens,
                config.summary_context_chars,
                config.index_concurrency,
            ),
            resolver: QueryResolver::new(
                gateway,
                cache.clone(),
                graphs.clone(),
                config.max_tokens,
                config.map_concurrency,
                config.min_relevance,
            )
            .with_reduce_budget(config.bucket.capacity.floor() as u64),
            config,
            clock,
            cache,
            graphs,
            limiter,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Graph id for a set of documents under the current parameters
    pub fn graph_id(&self, document_ids: &[String]) -> String {
        let mut ids = document_ids.to_vec();
        ids.sort();
        ids.dedup();
        let params = [
            "graph-v1".to_string(),
            self.config.chunk.window_size.to_string(),
            self.config.chunk.overlap.to_string(),
            EXTRACTION_PROMPT_VERSION.to_string(),
            self.config.detector.resolution.to_string(),
            self.config.detector.max_levels.to_string(),
            self.config.detector.min_community_size.to_string(),
            DESCRIBE_PROMPT_VERSION.to_string(),
            self.config.describe_min_descriptions.to_string(),
        ];
        let mut id = hash_parts(params.into_iter().chain(ids));
        id.truncate(GRAPH_ID_LEN);
        id
    }

    /// Index a single document
    pub async fn index(&self, document: Document, deadline: Instant) -> Result<IndexReport> {
        self.index_corpus(vec![document], deadline).await
    }

    /// Index documents into one merged graph
    #[instrument(skip_all, fields(documents = documents.len()))]
    pub async fn index_corpus(&self, documents: Vec<Document>, deadline: Instant) -> Result<IndexReport> {
        if documents.is_empty() {
            return Err(PipelineError::Config("Nothing to index: no documents given".into()));
        }
        let mut document_ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        document_ids.sort();
        document_ids.dedup();
        let graph_id = self.graph_id(&document_ids);
        info!(graph_id = %graph_id, "Indexing corpus");

        let mut chunks = Vec::new();
        for document in &documents {
            chunks.extend(self.chunk_document(document, deadline).await?);
        }
        let chunks_total = chunks.len();

        let batch = self.extractor.extract_all(chunks, deadline).await?;
        if batch.success_ratio() < self.config.min_extraction_success {
            return Err(PipelineError::PartialIndex {
                graph_id,
                succeeded: batch.succeeded(),
                total: batch.total,
                failures: batch.failures,
            });
        }
        let mut failures = batch.failures;

        let extraction_digest = hash_parts(
            batch
                .extractions
                .iter()
                .map(serde_json::to_string)
                .collect::<std::result::Result<Vec<_>, _>>()?,
        );
        let graph_key = CacheKey::derive(CacheKey::graph_scope(&graph_id), Stage::Graph, [extraction_digest]);
        let graph: Graph = self
            .cache
            .get_or_compute(&graph_key, deadline, || {
                let mut builder = GraphBuilder::new();
                for extraction in &batch.extractions {
                    builder.absorb(extraction);
                }
                std::future::ready(Ok(builder.finish()))
            })
            .await?;
        debug!(nodes = graph.node_count(), edges = graph.edge_count(), "Graph built");

        let DescriptionBatch {
            graph,
            described,
            failures: description_failures,
        } = self.describer.describe_graph(&graph_id, graph, deadline).await?;
        failures.extend(description_failures);
        self.graphs.save_graph(&graph_id, &graph).await?;

        let fingerprint = graph.fingerprint()?;
        let communities_key = CacheKey::derive(
            CacheKey::graph_scope(&graph_id),
            Stage::Communities,
            [
                fingerprint.clone(),
                self.config.detector.resolution.to_string(),
                self.config.detector.max_levels.to_string(),
                self.config.detector.min_community_size.to_string(),
            ],
        );
        let hierarchy: CommunityHierarchy = self
            .cache
            .get_or_compute(&communities_key, deadline, || {
                std::future::ready(Ok(self.detector.detect(&graph)))
            })
            .await?;
        self.graphs.save_communities(&graph_id, &hierarchy).await?;

        let graph = Arc::new(graph);
        let summaries = self
            .summarizer
            .summarize_hierarchy(&graph_id, graph.clone(), &hierarchy, deadline)
            .await?;
        self.graphs.save_summaries(&graph_id, &summaries.summaries).await?;
        failures.extend(summaries.failures);

        let meta = GraphMeta {
            graph_id: graph_id.clone(),
            document_ids: document_ids.clone(),
            fingerprint,
            node_count: graph.node_count() as u64,
            edge_count: graph.edge_count() as u64,
            community_count: hierarchy.communities().count() as u64,
            modularity: (0..hierarchy.num_levels() as u32)
                .filter_map(|level| hierarchy.modularity(level))
                .collect(),
            indexed_at_ms: self.clock.now_ms(),
        };
        self.graphs.save_meta(&meta).await?;

        // Answers computed against an earlier build of this graph are stale
        let stale = self
            .cache
            .invalidate(&CacheKey::stage_prefix(&CacheKey::graph_scope(&graph_id), Stage::Answer))
            .await?;
        if stale > 0 {
            debug!(stale, "Dropped cached answers");
        }

        let report = IndexReport {
            graph_id,
            document_ids,
            chunks_total,
            chunks_extracted: batch.extractions.len(),
            node_count: graph.node_count(),
            edge_count: graph.edge_count(),
            described,
            community_count: meta.community_count as usize,
            levels: hierarchy.num_levels(),
            summaries: summaries.summaries.len(),
            failures,
        };
        info!(
            graph_id = %report.graph_id,
            nodes = report.node_count,
            communities = report.community_count,
            failed_units = report.failures.len(),
            "Index complete"
        );
        Ok(report)
    }

    async fn chunk_document(&self, document: &Document, deadline: Instant) -> Result<Vec<Chunk>> {
        let scope = CacheKey::document_scope(&document.id);
        let document_key = CacheKey::derive(scope.clone(), Stage::Document, [document.id.as_str()]);
        let _: Document = self
            .cache
            .get_or_compute(&document_key, deadline, || std::future::ready(Ok(document.clone())))
            .await?;

        let params = self.chunker.params();
        let chunks_key = CacheKey::derive(
            scope,
            Stage::Chunks,
            [params.window_size.to_string(), params.overlap.to_string()],
        );
        self.cache
            .get_or_compute(&chunks_key, deadline, || std::future::ready(Ok(self.chunker.chunk(document))))
            .await
    }

    /// Answer `query` against an indexed graph
    #[instrument(skip(self, query, deadline), fields(query = %query.text))]
    pub async fn query(&self, graph_id: &str, query: &Query, deadline: Instant) -> Result<Answer> {
        let meta = self
            .graphs
            .load_meta(graph_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("graph {}", graph_id)))?;

        let level = self.config.query_level.to_string();
        let min_relevance = self.config.min_relevance.to_string();
        let key = CacheKey::derive(
            CacheKey::graph_scope(graph_id),
            Stage::Answer,
            [
                MAP_PROMPT_VERSION,
                REDUCE_PROMPT_VERSION,
                SUMMARY_PROMPT_VERSION,
                meta.fingerprint.as_str(),
                query.text.as_str(),
                query.target_fingerprint().as_str(),
                level.as_str(),
                min_relevance.as_str(),
            ],
        );
        self.cache
            .get_or_compute(&key, deadline, || {
                self.resolver
                    .answer(graph_id, self.config.query_level, meta.levels(), query, deadline)
            })
            .await
    }

    /// Drop everything cached for a document and every graph built from it
    #[instrument(skip(self))]
    pub async fn invalidate_document(&self, document_id: &str) -> Result<InvalidationReport> {
        let mut report = InvalidationReport {
            cache_entries: self
                .cache
                .invalidate(&CacheKey::namespace_prefix(&CacheKey::document_scope(document_id)))
                .await?,
            graphs: Vec::new(),
        };

        for meta in self.graphs.list_graphs().await? {
            if meta.document_ids.iter().any(|id| id == document_id) {
                let removed = self.invalidate_graph(&meta.graph_id).await?;
                report.cache_entries += removed.cache_entries;
                report.graphs.extend(removed.graphs);
            }
        }
        info!(
            entries = report.cache_entries,
            graphs = report.graphs.len(),
            "Document invalidated"
        );
        Ok(report)
    }

    /// Drop a graph's cache entries and stored records
    #[instrument(skip(self))]
    pub async fn invalidate_graph(&self, graph_id: &str) -> Result<InvalidationReport> {
        let cache_entries = self
            .cache
            .invalidate(&CacheKey::namespace_prefix(&CacheKey::graph_scope(graph_id)))
            .await?;
        let existed = self.graphs.load_meta(graph_id).await?.is_some();
        self.graphs.delete_graph(graph_id).await?;
        if !existed && cache_entries == 0 {
            warn!(graph_id, "Nothing stored for graph");
        }
        Ok(InvalidationReport {
            cache_entries,
            graphs: if existed { vec![graph_id.to_string()] } else { Vec::new() },
        })
    }

    pub async fn list_graphs(&self) -> Result<Vec<GraphMeta>> {
        Ok(self.graphs.list_graphs().await?)
    }

    pub async fn load_graph(&self, graph_id: &str) -> Result<Graph> {
        self.graphs
            .load_graph(graph_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("graph {}", graph_id)))
    }

    pub async fn load_communities(&self, graph_id: &str) -> Result<CommunityHierarchy> {
        Ok(self.graphs.load_communities(graph_id).await?)
    }

    pub async fn stats(&self) -> Result<DbStats> {
        Ok(self.graphs.stats().await?)
    }
}
