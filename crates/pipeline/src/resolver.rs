//! Map-reduce query answering over community summaries
//!
//! Map asks every candidate community the question concurrently; the fan-out
//! is bounded by a semaphore and, underneath, by the shared token bucket.
//! Reduce orders the partial answers deterministically before the final
//! synthesis call, so a fixed cache state always yields the same answer.

use crate::cache::CacheManager;
use crate::completion::{CompletionRequest, RequestKind};
use crate::error::{PipelineError, Result};
use crate::gateway::LlmGateway;
use crate::structured::{corrective_prompt, StructuredOutput, Validate};
use graphrag_core::hashing::content_hash;
use graphrag_core::{Answer, CacheKey, CommunitySummary, MapResult, Query, QueryTarget, Stage};
use graphrag_db::GraphStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const MAP_PROMPT_VERSION: &str = "map-v1";
pub const REDUCE_PROMPT_VERSION: &str = "reduce-v1";

/// Returned without a reduce call when no community had anything relevant
pub const NO_INFORMATION_ANSWER: &str =
    "I could not find information relevant to this question in the indexed documents.";

const MAP_SYSTEM: &str = "You answer questions using only the community report you are given. Output MUST be a single JSON object. No markdown fences.";

const REDUCE_SYSTEM: &str = "You combine partial answers from several analysts into one coherent answer. Use only the partial answers given. Cite the community ids you relied on in square brackets.";

fn map_prompt(summary: &CommunitySummary, question: &str) -> String {
    format!(
        "Community report [{}]:\n{}\n\nQuestion: {}\n\nSchema:\n{{\"answer\":string,\"score\":integer}}\n\nRules:\n- answer the question using only the report\n- score is how relevant the report is to the question, from 0 to 100\n- if the report has no relevant information, answer \"no relevant information\" with score 0",
        summary.community,
        summary.render(),
        question
    )
}

fn reduce_prompt(question: &str, ranked: &[MapResult]) -> String {
    let mut out = String::from("Partial answers, most relevant first:\n\n");
    for result in ranked {
        let _ = writeln!(
            out,
            "[{}] (relevance {})\n{}\n",
            result.community, result.score, result.answer
        );
    }
    let _ = write!(out, "Question: {}\n\nWrite the final answer.", question);
    out
}

/// Reduce request over the longest prefix of `ranked` costing at most `budget`.
///
/// When even the best answer alone does not fit, it is cut short. Returns
/// the request and how many results it carries, or `None` when the question
/// alone exceeds the budget.
fn fit_reduce_request(
    question: &str,
    ranked: &[MapResult],
    max_tokens: u32,
    budget: u64,
) -> Option<(CompletionRequest, usize)> {
    let build = |results: &[MapResult]| {
        CompletionRequest::new(RequestKind::Reduce, REDUCE_SYSTEM, reduce_prompt(question, results))
            .with_max_tokens(max_tokens)
    };
    let first = ranked.first()?;

    let mut fitted = None;
    for used in 1..=ranked.len() {
        let request = build(&ranked[..used]);
        if request.estimated_cost() > budget {
            break;
        }
        fitted = Some((request, used));
    }
    if fitted.is_some() {
        return fitted;
    }

    let bare = MapResult {
        answer: String::new(),
        ..first.clone()
    };
    let room = budget.checked_sub(build(std::slice::from_ref(&bare)).estimated_cost())?;
    let cut = MapResult {
        answer: first.answer.chars().take((room as usize).saturating_mul(4)).collect(),
        ..bare
    };
    let request = build(std::slice::from_ref(&cut));
    (request.estimated_cost() <= budget).then_some((request, 1))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MapPayload {
    answer: String,
    score: u8,
}

impl Validate for MapPayload {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.score > 100 {
            return Err(format!("score {} is above 100", self.score));
        }
        Ok(())
    }
}

/// Drop results scoring 0 or below `min_relevance`; best first, ties by community id
pub fn rank(mut results: Vec<MapResult>, min_relevance: u8) -> Vec<MapResult> {
    results.retain(|r| r.score >= min_relevance && r.score > 0);
    results.sort_by(|a, b| b.score.cmp(&a.score).then(a.community.cmp(&b.community)));
    results
}

#[derive(Clone)]
pub struct QueryResolver {
    gateway: LlmGateway,
    cache: Arc<CacheManager>,
    store: Arc<dyn GraphStore>,
    max_tokens: u32,
    concurrency: usize,
    min_relevance: u8,
    /// Largest reduce request the bucket can ever admit
    reduce_budget: u64,
}

impl QueryResolver {
    pub fn new(
        gateway: LlmGateway,
        cache: Arc<CacheManager>,
        store: Arc<dyn GraphStore>,
        max_tokens: u32,
        concurrency: usize,
        min_relevance: u8,
    ) -> Self {
        Self {
            gateway,
            cache,
            store,
            max_tokens,
            concurrency: concurrency.max(1),
            min_relevance,
            reduce_budget: u64::MAX,
        }
    }

    /// Cap the reduce prompt's estimated cost, normally at the bucket capacity
    pub fn with_reduce_budget(mut self, budget: u64) -> Self {
        self.reduce_budget = budget;
        self
    }

    /// Summaries to ask at `level`, limited to the query's documents.
    ///
    /// A level beyond the hierarchy falls back to the coarsest one.
    #[instrument(skip(self, query))]
    pub async fn candidates(
        &self,
        graph_id: &str,
        level: u32,
        num_levels: usize,
        query: &Query,
    ) -> Result<Vec<CommunitySummary>> {
        if num_levels == 0 {
            return Ok(Vec::new());
        }
        let level = level.min(num_levels as u32 - 1);
        let mut summaries = self.store.load_summaries(graph_id, Some(level)).await?;

        if let QueryTarget::Documents(documents) = &query.target {
            let allowed: BTreeSet<_> = self
                .store
                .load_level(graph_id, level)
                .await?
                .into_iter()
                .filter(|c| c.touches_any(documents))
                .map(|c| c.id)
                .collect();
            summaries.retain(|s| allowed.contains(&s.community));
        }
        summaries.sort_by_key(|s| s.community);
        debug!(level, candidates = summaries.len(), "Selected candidate communities");
        Ok(summaries)
    }

    /// Ask one community.
    ///
    /// Output still malformed after one corrective retry counts as
    /// "nothing relevant" rather than an error.
    async fn map_one(&self, graph_id: &str, query: &Query, summary: &CommunitySummary, deadline: Instant) -> Result<MapResult> {
        let rendered = summary.render();
        let key = CacheKey::derive(
            CacheKey::graph_scope(graph_id),
            Stage::MapAnswer,
            [
                MAP_PROMPT_VERSION,
                query.text.as_str(),
                summary.membership_hash.as_str(),
                content_hash(&rendered).as_str(),
            ],
        );
        let payload: MapPayload = self
            .cache
            .get_or_compute(&key, deadline, || self.request_map(query, summary, deadline))
            .await?;
        Ok(MapResult {
            community: summary.community,
            answer: payload.answer,
            score: payload.score,
        })
    }

    async fn request_map(&self, query: &Query, summary: &CommunitySummary, deadline: Instant) -> Result<MapPayload> {
        let prompt = map_prompt(summary, &query.text);
        let request = CompletionRequest::new(RequestKind::Map, MAP_SYSTEM, prompt.clone())
            .with_max_tokens(self.max_tokens)
            .json();

        let completion = self.gateway.complete(&request, deadline).await?;
        let (raw, reason) = match StructuredOutput::<MapPayload>::parse(&completion.text) {
            StructuredOutput::Parsed(payload) => return Ok(payload),
            StructuredOutput::Malformed { raw, reason } => (raw, reason),
        };

        let retry = CompletionRequest {
            prompt: corrective_prompt(&prompt, &raw, &reason),
            ..request
        };
        let completion = self.gateway.complete(&retry, deadline).await?;
        match StructuredOutput::<MapPayload>::parse(&completion.text) {
            StructuredOutput::Parsed(payload) => Ok(payload),
            StructuredOutput::Malformed { reason, .. } => {
                warn!(community = %summary.community, reason = %reason, "Unusable map answer, scoring 0");
                Ok(MapPayload {
                    answer: String::new(),
                    score: 0,
                })
            }
        }
    }

    /// Map phase over `summaries`, joined before returning.
    ///
    /// Single-community failures are skipped unless every community failed.
    #[instrument(skip_all, fields(graph_id = %graph_id, candidates = summaries.len()))]
    pub async fn map(
        &self,
        graph_id: &str,
        query: &Query,
        summaries: Vec<CommunitySummary>,
        deadline: Instant,
    ) -> Result<Vec<MapResult>> {
        let total = summaries.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for summary in summaries {
            let resolver = self.clone();
            let permits = permits.clone();
            let graph_id = graph_id.to_string();
            let query = query.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::timeout("map permits closed"))?;
                resolver.map_one(&graph_id, &query, &summary, deadline).await
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut first_failure = None;
        let joined = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                match joined? {
                    Ok(result) => results.push(result),
                    Err(e) if e.is_isolated() => {
                        warn!(error = %e, "Map call failed");
                        first_failure.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok::<(), PipelineError>(())
        })
        .await;

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(_) => {
                tasks.abort_all();
                return Err(PipelineError::timeout("map phase"));
            }
        }

        if results.is_empty() {
            if let Some(e) = first_failure {
                return Err(e);
            }
        }
        results.sort_by_key(|r| r.community);
        Ok(results)
    }

    /// Reduce phase: synthesize ranked partial answers.
    ///
    /// Only as many answers as fit the reduce budget are sent, best first;
    /// the answer cites exactly those.
    #[instrument(skip_all, fields(results = results.len()))]
    pub async fn reduce(&self, query: &Query, results: Vec<MapResult>, deadline: Instant) -> Result<Answer> {
        let ranked = rank(results, self.min_relevance);
        if ranked.is_empty() {
            info!("No relevant community, skipping reduce");
            return Ok(Answer {
                text: NO_INFORMATION_ANSWER.to_string(),
                communities: Vec::new(),
            });
        }

        let Some((request, used)) =
            fit_reduce_request(&query.text, &ranked, self.max_tokens, self.reduce_budget)
        else {
            return Err(PipelineError::Config(format!(
                "question is too long for a reduce budget of {} tokens",
                self.reduce_budget
            )));
        };
        if used < ranked.len() {
            warn!(
                used,
                dropped = ranked.len() - used,
                budget = self.reduce_budget,
                "Reduce input trimmed to fit the bucket"
            );
        }

        let completion = self.gateway.complete(&request, deadline).await?;
        let text = completion.text.trim();
        if text.is_empty() {
            return Err(PipelineError::ProviderError {
                attempts: 1,
                message: "empty final answer".to_string(),
            });
        }

        Ok(Answer {
            text: text.to_string(),
            communities: ranked[..used].iter().map(|r| r.community).collect(),
        })
    }

    /// Full map-reduce against `graph_id`
    #[instrument(skip(self, query, deadline), fields(query = %query.text))]
    pub async fn answer(
        &self,
        graph_id: &str,
        level: u32,
        num_levels: usize,
        query: &Query,
        deadline: Instant,
    ) -> Result<Answer> {
        let summaries = self.candidates(graph_id, level, num_levels, query).await?;
        let results = self.map(graph_id, query, summaries, deadline).await?;
        self.reduce(query, results, deadline).await
    }
}
