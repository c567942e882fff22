//! Community summarization
//!
//! Communities are summarized level by level, finest first, so a coarse
//! community too large to render directly can be described through its
//! children's summaries instead.

use crate::cache::CacheManager;
use crate::completion::{CompletionRequest, RequestKind};
use crate::error::{PipelineError, Result, UnitFailure};
use crate::gateway::LlmGateway;
use crate::structured::{corrective_prompt, StructuredOutput, Validate};
use graphrag_core::hashing::content_hash;
use graphrag_core::{CacheKey, Community, CommunityHierarchy, CommunityId, CommunitySummary, Graph, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const SUMMARY_PROMPT_VERSION: &str = "summarize-v1";

const SUMMARY_SYSTEM: &str = "You write concise analytical reports about groups of related entities. Output MUST be a single JSON object. No markdown fences.";

fn summary_prompt(rendering: &str) -> String {
    format!(
        "Write a report about the community of entities described below.\n\nSchema:\n{{\"title\":string,\"summary\":string}}\n\nRules:\n- title names the community's main entities in a few words\n- summary explains who the entities are and how they are connected\n- Only use facts present in the description\n\nCommunity:\n{}",
        rendering
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SummaryPayload {
    title: String,
    summary: String,
}

impl Validate for SummaryPayload {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary is empty".to_string());
        }
        Ok(())
    }
}

/// Render a community's entities and internal relationships
pub fn render_members(graph: &Graph, community: &Community) -> String {
    let members: BTreeSet<_> = community.members.iter().cloned().collect();
    let mut out = String::from("Entities:\n");
    for key in &community.members {
        let Some(node) = graph.node(key) else {
            continue;
        };
        let _ = write!(out, "- {} ({})", node.name, node.entity_type);
        let description = match &node.summary {
            Some(summary) => summary.clone(),
            None => node.descriptions.iter().cloned().collect::<Vec<_>>().join("; "),
        };
        if !description.is_empty() {
            let _ = write!(out, ": {}", description);
        }
        out.push('\n');
    }

    let mut relationships = graph.edges_within(&members).peekable();
    if relationships.peek().is_some() {
        out.push_str("\nRelationships:\n");
        for edge in relationships {
            if let Some(summary) = &edge.summary {
                let _ = writeln!(out, "- {}", summary);
                continue;
            }
            for statement in &edge.descriptions {
                let _ = writeln!(out, "- {}", statement);
            }
        }
    }
    out
}

fn render_children(children: &[CommunitySummary]) -> String {
    let mut out = String::from("Sub-communities:\n");
    for child in children {
        let _ = writeln!(out, "- {}: {}", child.title, child.summary);
    }
    out
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

/// Outcome of summarizing a hierarchy
#[derive(Debug, Default)]
pub struct SummaryBatch {
    /// Summaries ordered by community id
    pub summaries: Vec<CommunitySummary>,
    pub failures: Vec<UnitFailure>,
}

#[derive(Clone)]
pub struct CommunitySummarizer {
    gateway: LlmGateway,
    cache: Arc<CacheManager>,
    max_tokens: u32,
    context_chars: usize,
    concurrency: usize,
}

impl CommunitySummarizer {
    pub fn new(
        gateway: LlmGateway,
        cache: Arc<CacheManager>,
        max_tokens: u32,
        context_chars: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            gateway,
            cache,
            max_tokens,
            context_chars: context_chars.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Text the model sees for `community`.
    ///
    /// Coarse communities whose member listing exceeds the context budget
    /// are described by their children's summaries when those exist.
    pub fn render(&self, graph: &Graph, community: &Community, children: &[CommunitySummary]) -> String {
        let members = render_members(graph, community);
        if members.chars().count() <= self.context_chars {
            return members;
        }
        if community.level() > 0 && !children.is_empty() {
            debug!(community = %community.id, "Rendering from child summaries");
            return truncate_chars(render_children(children), self.context_chars);
        }
        truncate_chars(members, self.context_chars)
    }

    /// Summarize one community
    #[instrument(skip_all, fields(community = %community.id))]
    pub async fn summarize(
        &self,
        graph_id: &str,
        graph: &Graph,
        community: &Community,
        children: &[CommunitySummary],
        deadline: Instant,
    ) -> Result<CommunitySummary> {
        let rendering = self.render(graph, community, children);
        let membership_hash = community.membership_hash();
        let key = CacheKey::derive(
            CacheKey::graph_scope(graph_id),
            Stage::Summary,
            [
                SUMMARY_PROMPT_VERSION,
                membership_hash.as_str(),
                content_hash(&rendering).as_str(),
            ],
        );
        let mut summary: CommunitySummary = self
            .cache
            .get_or_compute(&key, deadline, || {
                self.request_summary(community.id, membership_hash.clone(), &rendering, deadline)
            })
            .await?;
        // The key ignores the index, which shifts when other communities come or go
        summary.community = community.id;
        Ok(summary)
    }

    async fn request_summary(
        &self,
        community: CommunityId,
        membership_hash: String,
        rendering: &str,
        deadline: Instant,
    ) -> Result<CommunitySummary> {
        let prompt = summary_prompt(rendering);
        let request = CompletionRequest::new(RequestKind::Summarize, SUMMARY_SYSTEM, prompt.clone())
            .with_max_tokens(self.max_tokens)
            .json();

        let mut completion = self.gateway.complete(&request, deadline).await?;
        let output = match StructuredOutput::<SummaryPayload>::parse(&completion.text) {
            StructuredOutput::Malformed { raw, reason } => {
                warn!(%community, reason = %reason, "Malformed summary, re-prompting");
                let retry = CompletionRequest {
                    prompt: corrective_prompt(&prompt, &raw, &reason),
                    ..request
                };
                let second = self.gateway.complete(&retry, deadline).await?;
                completion.prompt_tokens += second.prompt_tokens;
                completion.completion_tokens += second.completion_tokens;
                StructuredOutput::parse(&second.text)
            }
            parsed => parsed,
        };

        match output {
            StructuredOutput::Parsed(payload) => Ok(CommunitySummary {
                community,
                title: payload.title.trim().to_string(),
                summary: payload.summary.trim().to_string(),
                membership_hash,
                prompt_tokens: completion.prompt_tokens,
                completion_tokens: completion.completion_tokens,
            }),
            StructuredOutput::Malformed { reason, .. } => {
                Err(PipelineError::SummarizationFailed { community, reason })
            }
        }
    }

    /// Summarize every community, finest level first.
    ///
    /// A failed community is reported and skipped; its parent is rendered
    /// without it.
    #[instrument(skip_all, fields(graph_id = %graph_id, levels = hierarchy.num_levels()))]
    pub async fn summarize_hierarchy(
        &self,
        graph_id: &str,
        graph: Arc<Graph>,
        hierarchy: &CommunityHierarchy,
        deadline: Instant,
    ) -> Result<SummaryBatch> {
        let mut batch = SummaryBatch::default();
        let mut done: HashMap<CommunityId, CommunitySummary> = HashMap::new();
        let permits = Arc::new(Semaphore::new(self.concurrency));

        for level in hierarchy.levels() {
            let mut tasks = JoinSet::new();
            for community in level {
                let children: Vec<CommunitySummary> = hierarchy
                    .children(community.id)
                    .into_iter()
                    .filter_map(|child| done.get(&child.id).cloned())
                    .collect();
                let summarizer = self.clone();
                let permits = permits.clone();
                let graph = graph.clone();
                let graph_id = graph_id.to_string();
                let community = community.clone();
                tasks.spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| PipelineError::timeout("summary permits closed"))?;
                    Ok::<_, PipelineError>(
                        summarizer
                            .summarize(&graph_id, &graph, &community, &children, deadline)
                            .await
                            .map_err(|e| (community.id, e)),
                    )
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined?? {
                    Ok(summary) => {
                        done.insert(summary.community, summary);
                    }
                    Err((id, e)) if e.is_isolated() => {
                        warn!(community = %id, error = %e, "Community summary failed");
                        batch.failures.push(UnitFailure::new(id.to_string(), &e));
                    }
                    Err((_, e)) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                }
            }
        }

        batch.summaries = done.into_values().collect();
        batch.summaries.sort_by_key(|s| s.community);
        batch.failures.sort_by(|a, b| a.unit.cmp(&b.unit));
        info!(
            summarized = batch.summaries.len(),
            failed = batch.failures.len(),
            "Summarization finished"
        );
        Ok(batch)
    }
}
