//! Element description summarization
//!
//! Entities and relationships seen in several chunks collect several
//! descriptions. Those with enough of them get one merged description from
//! the model, cached per element and description set, before the graph is
//! partitioned and summarized.

use crate::cache::CacheManager;
use crate::completion::{CompletionRequest, RequestKind};
use crate::error::{PipelineError, Result, UnitFailure};
use crate::gateway::LlmGateway;
use crate::structured::{corrective_prompt, StructuredOutput, Validate};
use graphrag_core::{CacheKey, EdgeKey, EntityKey, Graph, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const DESCRIBE_PROMPT_VERSION: &str = "describe-v1";

const DESCRIBE_SYSTEM: &str = "You merge several descriptions of the same entity or relationship into one. Output MUST be a single JSON object. No markdown fences.";

fn describe_prompt(subject: &str, descriptions: &[String]) -> String {
    let listed: Vec<String> = descriptions.iter().map(|d| format!("- {}", d)).collect();
    format!(
        "Combine the descriptions below into one comprehensive description of {}.\n\nSchema:\n{{\"description\":string}}\n\nRules:\n- Keep every fact that appears in the descriptions\n- Resolve contradictions in favour of the more specific statement\n- Write in the third person, at most a short paragraph\n\nDescriptions:\n{}",
        subject,
        listed.join("\n")
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DescriptionPayload {
    description: String,
}

impl Validate for DescriptionPayload {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("description is empty".to_string());
        }
        Ok(())
    }
}

/// A graph element whose descriptions are merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescribedElement {
    Node(EntityKey),
    Edge(EdgeKey),
}

impl DescribedElement {
    pub fn as_str(&self) -> &str {
        match self {
            DescribedElement::Node(key) => key.as_str(),
            DescribedElement::Edge(key) => key.as_str(),
        }
    }
}

impl fmt::Display for DescribedElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct DescriptionTask {
    element: DescribedElement,
    /// How the prompt refers to the element
    subject: String,
    descriptions: Vec<String>,
}

/// Elements carrying at least `min_descriptions` distinct descriptions
fn description_tasks(graph: &Graph, min_descriptions: usize) -> Vec<DescriptionTask> {
    if min_descriptions == 0 {
        return Vec::new();
    }
    let name_of = |key: &EntityKey| {
        graph
            .node(key)
            .map(|node| node.name.clone())
            .unwrap_or_else(|| key.name_part().to_string())
    };

    let nodes = graph
        .nodes()
        .filter(|node| node.descriptions.len() >= min_descriptions)
        .map(|node| DescriptionTask {
            element: DescribedElement::Node(node.key.clone()),
            subject: format!("{} ({})", node.name, node.entity_type),
            descriptions: node.descriptions.iter().cloned().collect(),
        });
    let edges = graph
        .edges()
        .filter(|edge| edge.descriptions.len() >= min_descriptions)
        .map(|edge| DescriptionTask {
            element: DescribedElement::Edge(edge.key.clone()),
            subject: format!(
                "the relationship between {} and {}",
                name_of(&edge.source),
                name_of(&edge.target)
            ),
            descriptions: edge.descriptions.iter().cloned().collect(),
        });
    nodes.chain(edges).collect()
}

/// Outcome of describing a graph
#[derive(Debug)]
pub struct DescriptionBatch {
    /// The input graph with merged descriptions attached
    pub graph: Graph,
    pub described: usize,
    /// Elements that kept their raw descriptions
    pub failures: Vec<UnitFailure>,
}

#[derive(Clone)]
pub struct ElementDescriber {
    gateway: LlmGateway,
    cache: Arc<CacheManager>,
    max_tokens: u32,
    concurrency: usize,
    min_descriptions: usize,
}

impl ElementDescriber {
    pub fn new(
        gateway: LlmGateway,
        cache: Arc<CacheManager>,
        max_tokens: u32,
        concurrency: usize,
        min_descriptions: usize,
    ) -> Self {
        Self {
            gateway,
            cache,
            max_tokens,
            concurrency: concurrency.max(1),
            min_descriptions,
        }
    }

    /// Merge one element's descriptions
    #[instrument(skip_all, fields(element = %task.element))]
    async fn describe(&self, graph_id: &str, task: &DescriptionTask, deadline: Instant) -> Result<String> {
        let key = CacheKey::derive(
            CacheKey::graph_scope(graph_id),
            Stage::Description,
            [DESCRIBE_PROMPT_VERSION, task.element.as_str()]
                .into_iter()
                .chain(task.descriptions.iter().map(String::as_str)),
        );
        let payload: DescriptionPayload = self
            .cache
            .get_or_compute(&key, deadline, || self.request_description(task, deadline))
            .await?;
        Ok(payload.description)
    }

    async fn request_description(&self, task: &DescriptionTask, deadline: Instant) -> Result<DescriptionPayload> {
        let prompt = describe_prompt(&task.subject, &task.descriptions);
        let request = CompletionRequest::new(RequestKind::Describe, DESCRIBE_SYSTEM, prompt.clone())
            .with_max_tokens(self.max_tokens)
            .json();

        let completion = self.gateway.complete(&request, deadline).await?;
        let (raw, reason) = match StructuredOutput::<DescriptionPayload>::parse(&completion.text) {
            StructuredOutput::Parsed(payload) => return Ok(trimmed(payload)),
            StructuredOutput::Malformed { raw, reason } => (raw, reason),
        };

        warn!(element = %task.element, reason = %reason, "Malformed description, re-prompting");
        let retry = CompletionRequest {
            prompt: corrective_prompt(&prompt, &raw, &reason),
            ..request
        };
        let completion = self.gateway.complete(&retry, deadline).await?;
        match StructuredOutput::<DescriptionPayload>::parse(&completion.text) {
            StructuredOutput::Parsed(payload) => Ok(trimmed(payload)),
            StructuredOutput::Malformed { reason, .. } => Err(PipelineError::DescriptionFailed {
                unit: task.element.to_string(),
                reason,
            }),
        }
    }

    /// Attach merged descriptions to every element with enough evidence.
    ///
    /// An element whose call fails keeps its raw descriptions and is
    /// reported; anything else (deadline, store outage) aborts.
    #[instrument(skip(self, graph, deadline))]
    pub async fn describe_graph(&self, graph_id: &str, mut graph: Graph, deadline: Instant) -> Result<DescriptionBatch> {
        let pending = description_tasks(&graph, self.min_descriptions);
        if pending.is_empty() {
            return Ok(DescriptionBatch {
                graph,
                described: 0,
                failures: Vec::new(),
            });
        }
        debug!(elements = pending.len(), "Describing elements");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for task in pending {
            let describer = self.clone();
            let permits = permits.clone();
            let graph_id = graph_id.to_string();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::timeout("description permits closed"))?;
                let outcome = describer.describe(&graph_id, &task, deadline).await;
                Ok::<_, PipelineError>((task.element, outcome))
            });
        }

        let mut described = 0;
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (element, outcome) = joined??;
            match outcome {
                Ok(description) => {
                    let attached = match &element {
                        DescribedElement::Node(key) => graph.set_node_summary(key, description),
                        DescribedElement::Edge(key) => graph.set_edge_summary(key, description),
                    };
                    if attached {
                        described += 1;
                    }
                }
                Err(e) if e.is_isolated() => {
                    warn!(%element, error = %e, "Element description failed");
                    failures.push(UnitFailure::new(element.to_string(), &e));
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        failures.sort_by(|a, b| a.unit.cmp(&b.unit));
        info!(described, failed = failures.len(), "Descriptions merged");
        Ok(DescriptionBatch {
            graph,
            described,
            failures,
        })
    }
}

fn trimmed(payload: DescriptionPayload) -> DescriptionPayload {
    DescriptionPayload {
        description: payload.description.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrag_core::{Element, EntityElement, EntityRef, GraphBuilder, RelationshipElement};

    fn entity(name: &str, description: &str, chunk: &str) -> Element {
        Element::Entity(EntityElement {
            name: name.into(),
            entity_type: "organization".into(),
            description: description.into(),
            chunk_id: chunk.into(),
        })
    }

    fn link(source: &str, target: &str, description: &str, chunk: &str) -> Element {
        Element::Relationship(RelationshipElement {
            source: EntityRef::new(source, "organization"),
            target: EntityRef::new(target, "organization"),
            description: description.into(),
            weight: 1.0,
            chunk_id: chunk.into(),
        })
    }

    fn graph() -> Graph {
        GraphBuilder::build(&[
            entity("Acme Corp", "Chip maker", "d1:0"),
            entity("Acme Corp", "Based in Germany", "d2:0"),
            entity("TaiwanTech", "Distributor", "d1:0"),
            link("Acme Corp", "TaiwanTech", "supplies", "d1:0"),
            link("TaiwanTech", "Acme Corp", "buys from", "d2:0"),
        ])
    }

    #[test]
    fn test_tasks_need_enough_descriptions() {
        let tasks = description_tasks(&graph(), 2);
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[0].element,
            DescribedElement::Node(EntityKey::new("Acme Corp", "organization"))
        );
        assert_eq!(tasks[0].subject, "Acme Corp (organization)");
        assert_eq!(tasks[0].descriptions, vec!["Based in Germany", "Chip maker"]);
        assert!(matches!(tasks[1].element, DescribedElement::Edge(_)));
        assert_eq!(tasks[1].subject, "the relationship between Acme Corp and TaiwanTech");

        assert_eq!(description_tasks(&graph(), 1).len(), 3);
        assert!(description_tasks(&graph(), 0).is_empty());
    }

    #[test]
    fn test_prompt_lists_descriptions() {
        let prompt = describe_prompt("Acme Corp (organization)", &["Chip maker".into(), "Based in Germany".into()]);
        assert!(prompt.contains("description of Acme Corp (organization)"));
        assert!(prompt.ends_with("- Chip maker\n- Based in Germany"));
    }

    #[test]
    fn test_payload_validation() {
        let out = StructuredOutput::<DescriptionPayload>::parse(r#"{"description": "  "}"#);
        assert!(matches!(out, StructuredOutput::Malformed { .. }));
        let out = StructuredOutput::<DescriptionPayload>::parse(r#"{"description": "Maker of chips"}"#);
        assert!(matches!(out, StructuredOutput::Parsed(p) if p.description == "Maker of chips"));
    }
}
