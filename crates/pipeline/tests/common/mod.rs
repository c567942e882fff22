//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use graphrag_db::{init_memory, MemoryStore, Repository};
use graphrag_pipeline::{Completion, CompletionClient, CompletionError, CompletionRequest, PipelineConfig, RequestKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const SUPPLY_CHAIN_TEXT: &str =
    "Acme Corp, based in Germany, supplies chips to TaiwanTech, which ships to JapanCo.";

pub const ENGINE_TEXT: &str =
    "Ada Lovelace worked with Charles Babbage, who designed the Analytical Engine.";

pub const ROBOTS_TEXT: &str = "Acme Corp also builds industrial robots in Munich.";

pub const MERGED_ACME_DESCRIPTION: &str = "Acme Corp is a German chip maker that also builds robots.";

pub const SUPPLY_QUESTION: &str = "Does Acme's business reach Japan?";

pub const ENGINE_QUESTION: &str = "What did the Analytical Engine involve?";

type Handler = dyn Fn(&CompletionRequest) -> Result<String, CompletionError> + Send + Sync;

/// Completion client answering from a closure, recording prompts per stage
pub struct ScriptedClient {
    handler: Box<Handler>,
    prompts: Mutex<HashMap<RequestKind, Vec<String>>>,
    delay: Duration,
}

impl ScriptedClient {
    pub fn new(
        handler: impl Fn(&CompletionRequest) -> Result<String, CompletionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            prompts: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self, kind: RequestKind) -> usize {
        self.prompts.lock().unwrap().get(&kind).map_or(0, Vec::len)
    }

    pub fn prompts(&self, kind: RequestKind) -> Vec<String> {
        self.prompts.lock().unwrap().get(&kind).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        self.prompts
            .lock()
            .unwrap()
            .entry(request.kind)
            .or_default()
            .push(request.prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(request).map(|text| Completion::estimated(request, text))
    }
}

fn extraction_reply(prompt: &str) -> String {
    if prompt.contains("BROKEN") {
        return "I am not able to do that.".to_string();
    }
    if prompt.contains("industrial robots") {
        return r#"{
            "entities": [
                {"name": "Acme Corp", "type": "organization", "description": "Builds industrial robots"},
                {"name": "Munich", "type": "location", "description": "City in Germany"}
            ],
            "relationships": [
                {"source": "Acme Corp", "target": "Munich", "description": "builds robots in", "weight": 1}
            ]
        }"#
        .to_string();
    }
    if prompt.contains("Acme Corp") {
        return r#"{
            "entities": [
                {"name": "Acme Corp", "type": "organization", "description": "Chip maker based in Germany"},
                {"name": "TaiwanTech", "type": "organization", "description": "Buys chips from Acme"},
                {"name": "JapanCo", "type": "organization", "description": "Japanese customer of TaiwanTech"}
            ],
            "relationships": [
                {"source": "Acme Corp", "target": "TaiwanTech", "description": "supplies", "weight": 1},
                {"source": "TaiwanTech", "target": "JapanCo", "description": "ships", "weight": 1}
            ]
        }"#
        .to_string();
    }
    if prompt.contains("Ada Lovelace") {
        return r#"```json
        {
            "entities": [
                {"name": "Ada Lovelace", "type": "person", "description": "Mathematician"},
                {"name": "Charles Babbage", "type": "person", "description": "Inventor"},
                {"name": "Analytical Engine", "type": "machine", "description": "Mechanical computer"}
            ],
            "relationships": [
                {"source": "Ada Lovelace", "target": "Charles Babbage", "description": "worked with"},
                {"source": "Charles Babbage", "target": "Analytical Engine", "description": "designed"}
            ]
        }
        ```"#
            .to_string();
    }
    r#"{"entities": [], "relationships": []}"#.to_string()
}

fn description_reply(prompt: &str) -> String {
    if prompt.contains("Acme Corp (organization)") {
        format!(r#"{{"description": "{}"}}"#, MERGED_ACME_DESCRIPTION)
    } else {
        r#"{"description": "Merged description."}"#.to_string()
    }
}

fn summary_reply(prompt: &str) -> String {
    if prompt.contains("JapanCo") {
        r#"{"title": "Chip supply chain", "summary": "Acme Corp in Germany supplies chips to TaiwanTech, which ships to JapanCo in Japan."}"#.to_string()
    } else if prompt.contains("Ada Lovelace") {
        r#"{"title": "Analytical Engine", "summary": "Ada Lovelace worked with Charles Babbage, who designed the Analytical Engine."}"#.to_string()
    } else {
        r#"{"title": "Misc", "summary": "Unrelated entities."}"#.to_string()
    }
}

fn map_reply(prompt: &str) -> String {
    if prompt.contains(SUPPLY_QUESTION) && prompt.contains("JapanCo") {
        r#"{"answer": "Yes, Acme's chips reach JapanCo in Japan through TaiwanTech.", "score": 90}"#.to_string()
    } else if prompt.contains(ENGINE_QUESTION) && prompt.contains("Ada Lovelace") {
        r#"{"answer": "Babbage designed it and Lovelace worked with him.", "score": 80}"#.to_string()
    } else {
        r#"{"answer": "no relevant information", "score": 0}"#.to_string()
    }
}

fn reduce_reply(prompt: &str) -> String {
    if prompt.contains("JapanCo") {
        "Yes. Acme Corp's chips reach Japan: Acme supplies TaiwanTech, which ships to JapanCo [L0C0].".to_string()
    } else {
        "Combined answer.".to_string()
    }
}

/// Reply for the test corpora at any stage
pub fn corpus_reply(request: &CompletionRequest) -> String {
    match request.kind {
        RequestKind::Extract => extraction_reply(&request.prompt),
        RequestKind::Describe => description_reply(&request.prompt),
        RequestKind::Summarize => summary_reply(&request.prompt),
        RequestKind::Map => map_reply(&request.prompt),
        RequestKind::Reduce => reduce_reply(&request.prompt),
    }
}

/// Client that knows the test corpora
pub fn corpus_client() -> ScriptedClient {
    ScriptedClient::new(|request| Ok(corpus_reply(request)))
}

/// Create a test repository with in-memory database
pub async fn create_test_repo() -> Arc<Repository> {
    let db = init_memory().await.expect("Failed to create test database");
    Arc::new(Repository::new(db))
}

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig::default().with_retry(2, Duration::from_millis(1))
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}
