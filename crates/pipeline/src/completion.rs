//! Text completion capability
//!
//! The engine only sees [`CompletionClient`]. [`HttpCompletionClient`] talks
//! to Ollama, TGI or an OpenAI-compatible endpoint; tests script their own.

use crate::config::{ProviderConfig, ProviderKind};
use async_trait::async_trait;
use graphrag_core::hashing::{estimate_message_tokens, estimate_tokens};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Which pipeline stage issued a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Extract,
    Describe,
    Summarize,
    Map,
    Reduce,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub kind: RequestKind,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    /// Ask the provider to constrain output to a JSON object
    pub json: bool,
}

impl CompletionRequest {
    pub fn new(kind: RequestKind, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 512,
            json: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Estimated prompt tokens, used to size the rate-limit debit
    pub fn estimated_cost(&self) -> u64 {
        estimate_message_tokens("system", &self.system) + estimate_message_tokens("user", &self.prompt)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Completion {
    /// Completion with token counts estimated from text
    pub fn estimated(request: &CompletionRequest, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            prompt_tokens: request.estimated_cost(),
            completion_tokens: estimate_tokens(&text),
            text,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    #[error("Provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider call timed out")]
    Timeout,

    #[error("Provider error: {0}")]
    Provider(String),
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CompletionError::Timeout
        } else {
            CompletionError::Provider(e.to_string())
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;
}

/// HTTP client for the configured provider
#[derive(Clone)]
pub struct HttpCompletionClient {
    client: Client,
    config: ProviderConfig,
    timeout: Duration,
}

impl HttpCompletionClient {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            config,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.url
    }

    pub async fn health(&self) -> Result<bool, CompletionError> {
        let url = match self.config.kind {
            ProviderKind::Ollama => format!("{}/api/tags", self.config.url),
            ProviderKind::Tgi => format!("{}/health", self.config.url),
            ProviderKind::OpenAi => format!("{}/models", self.config.url),
        };
        let mut request = self.client.get(&url).timeout(self.timeout);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        Ok(response.status().is_success())
    }

    async fn post(&self, url: &str, body: &impl Serialize) -> Result<Value, CompletionError> {
        let mut request = self.client.post(url).json(body).timeout(self.timeout);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Value>().await?);
        }

        let retry_header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_header, &body))
    }

    async fn ollama_chat(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let url = format!("{}/api/chat", self.config.url);
        let body = OllamaChatRequest {
            model: &self.config.model,
            messages: messages(request),
            stream: false,
            format: request.json.then(|| Value::String("json".to_string())),
            options: json!({ "num_predict": request.max_tokens, "temperature": 0 }),
        };
        let response: OllamaChatResponse = serde_json::from_value(self.post(&url, &body).await?)
            .map_err(|e| CompletionError::Provider(format!("Unexpected Ollama response: {}", e)))?;

        if let Some(done_reason) = response.done_reason.as_deref() {
            debug!("Ollama chat done_reason={}", done_reason);
        }

        let mut completion = Completion::estimated(request, response.message.content);
        if let Some(n) = response.prompt_eval_count {
            completion.prompt_tokens = n;
        }
        if let Some(n) = response.eval_count {
            completion.completion_tokens = n;
        }
        Ok(completion)
    }

    async fn tgi_generate(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let url = format!("{}/generate", self.config.url);
        let body = TgiGenerateRequest {
            inputs: format!("{}\n\n{}", request.system, request.prompt),
            parameters: TgiParameters {
                max_new_tokens: request.max_tokens,
                return_full_text: false,
            },
        };
        let text = extract_generated_text(self.post(&url, &body).await?)?;
        Ok(Completion::estimated(request, text))
    }

    async fn openai_chat(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let url = format!("{}/chat/completions", self.config.url);
        let body = OpenAiChatRequest {
            model: &self.config.model,
            messages: messages(request),
            max_tokens: request.max_tokens,
            temperature: 0.0,
            response_format: request.json.then(|| json!({ "type": "json_object" })),
        };
        let response: OpenAiChatResponse = serde_json::from_value(self.post(&url, &body).await?)
            .map_err(|e| CompletionError::Provider(format!("Unexpected chat response: {}", e)))?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::Provider("Chat response has no choices".to_string()))?;
        let mut completion = Completion::estimated(request, text);
        if let Some(usage) = response.usage {
            completion.prompt_tokens = usage.prompt_tokens;
            completion.completion_tokens = usage.completion_tokens;
        }
        Ok(completion)
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        debug!(kind = ?request.kind, provider = ?self.config.kind, "Sending completion request");
        match self.config.kind {
            ProviderKind::Ollama => self.ollama_chat(request).await,
            ProviderKind::Tgi => self.tgi_generate(request).await,
            ProviderKind::OpenAi => self.openai_chat(request).await,
        }
    }
}

fn messages(request: &CompletionRequest) -> Vec<ChatMessage<'_>> {
    vec![
        ChatMessage {
            role: "system",
            content: &request.system,
        },
        ChatMessage {
            role: "user",
            content: &request.prompt,
        },
    ]
}

fn classify_status(status: StatusCode, retry_header: Option<u64>, body: &str) -> CompletionError {
    match status.as_u16() {
        429 => CompletionError::RateLimited {
            retry_after: retry_header
                .or_else(|| extract_retry_after(body))
                .map(Duration::from_secs),
        },
        408 | 504 => CompletionError::Timeout,
        401 => CompletionError::Provider("Unauthorized: check GRAPHRAG_LLM_API_KEY".to_string()),
        404 => CompletionError::Provider(format!("Model not found or endpoint unavailable: {}", body)),
        500..=599 => CompletionError::Provider(format!("Server error ({}): {}", status, body)),
        _ => CompletionError::Provider(format!("HTTP error {}: {}", status, body)),
    }
}

fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}

fn extract_generated_text(value: Value) -> Result<String, CompletionError> {
    match value {
        Value::Array(mut items) => {
            let first = items
                .pop()
                .ok_or_else(|| CompletionError::Provider("Empty TGI response array".to_string()))?;
            extract_generated_text(first)
        }
        Value::Object(mut obj) => {
            if let Some(Value::String(text)) = obj.remove("generated_text") {
                Ok(text)
            } else if let Some(Value::String(text)) = obj.remove("response") {
                Ok(text)
            } else {
                Err(CompletionError::Provider(
                    "TGI response missing generated text field".to_string(),
                ))
            }
        }
        other => Err(CompletionError::Provider(format!(
            "Unexpected TGI response format: {}",
            other
        ))),
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    options: Value,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatMessageResponse,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaChatMessageResponse {
    content: String,
}

#[derive(Serialize)]
struct TgiGenerateRequest {
    inputs: String,
    parameters: TgiParameters,
}

#[derive(Serialize)]
struct TgiParameters {
    max_new_tokens: u32,
    return_full_text: bool,
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimated_cost_covers_both_messages() {
        let request = CompletionRequest::new(RequestKind::Map, "x".repeat(40), "y".repeat(400));
        // 10 + 1 + 4 for system, 100 + 1 + 4 for user
        assert_eq!(request.estimated_cost(), 120);
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3), "");
        assert_eq!(
            err,
            CompletionError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );

        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, None, r#"{"error": {"retry_after": 7}}"#);
        assert_eq!(
            err,
            CompletionError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn test_classify_server_error() {
        let err = classify_status(StatusCode::BAD_GATEWAY, None, "upstream down");
        assert!(matches!(err, CompletionError::Provider(m) if m.contains("upstream down")));
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, None, ""),
            CompletionError::Timeout
        );
    }

    #[test]
    fn test_extract_generated_text_shapes() {
        let text = extract_generated_text(json!([{ "generated_text": "hello" }])).unwrap();
        assert_eq!(text, "hello");
        let text = extract_generated_text(json!({ "response": "hi" })).unwrap();
        assert_eq!(text, "hi");
        assert!(extract_generated_text(json!([])).is_err());
        assert!(extract_generated_text(json!(42)).is_err());
    }

    #[test]
    fn test_openai_body_shape() {
        let request = CompletionRequest::new(RequestKind::Extract, "sys", "user").json();
        let body = OpenAiChatRequest {
            model: "m",
            messages: messages(&request),
            max_tokens: 10,
            temperature: 0.0,
            response_format: request.json.then(|| json!({ "type": "json_object" })),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "user");
        assert_eq!(value["response_format"]["type"], "json_object");
    }
}
