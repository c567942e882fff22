//! The one path to the completion capability
//!
//! Every call debits the shared bucket first, then runs under the per-call
//! timeout clipped to the caller's deadline. Provider errors and provider
//! side rate limiting are retried with exponential backoff up to the attempt
//! cap.

use crate::completion::{Completion, CompletionClient, CompletionError, CompletionRequest};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct LlmGateway {
    client: Arc<dyn CompletionClient>,
    limiter: RateLimiter,
    bucket_id: String,
    attempts: u32,
    backoff_base: Duration,
    call_timeout: Duration,
}

impl LlmGateway {
    pub fn new(client: Arc<dyn CompletionClient>, limiter: RateLimiter, config: &PipelineConfig) -> Self {
        Self {
            client,
            limiter,
            bucket_id: config.bucket_id.clone(),
            attempts: config.provider_attempts.max(1),
            backoff_base: config.backoff_base,
            call_timeout: config.call_timeout,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one completion, retrying transient failures until `deadline`
    #[instrument(skip(self, request, deadline), fields(kind = ?request.kind))]
    pub async fn complete(&self, request: &CompletionRequest, deadline: Instant) -> Result<Completion> {
        let cost = request.estimated_cost() as f64;
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            self.limiter
                .acquire_blocking(&self.bucket_id, cost, deadline)
                .await?;

            let call_deadline = (Instant::now() + self.call_timeout).min(deadline);
            let suggested = match tokio::time::timeout_at(call_deadline, self.client.complete(request)).await {
                Ok(Ok(completion)) => {
                    debug!(
                        attempt,
                        prompt_tokens = completion.prompt_tokens,
                        completion_tokens = completion.completion_tokens,
                        "Completion succeeded"
                    );
                    return Ok(completion);
                }
                Ok(Err(CompletionError::RateLimited { retry_after })) => {
                    last_error = CompletionError::RateLimited { retry_after }.to_string();
                    retry_after
                }
                Ok(Err(CompletionError::Timeout)) | Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::timeout("completion call"));
                    }
                    last_error = CompletionError::Timeout.to_string();
                    None
                }
                Ok(Err(e @ CompletionError::Provider(_))) => {
                    last_error = e.to_string();
                    None
                }
            };

            if attempt == self.attempts {
                break;
            }

            let wait = backoff(self.backoff_base, attempt, suggested);
            warn!(attempt, wait_ms = wait.as_millis() as u64, error = %last_error, "Completion failed, retrying");
            let resume = Instant::now() + wait;
            if resume >= deadline {
                return Err(PipelineError::timeout("completion retry backoff"));
            }
            tokio::time::sleep_until(resume).await;
        }

        Err(PipelineError::ProviderError {
            attempts: self.attempts,
            message: last_error,
        })
    }
}

/// `base * 2^(attempt-1)`, or the provider's suggested wait if longer
fn backoff(base: Duration, attempt: u32, suggested: Option<Duration>) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    suggested.map_or(exponential, |s| s.max(exponential))
}
