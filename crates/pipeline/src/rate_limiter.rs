//! Distributed token-bucket admission control
//!
//! Bucket records live in a shared [`BucketStore`]. Each debit is a
//! read, a pure [`BucketState::try_debit`], and a versioned compare-and-swap,
//! so concurrent workers in different processes never double-spend tokens.
//! The limiter never retries a failed acquisition on its own beyond the
//! caller's deadline.

use crate::clock::Clock;
use crate::error::{PipelineError, Result};
use graphrag_core::{BucketParams, BucketState, Debit};
use graphrag_db::BucketStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Compare-and-swap attempts before reporting contention as a short wait
const MAX_CAS_ATTEMPTS: usize = 16;
const CONTENTION_BACKOFF: Duration = Duration::from_millis(5);

/// Outcome of a non-blocking acquire
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Granted {
        /// Wall-clock millis the debit was applied at
        granted_at_ms: i64,
        remaining: f64,
    },
    WouldBlock {
        retry_after: Duration,
    },
}

/// Handle on the shared buckets
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    /// Parameters for buckets first seen through `acquire`
    defaults: BucketParams,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>, defaults: BucketParams) -> Self {
        Self {
            store,
            clock,
            defaults,
        }
    }

    /// Create `bucket_id` with `params` unless it already exists.
    ///
    /// The first writer wins; later callers get the stored record.
    #[instrument(skip(self))]
    pub async fn configure(&self, bucket_id: &str, params: BucketParams) -> Result<BucketState> {
        let state = BucketState::full(bucket_id, params, self.clock.now_ms());
        let stored = self.store.create_if_absent(state).await?;
        if stored.params() != params {
            debug!(
                bucket = bucket_id,
                capacity = stored.capacity,
                refill_rate = stored.refill_rate,
                "Bucket already configured, adopting stored parameters"
            );
        }
        Ok(stored)
    }

    /// Tokens available right now
    pub async fn available(&self, bucket_id: &str) -> Result<f64> {
        let state = self.load_or_create(bucket_id).await?;
        Ok(state.available(self.clock.now_ms()))
    }

    async fn load_or_create(&self, bucket_id: &str) -> Result<BucketState> {
        match self.store.load(bucket_id).await? {
            Some(state) => Ok(state),
            None => self.configure(bucket_id, self.defaults).await,
        }
    }

    /// Try to debit `cost` tokens without waiting
    #[instrument(skip(self))]
    pub async fn acquire(&self, bucket_id: &str, cost: f64) -> Result<Admission> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = self.load_or_create(bucket_id).await?;
            let now = self.clock.now_ms();
            let debit = state
                .try_debit(cost, now)
                .map_err(|_| PipelineError::RateLimitExceeded {
                    bucket_id: bucket_id.to_string(),
                    cost,
                })?;

            match debit {
                Debit::Granted(next) => {
                    let remaining = next.tokens;
                    if self.store.compare_and_swap(state.version, next).await? {
                        debug!(bucket = bucket_id, cost, remaining, "Tokens granted");
                        return Ok(Admission::Granted {
                            granted_at_ms: now,
                            remaining,
                        });
                    }
                }
                Debit::Deficit { retry_after_ms } => {
                    return Ok(Admission::WouldBlock {
                        retry_after: Duration::from_millis(retry_after_ms),
                    });
                }
            }
        }

        warn!(bucket = bucket_id, "Bucket contended, backing off");
        Ok(Admission::WouldBlock {
            retry_after: CONTENTION_BACKOFF,
        })
    }

    /// Wait for `cost` tokens until `deadline`.
    ///
    /// Fails with `RateLimitExceeded` once the deadline passes without a grant.
    #[instrument(skip(self, deadline))]
    pub async fn acquire_blocking(&self, bucket_id: &str, cost: f64, deadline: Instant) -> Result<i64> {
        loop {
            match self.acquire(bucket_id, cost).await? {
                Admission::Granted { granted_at_ms, .. } => return Ok(granted_at_ms),
                Admission::WouldBlock { retry_after } => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PipelineError::RateLimitExceeded {
                            bucket_id: bucket_id.to_string(),
                            cost,
                        });
                    }
                    tokio::time::sleep_until((now + retry_after).min(deadline)).await;
                }
            }
        }
    }
}
