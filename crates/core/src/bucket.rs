//! Token bucket arithmetic
//!
//! The bucket is refilled lazily: nothing ticks in the background, every
//! access computes how many tokens accrued since `last_refill_ms`. State
//! transitions are pure so the shared store only has to swap whole records.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Capacity and refill rate of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketParams {
    /// Maximum tokens held
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl BucketParams {
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(capacity) || !valid(refill_rate) {
            return Err(CoreError::InvalidBucketParams {
                capacity,
                refill_rate,
            });
        }
        Ok(Self {
            capacity,
            refill_rate,
        })
    }
}

/// Stored bucket record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub bucket_id: String,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    /// Wall-clock millis of the last refill
    pub last_refill_ms: i64,
    /// Bumped on every write; used for compare-and-swap
    pub version: u64,
}

/// Outcome of a debit attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Debit {
    /// The new state to write back
    Granted(BucketState),
    /// Not enough tokens yet; `retry_after_ms` until there will be
    Deficit { retry_after_ms: u64 },
}

impl BucketState {
    /// A full bucket
    pub fn full(bucket_id: impl Into<String>, params: BucketParams, now_ms: i64) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            tokens: params.capacity,
            capacity: params.capacity,
            refill_rate: params.refill_rate,
            last_refill_ms: now_ms,
            version: 0,
        }
    }

    pub fn params(&self) -> BucketParams {
        BucketParams {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }

    /// Tokens available at `now_ms`. A clock that went backwards adds nothing.
    pub fn available(&self, now_ms: i64) -> f64 {
        let elapsed_ms = (now_ms - self.last_refill_ms).max(0) as f64;
        (self.tokens + elapsed_ms / 1000.0 * self.refill_rate).clamp(0.0, self.capacity)
    }

    /// Refilled copy of this state as of `now_ms`
    pub fn refilled(&self, now_ms: i64) -> Self {
        Self {
            tokens: self.available(now_ms),
            last_refill_ms: now_ms.max(self.last_refill_ms),
            ..self.clone()
        }
    }

    /// Try to take `cost` tokens.
    ///
    /// A cost above capacity can never be satisfied and is rejected outright.
    pub fn try_debit(&self, cost: f64, now_ms: i64) -> Result<Debit> {
        if !cost.is_finite() || cost < 0.0 || cost > self.capacity {
            return Err(CoreError::Validation(format!(
                "Cost {} cannot be served by bucket '{}' with capacity {}",
                cost, self.bucket_id, self.capacity
            )));
        }
        let mut next = self.refilled(now_ms);
        if next.tokens + f64::EPSILON < cost {
            let deficit = cost - next.tokens;
            let retry_after_ms = (deficit / self.refill_rate * 1000.0).ceil().max(1.0) as u64;
            return Ok(Debit::Deficit { retry_after_ms });
        }
        next.tokens = (next.tokens - cost).max(0.0);
        next.version = self.version + 1;
        Ok(Debit::Granted(next))
    }
}
