//! Pipeline configuration
//!
//! Every setting has a default and can be overridden through a `GRAPHRAG_*`
//! environment variable or a builder method.

use crate::error::{PipelineError, Result};
use graphrag_core::{BucketParams, ChunkParams, DetectorConfig};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CHUNK_SIZE: usize = 600;
const DEFAULT_CHUNK_OVERLAP: usize = 100;
const DEFAULT_BUCKET_ID: &str = "completion";
const DEFAULT_BUCKET_CAPACITY: f64 = 10_000.0;
const DEFAULT_BUCKET_REFILL_RATE: f64 = 200.0;
const DEFAULT_MAX_TOKENS: u32 = 800;
const DEFAULT_PROVIDER_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MIN_EXTRACTION_SUCCESS: f64 = 0.5;
const DEFAULT_MAX_LEVELS: usize = 4;
const DEFAULT_RESOLUTION: f64 = 1.0;
const DEFAULT_MIN_COMMUNITY_SIZE: usize = 3;
const DEFAULT_DESCRIBE_MIN_DESCRIPTIONS: usize = 2;
const DEFAULT_QUERY_LEVEL: u32 = 0;
const DEFAULT_MIN_RELEVANCE: u8 = 1;
const DEFAULT_MAP_CONCURRENCY: usize = 16;
const DEFAULT_INDEX_CONCURRENCY: usize = 8;
const DEFAULT_SUMMARY_CONTEXT_CHARS: usize = 12_000;
const DEFAULT_LEASE_SECS: u64 = 300;

const DEFAULT_PROVIDER: &str = "ollama";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_TGI_URL: &str = "http://localhost:8082";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_MODEL: &str = "phi4-mini:latest";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse `key` if set; fail loudly on a malformed value
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| PipelineError::Config(format!("{} has invalid value '{}'", key, raw))),
        _ => Ok(default),
    }
}

/// Which HTTP completion API to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ollama,
    Tgi,
    OpenAi,
}

impl FromStr for ProviderKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "tgi" => Ok(ProviderKind::Tgi),
            "openai" => Ok(ProviderKind::OpenAi),
            other => Err(PipelineError::Config(format!("Unknown provider '{}'", other))),
        }
    }
}

/// Completion provider settings
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self> {
        let kind: ProviderKind = env_or_default("GRAPHRAG_PROVIDER", DEFAULT_PROVIDER).parse()?;
        let (url, model) = match kind {
            ProviderKind::Ollama => (DEFAULT_OLLAMA_URL, DEFAULT_OLLAMA_MODEL),
            ProviderKind::Tgi => (DEFAULT_TGI_URL, "tgi"),
            ProviderKind::OpenAi => (DEFAULT_OPENAI_URL, DEFAULT_OPENAI_MODEL),
        };
        Ok(Self {
            kind,
            url: env_or_default("GRAPHRAG_LLM_URL", url),
            model: env_or_default("GRAPHRAG_LLM_MODEL", model),
            api_key: std::env::var("GRAPHRAG_LLM_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
        })
    }
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunk: ChunkParams,
    pub bucket_id: String,
    pub bucket: BucketParams,
    /// Completion budget per call
    pub max_tokens: u32,
    pub provider_attempts: u32,
    pub backoff_base: Duration,
    /// Upper bound on a single completion call
    pub call_timeout: Duration,
    /// Fraction of chunks that must extract for an index run to succeed
    pub min_extraction_success: f64,
    pub detector: DetectorConfig,
    /// Elements with at least this many descriptions get a merged one; 0 disables
    pub describe_min_descriptions: usize,
    pub query_level: u32,
    /// Map results scoring below this (0-100) are dropped
    pub min_relevance: u8,
    pub map_concurrency: usize,
    pub index_concurrency: usize,
    /// Community renderings longer than this fall back to child summaries
    pub summary_context_chars: usize,
    pub cache_ttl_secs: Option<u64>,
    /// How long a cache computation claim stays valid
    pub lease: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkParams::default(),
            bucket_id: DEFAULT_BUCKET_ID.to_string(),
            bucket: BucketParams {
                capacity: DEFAULT_BUCKET_CAPACITY,
                refill_rate: DEFAULT_BUCKET_REFILL_RATE,
            },
            max_tokens: DEFAULT_MAX_TOKENS,
            provider_attempts: DEFAULT_PROVIDER_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            min_extraction_success: DEFAULT_MIN_EXTRACTION_SUCCESS,
            detector: DetectorConfig {
                resolution: DEFAULT_RESOLUTION,
                max_levels: DEFAULT_MAX_LEVELS,
                min_community_size: DEFAULT_MIN_COMMUNITY_SIZE,
                ..DetectorConfig::default()
            },
            describe_min_descriptions: DEFAULT_DESCRIBE_MIN_DESCRIPTIONS,
            query_level: DEFAULT_QUERY_LEVEL,
            min_relevance: DEFAULT_MIN_RELEVANCE,
            map_concurrency: DEFAULT_MAP_CONCURRENCY,
            index_concurrency: DEFAULT_INDEX_CONCURRENCY,
            summary_context_chars: DEFAULT_SUMMARY_CONTEXT_CHARS,
            cache_ttl_secs: None,
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
        }
    }
}

impl PipelineConfig {
    /// Load from `GRAPHRAG_*` environment variables
    pub fn from_env() -> Result<Self> {
        let chunk = ChunkParams::new(
            env_parse("GRAPHRAG_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            env_parse("GRAPHRAG_CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP)?,
        )?;
        let bucket = BucketParams::new(
            env_parse("GRAPHRAG_BUCKET_CAPACITY", DEFAULT_BUCKET_CAPACITY)?,
            env_parse("GRAPHRAG_BUCKET_REFILL_RATE", DEFAULT_BUCKET_REFILL_RATE)?,
        )?;
        let cache_ttl_secs = match std::env::var("GRAPHRAG_CACHE_TTL_SECS") {
            Ok(raw) if !raw.trim().is_empty() => Some(env_parse("GRAPHRAG_CACHE_TTL_SECS", 0u64)?),
            _ => None,
        };

        let config = Self {
            chunk,
            bucket_id: env_or_default("GRAPHRAG_BUCKET_ID", DEFAULT_BUCKET_ID),
            bucket,
            max_tokens: env_parse("GRAPHRAG_MAX_TOKENS", DEFAULT_MAX_TOKENS)?,
            provider_attempts: env_parse("GRAPHRAG_PROVIDER_ATTEMPTS", DEFAULT_PROVIDER_ATTEMPTS)?,
            backoff_base: Duration::from_millis(env_parse(
                "GRAPHRAG_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )?),
            call_timeout: Duration::from_secs(env_parse(
                "GRAPHRAG_CALL_TIMEOUT_SECS",
                DEFAULT_CALL_TIMEOUT_SECS,
            )?),
            min_extraction_success: env_parse(
                "GRAPHRAG_MIN_EXTRACTION_SUCCESS",
                DEFAULT_MIN_EXTRACTION_SUCCESS,
            )?,
            detector: DetectorConfig {
                resolution: env_parse("GRAPHRAG_RESOLUTION", DEFAULT_RESOLUTION)?,
                max_levels: env_parse("GRAPHRAG_MAX_LEVELS", DEFAULT_MAX_LEVELS)?,
                min_community_size: env_parse(
                    "GRAPHRAG_MIN_COMMUNITY_SIZE",
                    DEFAULT_MIN_COMMUNITY_SIZE,
                )?,
                ..DetectorConfig::default()
            },
            describe_min_descriptions: env_parse(
                "GRAPHRAG_DESCRIBE_MIN_DESCRIPTIONS",
                DEFAULT_DESCRIBE_MIN_DESCRIPTIONS,
            )?,
            query_level: env_parse("GRAPHRAG_QUERY_LEVEL", DEFAULT_QUERY_LEVEL)?,
            min_relevance: env_parse("GRAPHRAG_MIN_RELEVANCE", DEFAULT_MIN_RELEVANCE)?,
            map_concurrency: env_parse("GRAPHRAG_MAP_CONCURRENCY", DEFAULT_MAP_CONCURRENCY)?,
            index_concurrency: env_parse("GRAPHRAG_INDEX_CONCURRENCY", DEFAULT_INDEX_CONCURRENCY)?,
            summary_context_chars: env_parse(
                "GRAPHRAG_SUMMARY_CONTEXT_CHARS",
                DEFAULT_SUMMARY_CONTEXT_CHARS,
            )?,
            cache_ttl_secs,
            lease: Duration::from_secs(env_parse("GRAPHRAG_LEASE_SECS", DEFAULT_LEASE_SECS)?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_extraction_success) {
            return Err(PipelineError::Config(format!(
                "min_extraction_success must be within [0, 1], got {}",
                self.min_extraction_success
            )));
        }
        if self.min_relevance > 100 {
            return Err(PipelineError::Config("min_relevance must be at most 100".into()));
        }
        if self.provider_attempts == 0 {
            return Err(PipelineError::Config("provider_attempts must be at least 1".into()));
        }
        if self.map_concurrency == 0 || self.index_concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be at least 1".into()));
        }
        if self.detector.max_levels == 0 {
            return Err(PipelineError::Config("max_levels must be at least 1".into()));
        }
        if self.detector.min_community_size == 0 {
            return Err(PipelineError::Config("min_community_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_chunking(mut self, window_size: usize, overlap: usize) -> Result<Self> {
        self.chunk = ChunkParams::new(window_size, overlap)?;
        Ok(self)
    }

    pub fn with_bucket(mut self, bucket_id: impl Into<String>, params: BucketParams) -> Self {
        self.bucket_id = bucket_id.into();
        self.bucket = params;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff_base: Duration) -> Self {
        self.provider_attempts = attempts;
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_min_extraction_success(mut self, fraction: f64) -> Self {
        self.min_extraction_success = fraction;
        self
    }

    pub fn with_query_level(mut self, level: u32) -> Self {
        self.query_level = level;
        self
    }

    pub fn with_min_relevance(mut self, score: u8) -> Self {
        self.min_relevance = score;
        self
    }

    pub fn with_max_levels(mut self, levels: usize) -> Self {
        self.detector.max_levels = levels;
        self
    }

    /// Communities smaller than `size` are pooled together; 1 keeps them apart
    pub fn with_min_community_size(mut self, size: usize) -> Self {
        self.detector.min_community_size = size;
        self
    }

    pub fn with_describe_min_descriptions(mut self, count: usize) -> Self {
        self.describe_min_descriptions = count;
        self
    }

    pub fn with_map_concurrency(mut self, n: usize) -> Self {
        self.map_concurrency = n;
        self
    }

    pub fn with_index_concurrency(mut self, n: usize) -> Self {
        self.index_concurrency = n;
        self
    }

    pub fn with_summary_context_chars(mut self, chars: usize) -> Self {
        self.summary_context_chars = chars;
        self
    }

    pub fn with_cache_ttl(mut self, ttl_secs: Option<u64>) -> Self {
        self.cache_ttl_secs = ttl_secs;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}
