//! Provider configuration.
//!
//! [`ProviderConfig`] holds every knob of the resilience layer: models,
//! inference defaults, concurrency, retry, batching, caching and rate
//! limiting. It can be built in code or loaded from TOML, where durations
//! are written as (fractional) seconds:
//!
//! ```toml
//! region = "eu-west-1"
//! max_concurrent_requests = 4
//! request_timeout = 120
//! retry_max_attempts = 5
//! embedding_batch_timeout = 0.05
//! rate_limit_per_second = 2.5
//!
//! [model_pricing."claude-3-5-sonnet"]
//! input_cost_per_million = 3.0
//! output_cost_per_million = 15.0
//! ```
//!
//! Missing fields take their defaults. Construction of a provider calls
//! [`ProviderConfig::validate`], so an invalid configuration is a fatal
//! [`LlmError::ConfigError`] up front rather than a failure on first use.

use crate::error::{LlmError, Result};
use crate::pipeline::Operation;
use crate::pricing::{ModelPricing, PricingTable};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_COMPLETION_MODEL: &str = "anthropic.claude-3-5-sonnet-20241022-v2:0";
pub const DEFAULT_FAST_MODEL: &str = "anthropic.claude-3-haiku-20240307-v1:0";
pub const DEFAULT_EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v2:0";

/// Configuration of a [`crate::ResilientProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Region of the remote model service.
    pub region: String,
    /// Named credentials profile, passed through to the client factory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Primary completion (and vision) model.
    pub completion_model: String,
    /// Cheaper, faster completion model.
    pub fast_model: String,
    pub embedding_model: String,

    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,

    /// Maximum simultaneous remote calls.
    pub max_concurrent_requests: usize,
    /// Bound on a single remote attempt.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    pub retry_max_attempts: u32,
    pub retry_backoff_factor: f64,
    #[serde(with = "duration_secs")]
    pub retry_max_backoff: Duration,

    pub embedding_batch_size: usize,
    /// How long the first embedding request of a batch waits for company.
    #[serde(with = "duration_secs")]
    pub embedding_batch_timeout: Duration,
    /// Output width requested from embedding models that support it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<usize>,

    pub cache_max_size: usize,
    #[serde(with = "option_duration_secs")]
    pub cache_default_ttl: Option<Duration>,
    #[serde(with = "option_duration_secs")]
    pub embedding_cache_ttl: Option<Duration>,
    pub cache_completions: bool,
    pub cache_embeddings: bool,

    pub rate_limit_per_second: f64,
    pub rate_limit_burst: u32,

    /// Number of recent latencies kept for percentile estimates.
    pub latency_window: usize,
    /// Largest accepted decoded image.
    pub max_image_bytes: usize,
    /// Extra or overriding prices, keyed by model id fragment.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub model_pricing: BTreeMap<String, ModelPricing>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            profile: None,
            completion_model: DEFAULT_COMPLETION_MODEL.to_string(),
            fast_model: DEFAULT_FAST_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 250,
            max_concurrent_requests: 10,
            request_timeout: Duration::from_secs(300),
            retry_max_attempts: 3,
            retry_backoff_factor: 2.0,
            retry_max_backoff: Duration::from_secs(60),
            embedding_batch_size: 25,
            embedding_batch_timeout: Duration::from_millis(50),
            embedding_dimensions: None,
            cache_max_size: 1000,
            cache_default_ttl: Some(Duration::from_secs(3600)),
            embedding_cache_ttl: Some(Duration::from_secs(86_400)),
            cache_completions: true,
            cache_embeddings: true,
            rate_limit_per_second: 10.0,
            rate_limit_burst: 20,
            latency_window: 1000,
            max_image_bytes: 3_750_000,
            model_pricing: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LlmError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| LlmError::ConfigError(format!("failed to parse TOML config: {e}")))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LlmError::ConfigError(format!("failed to serialize config: {e}")))
    }

    /// Check every constraint and report all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut check = |ok: bool, msg: &str| {
            if !ok {
                problems.push(msg.to_string());
            }
        };

        check(!self.region.trim().is_empty(), "region must not be empty");
        check(
            !self.completion_model.trim().is_empty(),
            "completion_model must not be empty",
        );
        check(!self.fast_model.trim().is_empty(), "fast_model must not be empty");
        check(
            !self.embedding_model.trim().is_empty(),
            "embedding_model must not be empty",
        );
        check(self.max_tokens > 0, "max_tokens must be positive");
        check(
            (0.0..=2.0).contains(&self.temperature),
            "temperature must be between 0 and 2",
        );
        check((0.0..=1.0).contains(&self.top_p), "top_p must be between 0 and 1");
        check(self.top_k > 0, "top_k must be positive");
        check(
            self.retry_max_attempts > 0,
            "retry_max_attempts must be positive",
        );
        check(
            self.retry_backoff_factor > 1.0,
            "retry_backoff_factor must be greater than 1",
        );
        check(
            !self.retry_max_backoff.is_zero(),
            "retry_max_backoff must be positive",
        );
        check(
            !self.request_timeout.is_zero(),
            "request_timeout must be positive",
        );
        check(
            self.max_concurrent_requests > 0,
            "max_concurrent_requests must be positive",
        );
        check(
            self.embedding_batch_size > 0,
            "embedding_batch_size must be positive",
        );
        check(
            self.embedding_dimensions != Some(0),
            "embedding_dimensions must be positive when set",
        );
        check(self.cache_max_size > 0, "cache_max_size must be positive");
        check(
            self.rate_limit_per_second > 0.0 && self.rate_limit_per_second.is_finite(),
            "rate_limit_per_second must be positive",
        );
        check(self.rate_limit_burst > 0, "rate_limit_burst must be positive");
        check(self.latency_window > 0, "latency_window must be positive");
        check(self.max_image_bytes > 0, "max_image_bytes must be positive");
        check(
            self.model_pricing.values().all(|p| {
                p.input_cost_per_million >= 0.0 && p.output_cost_per_million >= 0.0
            }),
            "model_pricing costs must not be negative",
        );

        if problems.is_empty() {
            Ok(())
        } else {
            Err(LlmError::ConfigError(problems.join("; ")))
        }
    }

    /// Derive the immutable retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_backoff_factor,
            self.retry_max_backoff,
        )
    }

    /// Whether results of `operation` are cached at all.
    pub fn caches(&self, operation: Operation) -> bool {
        match operation {
            Operation::Complete | Operation::AnalyzeImage => self.cache_completions,
            Operation::Embed => self.cache_embeddings,
            Operation::Stream => false,
        }
    }

    /// TTL for cached results of `operation`.
    pub fn cache_ttl_for(&self, operation: Operation) -> Option<Duration> {
        match operation {
            Operation::Embed => self.embedding_cache_ttl,
            _ => self.cache_default_ttl,
        }
    }

    /// Default prices with `model_pricing` applied on top.
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::default();
        for (fragment, pricing) in &self.model_pricing {
            table.set_pricing(fragment.clone(), *pricing);
        }
        table
    }

    /// Width of the vectors produced by the embedding model.
    pub fn embedding_dimension(&self) -> usize {
        match self.embedding_dimensions {
            Some(dim) => dim,
            None if self.embedding_model.contains("titan-embed-text-v2") => 1024,
            None => 1536,
        }
    }
}

// ============================================================================
// Duration (de)serialization as seconds
// ============================================================================

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_f64(d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
