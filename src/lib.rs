//! EdgeQuake Resilience - dependable access to remote foundation models
//!
//! Remote model APIs are rate limited, occasionally unavailable and slow in
//! unpredictable ways. This crate wraps a remote client so that completion,
//! vision and embedding calls behave like a dependable local service:
//!
//! - bounded concurrency (a counting semaphore)
//! - token-bucket rate limiting
//! - classified retry with exponential backoff and additive jitter
//! - TTL + LRU response caching
//! - coalescing of embedding requests into batched calls
//! - latency, success, cache, token and cost metrics
//!
//! # Architecture
//!
//! ```text
//!  caller
//!    │
//!    ▼
//!  ResilientProvider ─► Completion / Vision / Embedding providers
//!                                 │           (BatchCoalescer for embeddings)
//!                                 ▼
//!                          RequestPipeline
//!     ResponseCache ─► Semaphore ─► RateLimiter ─► RetryExecutor ─► ModelClient
//!                                 │
//!                                 ▼
//!                         PerformanceMonitor
//! ```
//!
//! # Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | [`RateLimiter`] | [`rate_limiter`] | Token bucket, delays but never rejects |
//! | [`ResponseCache`] | [`cache`] | TTL-aware LRU store |
//! | [`RetryExecutor`] | [`retry`] | Retry loop under a [`RetryPolicy`] |
//! | [`BatchCoalescer`] | [`batch`] | Merges concurrent requests per key |
//! | [`PerformanceMonitor`] | [`monitor`] | Counters and latency percentiles |
//! | [`PricingTable`] | [`pricing`] | Token usage and cost estimates |
//! | [`ResilientProvider`] | [`facade`] | Public entry point |
//!
//! # Example
//!
//! ```
//! use edgequake_resilience::{CompletionRequest, MockClient, ProviderConfig, ResilientProvider};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> edgequake_resilience::Result<()> {
//! let provider = ResilientProvider::new(ProviderConfig::default(), Arc::new(MockClient::new()))?;
//!
//! let request = CompletionRequest::new("Summarize the document")
//!     .with_system_prompt("You are concise.");
//! let summary = provider.complete(request).await?;
//! let vectors = provider.embed_texts(&["a".to_string(), "b".to_string()]).await?;
//!
//! assert!(!summary.is_empty());
//! assert_eq!(vectors.len(), 2);
//! println!("{:?}", provider.stats());
//! # Ok(())
//! # }
//! ```
//!
//! With the `bedrock` feature, `ResilientProvider::from_bedrock` builds the
//! provider on the AWS Bedrock Runtime client.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
pub mod monitor;
pub mod pipeline;
pub mod pricing;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod traits;

pub use batch::{BatchCoalescer, BatchConfig, BatchOperation};
pub use cache::{cache_key, CacheStats, ResponseCache};
pub use config::ProviderConfig;
pub use error::{ErrorKind, LlmError, Result};
pub use facade::{ProviderInfo, ResilientProvider};
pub use monitor::{
    BreakdownStats, MetricsSink, PerformanceMonitor, PerformanceStats, RequestOutcome, TracingSink,
};
pub use pipeline::{Operation, RequestPipeline};
pub use pricing::{ModelPricing, PricingTable, TokenUsage};
#[cfg(feature = "bedrock")]
pub use providers::BedrockClient;
pub use providers::{
    CompletionProvider, CompletionRequest, EmbeddingProvider, MockClient, VisionProvider,
};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryExecutor, RetryInfo, RetryPolicy};
pub use traits::{ChatMessage, ChatRole, CompletionOptions, ImageData, ModelClient};
