//! The public entry point.
//!
//! [`ResilientProvider`] owns one [`RequestPipeline`] (cache, semaphore,
//! rate limiter, retry executor, performance monitor) and exposes
//! completion, vision and embedding operations on top of it.
//!
//! ```text
//!                      ┌───────────────────────────────────────┐
//!  complete ─────────► │ CompletionProvider ─┐                 │
//!  analyze_image ────► │ VisionProvider ─────┼─► RequestPipeline ─► ModelClient
//!  embed_texts ──────► │ EmbeddingProvider ──┘   (via BatchCoalescer)
//!                      └───────────────────────────────────────┘
//! ```
//!
//! The monitor and the cache live exactly as long as the provider; nothing
//! is process-global.

use crate::cache::CacheStats;
use crate::config::ProviderConfig;
use crate::error::Result;
use crate::monitor::{PerformanceMonitor, PerformanceStats};
use crate::pipeline::RequestPipeline;
use crate::providers::{CompletionProvider, CompletionRequest, EmbeddingProvider, VisionProvider};
use crate::traits::{CompletionOptions, ImageData, ModelClient};
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

/// Serializable summary of a provider's models and limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub client: String,
    pub region: String,
    pub completion_model: String,
    pub fast_model: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub max_concurrent_requests: usize,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: u32,
    pub retry_max_attempts: u32,
    pub cache_max_size: usize,
    pub embedding_batch_size: usize,
}

/// Resilient access to a remote foundation-model API.
///
/// # Example
///
/// ```
/// use edgequake_resilience::{MockClient, ProviderConfig, ResilientProvider};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> edgequake_resilience::Result<()> {
/// let provider = ResilientProvider::new(ProviderConfig::default(), Arc::new(MockClient::new()))?;
/// let answer = provider.complete("What is a token bucket?").await?;
/// assert_eq!(answer, "Mock response");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ResilientProvider {
    pipeline: Arc<RequestPipeline>,
    completion: CompletionProvider,
    vision: VisionProvider,
    embedding: EmbeddingProvider,
}

impl ResilientProvider {
    /// Build a provider around `client`. Fails with `ConfigError` if the
    /// configuration is invalid.
    pub fn new(config: ProviderConfig, client: Arc<dyn ModelClient>) -> Result<Self> {
        let monitor =
            PerformanceMonitor::new(config.latency_window).with_pricing(config.pricing_table());
        Self::with_monitor(config, client, monitor)
    }

    /// Like [`ResilientProvider::new`], with a pre-built monitor (e.g. one
    /// carrying metrics sinks).
    pub fn with_monitor(
        config: ProviderConfig,
        client: Arc<dyn ModelClient>,
        monitor: PerformanceMonitor,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::new(config),
            client,
            Arc::new(monitor),
        ));
        info!(
            client = pipeline.client().name(),
            region = %pipeline.config().region,
            completion_model = %pipeline.config().completion_model,
            embedding_model = %pipeline.config().embedding_model,
            "Resilient provider initialized"
        );
        Ok(Self {
            completion: CompletionProvider::new(Arc::clone(&pipeline)),
            vision: VisionProvider::new(Arc::clone(&pipeline)),
            embedding: EmbeddingProvider::new(Arc::clone(&pipeline)),
            pipeline,
        })
    }

    /// Build a provider backed by AWS Bedrock.
    #[cfg(feature = "bedrock")]
    pub async fn from_bedrock(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let client = crate::providers::BedrockClient::from_config(&config).await;
        Self::new(config, Arc::new(client))
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Complete a prompt. Accepts a bare prompt or a [`CompletionRequest`]
    /// carrying a system prompt, history, model and options.
    #[instrument(skip_all)]
    pub async fn complete(&self, request: impl Into<CompletionRequest>) -> Result<String> {
        self.completion.complete(request.into()).await
    }

    /// Complete several prompts; one result per prompt, in order.
    pub async fn complete_batch<I>(&self, requests: I) -> Vec<Result<String>>
    where
        I: IntoIterator,
        I::Item: Into<CompletionRequest>,
    {
        let requests = requests.into_iter().map(Into::into).collect();
        self.completion.complete_batch(requests).await
    }

    pub async fn complete_streaming(
        &self,
        request: impl Into<CompletionRequest>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        self.completion.complete_streaming(request.into()).await
    }

    #[instrument(skip_all)]
    pub async fn analyze_image(
        &self,
        prompt: &str,
        image: ImageData,
        model_id: Option<&str>,
    ) -> Result<String> {
        self.vision.analyze_image(prompt, image, model_id).await
    }

    /// Embed texts, one vector per text, in order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embedding.embed_texts(texts).await
    }

    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        self.embedding.embed_single(text).await
    }

    // ========================================================================
    // Observability and lifecycle
    // ========================================================================

    pub fn stats(&self) -> PerformanceStats {
        self.pipeline.monitor().stats()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.pipeline.cache().stats().await
    }

    /// Drop expired cache entries now; returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        self.pipeline.cache().cleanup_expired().await
    }

    /// Sweep expired cache entries every `interval` in the background.
    pub fn spawn_cache_janitor(&self, interval: Duration) -> JoinHandle<()> {
        Arc::clone(self.pipeline.cache()).spawn_janitor(interval)
    }

    pub fn reset_stats(&self) {
        self.pipeline.monitor().reset();
    }

    /// Dispatch pending embedding batches and wait for them. Returns how
    /// many texts were flushed.
    pub async fn shutdown(&self) -> usize {
        let flushed = self.embedding.flush().await;
        info!(flushed, "Resilient provider shut down");
        flushed
    }

    pub fn info(&self) -> ProviderInfo {
        let config = self.pipeline.config();
        ProviderInfo {
            client: self.pipeline.client().name().to_string(),
            region: config.region.clone(),
            completion_model: config.completion_model.clone(),
            fast_model: config.fast_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dimension: config.embedding_dimension(),
            max_concurrent_requests: config.max_concurrent_requests,
            rate_limit_per_second: config.rate_limit_per_second,
            rate_limit_burst: config.rate_limit_burst,
            retry_max_attempts: config.retry_max_attempts,
            cache_max_size: config.cache_max_size,
            embedding_batch_size: config.embedding_batch_size,
        }
    }

    /// Check that the completion and embedding models are reachable with
    /// one tiny request each.
    pub async fn validate_access(&self) -> Result<()> {
        let ping = CompletionRequest::new("Hello")
            .with_options(CompletionOptions::default().with_max_tokens(10));
        self.completion.complete(ping).await?;
        self.embedding.embed_single("access check").await?;
        info!("Model access validated");
        Ok(())
    }

    // ========================================================================
    // Components
    // ========================================================================

    pub fn config(&self) -> &ProviderConfig {
        self.pipeline.config()
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn completion(&self) -> &CompletionProvider {
        &self.completion
    }

    pub fn vision(&self) -> &VisionProvider {
        &self.vision
    }

    pub fn embedding(&self) -> &EmbeddingProvider {
        &self.embedding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::providers::MockClient;

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = ProviderConfig {
            cache_max_size: 0,
            ..Default::default()
        };
        let result = ResilientProvider::new(config, Arc::new(MockClient::new()));
        assert!(matches!(result, Err(LlmError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_info() {
        let provider =
            ResilientProvider::new(ProviderConfig::default(), Arc::new(MockClient::new())).unwrap();
        let info = provider.info();
        assert_eq!(info.client, "mock");
        assert_eq!(info.embedding_dimension, 1024);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["region"], "us-east-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_access() {
        let client = Arc::new(MockClient::new());
        let provider = ResilientProvider::new(ProviderConfig::default(), client.clone()).unwrap();
        provider.validate_access().await.unwrap();
        assert_eq!(client.call_count(), 2);
        assert_eq!(client.calls()[0].payload["max_tokens"], 10);
    }
}
