//! The request pipeline shared by every provider.
//!
//! ```text
//!  invoke(op, model, payload)
//!    │
//!    ├─► cache_key ─► lookup ──hit──────────────────────────────► value
//!    │                  │
//!    │                 miss
//!    │                  ▼
//!    │        semaphore permit ─► rate-limit token ─► retry { timeout(client.invoke) }
//!    │                                                      │
//!    │                               record outcome ◄───────┤
//!    │                                                      ▼
//!    └────────────────────────────────────────────── store ─► value
//! ```
//!
//! Requests queue at the semaphore, outside the retry loop, so backoff
//! timing is never stretched by queueing delay. Both the permit and a
//! pending rate-limiter wait are released when the caller's future is
//! dropped.

use crate::cache::{cache_key, ResponseCache};
use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::monitor::{PerformanceMonitor, RequestOutcome};
use crate::pricing::TokenUsage;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryExecutor;
use crate::traits::ModelClient;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error};

/// Remote operation a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Complete,
    AnalyzeImage,
    Embed,
    Stream,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Complete => "complete",
            Operation::AnalyzeImage => "analyze_image",
            Operation::Embed => "embed",
            Operation::Stream => "stream",
        }
    }
}

/// Cache, concurrency bound, rate limit, retry and metrics around one
/// [`ModelClient`].
pub struct RequestPipeline {
    client: Arc<dyn ModelClient>,
    config: Arc<ProviderConfig>,
    semaphore: Arc<Semaphore>,
    rate_limiter: RateLimiter,
    retry: RetryExecutor,
    cache: Arc<ResponseCache<Value>>,
    monitor: Arc<PerformanceMonitor>,
}

impl RequestPipeline {
    pub fn new(
        config: Arc<ProviderConfig>,
        client: Arc<dyn ModelClient>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            rate_limiter: RateLimiter::new(config.rate_limit_per_second, config.rate_limit_burst),
            retry: RetryExecutor::new(Arc::new(config.retry_policy())),
            cache: Arc::new(ResponseCache::new(
                config.cache_max_size,
                config.cache_default_ttl,
            )),
            client,
            config,
            monitor,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<ResponseCache<Value>> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Free remote-call slots right now.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Cache key of a request.
    pub fn key_for(&self, operation: Operation, model_id: &str, payload: &Value) -> String {
        cache_key(operation.as_str(), model_id, payload)
    }

    /// Serve a request from the cache, recording the hit.
    pub async fn lookup(&self, operation: Operation, model_id: &str, key: &str) -> Option<Value> {
        if !self.config.caches(operation) {
            return None;
        }
        let started = Instant::now();
        let value = self.cache.get(key).await?;
        debug!(operation = operation.as_str(), model = model_id, "Cache hit");
        self.monitor.record_outcome(&RequestOutcome {
            operation,
            model_id: model_id.to_string(),
            success: true,
            latency: started.elapsed(),
            cached: true,
            error_kind: None,
            usage: None,
        });
        Some(value)
    }

    /// Store a successful result with the operation's TTL.
    pub async fn store(&self, operation: Operation, key: String, value: Value) {
        if self.config.caches(operation) {
            self.cache
                .put_with_ttl(key, value, self.config.cache_ttl_for(operation))
                .await;
        }
    }

    /// Run one remote call under the concurrency bound, the rate limit and
    /// the retry policy, and record its outcome.
    ///
    /// Errors keep their kind and gain the operation and model in their
    /// message.
    pub async fn execute(
        &self,
        operation: Operation,
        model_id: &str,
        payload: &Value,
    ) -> Result<Value> {
        let started = Instant::now();
        let result = async {
            let _permit = self.semaphore.acquire().await.map_err(|_| closed())?;
            self.admit().await;
            self.retry
                .execute_with_retry(|| {
                    self.bounded(model_id, self.client.invoke(model_id, payload))
                })
                .await
        }
        .await;

        let usage = result.as_ref().ok().and_then(TokenUsage::from_response);
        self.finish(operation, model_id, started, usage, result)
    }

    /// Cache lookup, then [`RequestPipeline::execute`] and store on a miss.
    pub async fn invoke(
        &self,
        operation: Operation,
        model_id: &str,
        payload: Value,
    ) -> Result<Value> {
        let key = self.key_for(operation, model_id, &payload);
        if let Some(hit) = self.lookup(operation, model_id, &key).await {
            return Ok(hit);
        }
        let value = self.execute(operation, model_id, &payload).await?;
        self.store(operation, key, value.clone()).await;
        Ok(value)
    }

    /// Open a streaming call.
    ///
    /// The permit and rate-limit token are taken once; establishing the
    /// stream is retried. The returned stream holds the permit until it is
    /// exhausted or dropped.
    pub async fn stream(
        &self,
        model_id: &str,
        payload: &Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let started = Instant::now();
        let result = async {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| closed())?;
            self.admit().await;
            let stream = self
                .retry
                .execute_with_retry(|| {
                    self.bounded(model_id, self.client.invoke_streaming(model_id, payload))
                })
                .await?;
            Ok((permit, stream))
        }
        .await;

        let (permit, stream) = self.finish(Operation::Stream, model_id, started, None, result)?;
        Ok(stream
            .map(move |chunk| {
                let _held = &permit;
                chunk
            })
            .boxed())
    }

    async fn admit(&self) {
        let waited = self.rate_limiter.acquire().await;
        if !waited.is_zero() {
            self.monitor.record_rate_limit_hit();
        }
    }

    /// One attempt, bounded by the request timeout.
    async fn bounded<T>(
        &self,
        model_id: &str,
        attempt: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.request_timeout;
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(format!(
                "no response from {model_id} within {timeout:?}"
            ))),
        };
        if let Err(LlmError::RateLimited(_)) = &result {
            self.monitor.record_rate_limit_hit();
        }
        result
    }

    fn finish<T>(
        &self,
        operation: Operation,
        model_id: &str,
        started: Instant,
        usage: Option<TokenUsage>,
        result: Result<T>,
    ) -> Result<T> {
        self.monitor.record_outcome(&RequestOutcome {
            operation,
            model_id: model_id.to_string(),
            success: result.is_ok(),
            latency: started.elapsed(),
            cached: false,
            error_kind: result.as_ref().err().map(LlmError::kind),
            usage,
        });
        result.map_err(|e| {
            error!(
                operation = operation.as_str(),
                model = model_id,
                error_kind = %e.kind(),
                error = %e,
                "Model request failed"
            );
            e.with_context(operation.as_str(), model_id)
        })
    }
}

fn closed() -> LlmError {
    LlmError::Cancelled("request pipeline is shut down".to_string())
}
