//! End-to-End tests of the resilience layer against the scripted mock client.
//!
//! These exercise the public API only: cache hits avoiding remote calls,
//! retries of throttled calls, batch fan-out, concurrency bounds and
//! streaming cancellation.

use edgequake_resilience::providers::mock::{MOCK_INPUT_TOKENS, MOCK_OUTPUT_TOKENS};
use edgequake_resilience::{
    ChatMessage, CompletionRequest, ErrorKind, ImageData, LlmError, MetricsSink, MockClient,
    ModelPricing, PerformanceMonitor, ProviderConfig, RequestOutcome, ResilientProvider,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Helper Functions
// ============================================================================

fn provider_with(config: ProviderConfig) -> (ResilientProvider, Arc<MockClient>) {
    let client = Arc::new(MockClient::new());
    let provider = ResilientProvider::new(config, client.clone()).unwrap();
    (provider, client)
}

fn provider() -> (ResilientProvider, Arc<MockClient>) {
    provider_with(ProviderConfig::default())
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_hit_avoids_remote_call() {
    let (provider, client) = provider();
    client.push_text("Paris");

    let request = CompletionRequest::new("Capital of France?")
        .with_system_prompt("Answer in one word.")
        .with_history(vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello")]);

    assert_eq!(provider.complete(request.clone()).await.unwrap(), "Paris");
    assert_eq!(provider.complete(request).await.unwrap(), "Paris");
    assert_eq!(client.call_count(), 1);

    let stats = provider.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(provider.cache_stats().await.hits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_caching_can_be_disabled() {
    let (provider, client) = provider_with(ProviderConfig {
        cache_completions: false,
        ..Default::default()
    });

    provider.complete("same").await.unwrap();
    provider.complete("same").await.unwrap();
    assert_eq!(client.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_throttling_is_retried_with_backoff() {
    let (provider, client) = provider();
    client.push_error(LlmError::RateLimited("ThrottlingException".into()));
    client.push_error(LlmError::from_service_code(
        "ServiceUnavailableException",
        "busy",
    ));
    client.push_text("finally");

    let start = Instant::now();
    let answer = provider.complete("hello").await.unwrap();

    assert_eq!(answer, "finally");
    assert_eq!(client.call_count(), 3);
    // Backoffs of at least 1s and 2s.
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(provider.stats().rate_limit_hits, 1);
    assert_eq!(provider.stats().successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_keep_error_kind() {
    let (provider, client) = provider();
    for _ in 0..3 {
        client.push_error(LlmError::RateLimited("slow down".into()));
    }

    let err = provider.complete("hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Throttling);
    assert!(err.to_string().contains("complete model="));
    assert_eq!(client.call_count(), 3);

    let stats = provider.stats();
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.errors_by_kind["throttling"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_errors_fail_fast() {
    let (provider, client) = provider();
    client.push_error(LlmError::from_service_code(
        "ExpiredTokenException",
        "token expired",
    ));

    let err = provider.complete("hello").await.unwrap_err();
    assert!(matches!(err, LlmError::AuthError(_)));
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_complete_batch_partial_failure() {
    let (provider, client) = provider();
    client.push_text("first");
    client.push_error(LlmError::ValidationError("too long".into()));
    client.push_text("third");

    let results = provider.complete_batch(["p1", "p2", "p3"]).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_deref().unwrap(), "first");
    assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::Validation);
    assert_eq!(results[2].as_deref().unwrap(), "third");
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_holds_under_load() {
    let client = Arc::new(MockClient::new().with_latency(Duration::from_millis(200)));
    let config = ProviderConfig {
        max_concurrent_requests: 3,
        rate_limit_per_second: 1000.0,
        rate_limit_burst: 1000,
        ..Default::default()
    };
    let provider = ResilientProvider::new(config, client.clone()).unwrap();

    let prompts: Vec<String> = (0..12).map(|i| format!("prompt {i}")).collect();
    let results = provider.complete_batch(prompts).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(client.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_spaces_requests() {
    let config = ProviderConfig {
        rate_limit_per_second: 2.0,
        rate_limit_burst: 2,
        ..Default::default()
    };
    let (provider, _client) = provider_with(config);

    let start = Instant::now();
    let results = provider
        .complete_batch((0..4).map(|i| format!("q{i}")))
        .await;
    assert!(results.iter().all(|r| r.is_ok()));
    // Two from the burst, then one every 500ms.
    assert!(start.elapsed() >= Duration::from_millis(999));
    assert_eq!(provider.stats().rate_limit_hits, 2);
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_streaming_permit_released_on_drop() {
    let (provider, client) = provider_with(ProviderConfig {
        max_concurrent_requests: 1,
        ..Default::default()
    });
    client.push_stream(vec!["one ", "two ", "three"]);
    client.push_text("after stream");

    let mut stream = provider.complete_streaming("count").await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "one ");
    assert_eq!(provider.pipeline().available_permits(), 0);

    // Abandon the stream early.
    drop(stream);
    assert_eq!(provider.pipeline().available_permits(), 1);
    assert_eq!(provider.complete("next").await.unwrap(), "after stream");
}

#[tokio::test(start_paused = true)]
async fn test_streaming_collects_all_chunks() {
    let (provider, client) = provider();
    client.push_stream(vec!["a", "b", "c"]);

    let chunks: Vec<String> = provider
        .complete_streaming("abc")
        .await
        .unwrap()
        .map(|c| c.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.concat(), "abc");
    assert_eq!(provider.stats().by_operation["stream"].requests, 1);
}

// ============================================================================
// Vision
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_analyze_image() {
    let (provider, client) = provider();
    client.push_text("A red square");

    let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
    let image = ImageData::from_bytes(&png).unwrap();
    let answer = provider
        .analyze_image("Describe the image", image, None)
        .await
        .unwrap();

    assert_eq!(answer, "A red square");
    assert_eq!(provider.stats().by_operation["analyze_image"].requests, 1);
}

// ============================================================================
// Embeddings
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_embeddings_preserve_order_and_cache() {
    let (provider, client) = provider();
    let texts: Vec<String> = ["one", "two", "three", "two"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let vectors = provider.embed_texts(&texts).await.unwrap();
    assert_eq!(vectors.len(), 4);
    assert_eq!(vectors[1], vectors[3]);
    assert_ne!(vectors[0], vectors[1]);
    assert!(vectors.iter().all(|v| v.len() == 1024));
    let remote_calls = client.call_count();
    assert!(remote_calls <= 4);

    // Everything is cached now.
    provider.embed_texts(&texts).await.unwrap();
    assert_eq!(client.call_count(), remote_calls);
}

#[tokio::test(start_paused = true)]
async fn test_cohere_embeddings_are_batched() {
    let (provider, client) = provider_with(ProviderConfig {
        embedding_model: "cohere.embed-multilingual-v3".into(),
        embedding_batch_size: 5,
        ..Default::default()
    });

    let texts: Vec<String> = (0..12).map(|i| format!("text {i}")).collect();
    let vectors = provider.embed_texts(&texts).await.unwrap();

    assert_eq!(vectors.len(), 12);
    let sizes: Vec<usize> = client
        .calls()
        .iter()
        .map(|c| c.payload["texts"].as_array().unwrap().len())
        .collect();
    assert_eq!(sizes, vec![5, 5, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_one_callers_bad_text_does_not_fail_another() {
    let (provider, client) = provider();
    client.push_error(LlmError::ValidationError("text too long".into()));

    let (a, b) = tokio::join!(
        provider.embed_single("text from caller a"),
        provider.embed_single("text from caller b"),
    );

    assert_eq!(client.call_count(), 2);
    assert_eq!(a.is_ok() as usize + b.is_ok() as usize, 1);
    let failed = if a.is_err() { a } else { b };
    assert_eq!(failed.unwrap_err().kind(), ErrorKind::Validation);
}

#[tokio::test(start_paused = true)]
async fn test_embedding_failure_propagates() {
    let (provider, client) = provider_with(ProviderConfig {
        embedding_model: "cohere.embed-english-v3".into(),
        ..Default::default()
    });
    client.push_error(LlmError::AccessDenied("model access not enabled".into()));

    let texts = vec!["a".to_string(), "b".to_string()];
    let err = provider.embed_texts(&texts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

// ============================================================================
// Lifecycle and observability
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_expiry_and_cleanup() {
    let (provider, client) = provider_with(ProviderConfig {
        cache_default_ttl: Some(Duration::from_secs(10)),
        ..Default::default()
    });

    provider.complete("q").await.unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(provider.cleanup_expired().await, 1);

    provider.complete("q").await.unwrap();
    assert_eq!(client.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_token_usage_and_cost_estimate() {
    let mut config = ProviderConfig::default();
    config.model_pricing.insert(
        "claude-3-5-sonnet".to_string(),
        ModelPricing::new(1_000_000.0, 1_000_000.0),
    );
    let (provider, _client) = provider_with(config);

    provider.complete("first").await.unwrap();
    provider.complete("second").await.unwrap();
    provider.complete("second").await.unwrap();

    let stats = provider.stats();
    assert_eq!(stats.input_tokens, 2 * MOCK_INPUT_TOKENS);
    assert_eq!(stats.output_tokens, 2 * MOCK_OUTPUT_TOKENS);
    assert_eq!(stats.total_tokens, 24);
    // One dollar per token at this price; the cache hit is free.
    assert!((stats.estimated_cost_usd - 24.0).abs() < 1e-9);
    let model = &provider.config().completion_model;
    assert!((stats.by_model[model].estimated_cost_usd - 24.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_reset_stats() {
    let (provider, _client) = provider();
    provider.complete("q").await.unwrap();
    provider.reset_stats();
    assert_eq!(provider.stats().total_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_embeddings() {
    let (provider, client) = provider_with(ProviderConfig {
        embedding_batch_timeout: Duration::from_secs(3600),
        ..Default::default()
    });

    let pending = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.embed_single("pending").await })
    };
    while provider.embedding().pending() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(provider.shutdown().await, 1);
    assert_eq!(pending.await.unwrap().unwrap().len(), 1024);
    assert_eq!(client.call_count(), 1);
}

#[derive(Default)]
struct CountingSink {
    failures: AtomicUsize,
}

impl MetricsSink for CountingSink {
    fn record_outcome(&self, outcome: &RequestOutcome) {
        if !outcome.success {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_metrics_sink_sees_failures() {
    let sink = Arc::new(CountingSink::default());
    let client = Arc::new(MockClient::new());
    client.push_error(LlmError::ValidationError("bad".into()));
    let provider = ResilientProvider::with_monitor(
        ProviderConfig::default(),
        client,
        PerformanceMonitor::new(100).with_sink(sink.clone()),
    )
    .unwrap();

    assert!(provider.complete("x").await.is_err());
    assert_eq!(sink.failures.load(Ordering::SeqCst), 1);
}

#[test]
fn test_config_file_round_trip() {
    let config = ProviderConfig::from_toml(
        r#"
        region = "us-west-2"
        max_concurrent_requests = 4
        retry_max_attempts = 5
        "#,
    )
    .unwrap();
    let provider = ResilientProvider::new(config, Arc::new(MockClient::new())).unwrap();
    let info = provider.info();
    assert_eq!(info.region, "us-west-2");
    assert_eq!(info.max_concurrent_requests, 4);
    assert_eq!(info.retry_max_attempts, 5);
}
