//! Scripted mock client for testing.
//!
//! [`MockClient`] answers from a FIFO queue of scripted responses, errors
//! and streams. When the queue is empty it falls back to a deterministic
//! answer shaped after the payload:
//!
//! | Payload field | Default response |
//! |---------------|------------------|
//! | `inputText`   | `{"embedding": [...], "inputTextTokenCount": n}` |
//! | `texts`       | `{"embeddings": [[...], ...]}` |
//! | anything else | `{"content": [{"type": "text", "text": "Mock response"}], "usage": {...}}` |
//!
//! Every call is recorded, so tests can assert what reached the "network".

use crate::error::{LlmError, Result};
use crate::traits::ModelClient;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Text returned by the default completion response.
pub const MOCK_RESPONSE_TEXT: &str = "Mock response";

const DEFAULT_DIMENSION: usize = 1024;

/// Token usage reported by the default completion response.
pub const MOCK_INPUT_TOKENS: u64 = 10;
pub const MOCK_OUTPUT_TOKENS: u64 = 2;

#[derive(Debug, Clone)]
enum Scripted {
    Response(Value),
    Error(LlmError),
    Stream(Vec<String>),
}

/// A call received by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub model_id: String,
    pub payload: Value,
    pub streaming: bool,
}

/// Mock [`ModelClient`] with a scripted response queue.
#[derive(Debug, Clone, Default)]
pub struct MockClient {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

/// Decrements the in-flight gauge even when the call is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a raw JSON response.
    pub fn push_response(&self, response: Value) {
        self.script.lock().push_back(Scripted::Response(response));
    }

    /// Queue a completion response carrying `text`.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(json!({
            "content": [{"type": "text", "text": text.into()}],
            "stop_reason": "end_turn",
        }));
    }

    /// Queue an error.
    pub fn push_error(&self, error: LlmError) {
        self.script.lock().push_back(Scripted::Error(error));
    }

    /// Queue a stream of text chunks for the next streaming call.
    pub fn push_stream<S: Into<String>>(&self, chunks: Vec<S>) {
        let chunks = chunks.into_iter().map(Into::into).collect();
        self.script.lock().push_back(Scripted::Stream(chunks));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of simultaneous calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Scripted items not consumed yet.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    async fn begin(&self, model_id: &str, payload: &Value, streaming: bool) -> Option<Scripted> {
        self.calls.lock().push(MockCall {
            model_id: model_id.to_string(),
            payload: payload.clone(),
            streaming,
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.script.lock().pop_front()
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, model_id: &str, payload: &Value) -> Result<Value> {
        match self.begin(model_id, payload, false).await {
            Some(Scripted::Response(value)) => Ok(value),
            Some(Scripted::Error(e)) => Err(e),
            Some(Scripted::Stream(_)) => Err(LlmError::ValidationError(
                "stream scripted for a non-streaming call".to_string(),
            )),
            None => Ok(default_response(payload)),
        }
    }

    async fn invoke_streaming(
        &self,
        model_id: &str,
        payload: &Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let chunks = match self.begin(model_id, payload, true).await {
            Some(Scripted::Stream(chunks)) => chunks,
            Some(Scripted::Error(e)) => return Err(e),
            Some(Scripted::Response(_)) | None => {
                vec!["Mock ".to_string(), "response".to_string()]
            }
        };
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

fn default_response(payload: &Value) -> Value {
    let dimension = payload
        .get("dimensions")
        .and_then(Value::as_u64)
        .map(|d| d as usize)
        .unwrap_or(DEFAULT_DIMENSION);

    if let Some(text) = payload.get("inputText").and_then(Value::as_str) {
        return json!({
            "embedding": mock_embedding(text, dimension),
            "inputTextTokenCount": text.split_whitespace().count(),
        });
    }
    if let Some(texts) = payload.get("texts").and_then(Value::as_array) {
        let embeddings: Vec<Vec<f32>> = texts
            .iter()
            .map(|t| mock_embedding(t.as_str().unwrap_or_default(), dimension))
            .collect();
        return json!({ "embeddings": embeddings });
    }
    json!({
        "content": [{"type": "text", "text": MOCK_RESPONSE_TEXT}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": MOCK_INPUT_TOKENS, "output_tokens": MOCK_OUTPUT_TOKENS},
    })
}

/// Deterministic pseudo-embedding of `text`, values in `[-1, 1]`.
pub fn mock_embedding(text: &str, dimension: usize) -> Vec<f32> {
    (0..dimension)
        .map(|i| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            (hasher.finish() % 2001) as f32 / 1000.0 - 1.0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_queue_order() {
        let client = MockClient::new();
        client.push_text("first");
        client.push_error(LlmError::RateLimited("slow".into()));

        let first = client.invoke("m", &json!({"messages": []})).await.unwrap();
        assert_eq!(first["content"][0]["text"], "first");
        assert!(matches!(
            client.invoke("m", &json!({})).await,
            Err(LlmError::RateLimited(_))
        ));
        let fallback = client.invoke("m", &json!({})).await.unwrap();
        assert_eq!(fallback["content"][0]["text"], MOCK_RESPONSE_TEXT);
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.remaining(), 0);
    }

    #[tokio::test]
    async fn test_default_embeddings_are_deterministic() {
        let client = MockClient::new();
        let a = client
            .invoke("titan", &json!({"inputText": "hello", "dimensions": 8}))
            .await
            .unwrap();
        let b = client
            .invoke("cohere", &json!({"texts": ["hello", "world"]}))
            .await
            .unwrap();

        let single: Vec<f32> = serde_json::from_value(a["embedding"].clone()).unwrap();
        assert_eq!(single, mock_embedding("hello", 8));
        let batch: Vec<Vec<f32>> = serde_json::from_value(b["embeddings"].clone()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], mock_embedding("hello", DEFAULT_DIMENSION));
        assert_ne!(batch[0], batch[1]);
    }

    #[tokio::test]
    async fn test_streaming() {
        let client = MockClient::new();
        client.push_stream(vec!["a", "b", "c"]);

        let chunks: Vec<String> = client
            .invoke_streaming("m", &json!({}))
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["a", "b", "c"]);
        assert!(client.calls()[0].streaming);
    }

    #[test]
    fn test_mock_embedding_range() {
        let v = mock_embedding("x", 64);
        assert_eq!(v.len(), 64);
        assert!(v.iter().all(|x| (-1.0..=1.0).contains(x)));
    }
}
