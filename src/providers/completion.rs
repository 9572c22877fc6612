//! Text completion through the request pipeline.
//!
//! Payloads use the Anthropic messages shape accepted by Claude models on
//! Bedrock:
//!
//! ```json
//! {
//!   "anthropic_version": "bedrock-2023-05-31",
//!   "max_tokens": 4096, "temperature": 0.7, "top_p": 0.9, "top_k": 250,
//!   "system": "...",
//!   "messages": [{"role": "user", "content": [{"type": "text", "text": "..."}]}]
//! }
//! ```

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::pipeline::{Operation, RequestPipeline};
use crate::traits::{ChatMessage, ChatRole, CompletionOptions};
use futures::future::join_all;
use futures::stream::BoxStream;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::instrument;

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// A completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Earlier turns; system entries are folded into the system prompt.
    pub history: Vec<ChatMessage>,
    /// Overrides the configured model.
    pub model_id: Option<String>,
    pub options: CompletionOptions,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }
}

impl From<&str> for CompletionRequest {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

impl From<String> for CompletionRequest {
    fn from(prompt: String) -> Self {
        Self::new(prompt)
    }
}

/// Completion operations of the façade.
#[derive(Clone)]
pub struct CompletionProvider {
    pipeline: Arc<RequestPipeline>,
}

impl CompletionProvider {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }

    /// Complete a prompt with the primary (or requested) model.
    #[instrument(skip_all, fields(model = request.model_id.as_deref().unwrap_or("default")))]
    pub async fn complete(&self, request: CompletionRequest) -> Result<String> {
        validate_prompt(&request.prompt)?;
        let config = self.pipeline.config();
        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| config.completion_model.clone());
        let payload = messages_payload(
            config,
            request.system_prompt.as_deref(),
            &request.messages(),
            &request.options,
        );
        let response = self
            .pipeline
            .invoke(Operation::Complete, &model_id, payload)
            .await?;
        Ok(extract_text(&response))
    }

    /// Complete with the fast model unless the request names one.
    pub async fn complete_fast(&self, mut request: CompletionRequest) -> Result<String> {
        if request.model_id.is_none() {
            request.model_id = Some(self.pipeline.config().fast_model.clone());
        }
        self.complete(request).await
    }

    /// Complete several requests concurrently.
    ///
    /// Results are in request order; one failure does not affect the others.
    pub async fn complete_batch(&self, requests: Vec<CompletionRequest>) -> Vec<Result<String>> {
        join_all(requests.into_iter().map(|request| self.complete(request))).await
    }

    /// Stream the completion as text chunks. Streams are never cached.
    pub async fn complete_streaming(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        validate_prompt(&request.prompt)?;
        let config = self.pipeline.config();
        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| config.completion_model.clone());
        let payload = messages_payload(
            config,
            request.system_prompt.as_deref(),
            &request.messages(),
            &request.options,
        );
        self.pipeline.stream(&model_id, &payload).await
    }
}

fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(LlmError::ValidationError(
            "prompt must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Build an Anthropic messages payload.
///
/// System-role messages are moved into the `system` field, after
/// `system_prompt`.
pub(crate) fn messages_payload(
    config: &ProviderConfig,
    system_prompt: Option<&str>,
    messages: &[ChatMessage],
    options: &CompletionOptions,
) -> Value {
    let mut system_parts: Vec<&str> = system_prompt.into_iter().collect();
    let mut turns = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            ChatRole::System => system_parts.push(&message.content),
            ChatRole::User | ChatRole::Assistant => turns.push(message_json(message)),
        }
    }

    let mut payload = Map::new();
    payload.insert("anthropic_version".into(), json!(ANTHROPIC_VERSION));
    payload.insert(
        "max_tokens".into(),
        json!(options.max_tokens.unwrap_or(config.max_tokens)),
    );
    payload.insert(
        "temperature".into(),
        json!(round3(options.temperature.unwrap_or(config.temperature))),
    );
    payload.insert(
        "top_p".into(),
        json!(round3(options.top_p.unwrap_or(config.top_p))),
    );
    payload.insert("top_k".into(), json!(options.top_k.unwrap_or(config.top_k)));
    if !system_parts.is_empty() {
        payload.insert("system".into(), json!(system_parts.join("\n\n")));
    }
    if let Some(stop) = &options.stop_sequences {
        payload.insert("stop_sequences".into(), json!(stop));
    }
    payload.insert("messages".into(), Value::Array(turns));
    Value::Object(payload)
}

fn message_json(message: &ChatMessage) -> Value {
    let mut content: Vec<Value> = message
        .images
        .iter()
        .flatten()
        .map(|image| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.mime_type,
                    "data": image.data,
                }
            })
        })
        .collect();
    content.push(json!({"type": "text", "text": message.content}));
    json!({"role": message.role.as_str(), "content": content})
}

/// `f32` sampling parameters as short decimals (0.7, not 0.699999988...).
fn round3(value: f32) -> f64 {
    (f64::from(value) * 1000.0).round() / 1000.0
}

/// Text of a completion response: the first text content block, else a
/// top-level `text` field, else "".
pub fn extract_text(response: &Value) -> String {
    let from_blocks = response
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
                .find_map(|b| b.get("text").and_then(Value::as_str))
        });
    from_blocks
        .or_else(|| response.get("text").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::PerformanceMonitor;
    use crate::providers::MockClient;
    use crate::traits::ImageData;
    use futures::StreamExt;

    fn provider(client: Arc<MockClient>) -> CompletionProvider {
        let pipeline = RequestPipeline::new(
            Arc::new(ProviderConfig::default()),
            client,
            Arc::new(PerformanceMonitor::new(100)),
        );
        CompletionProvider::new(Arc::new(pipeline))
    }

    #[test]
    fn test_payload_shape() {
        let config = ProviderConfig::default();
        let messages = vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello"),
            ChatMessage::user("What is Rust?"),
        ];
        let options = CompletionOptions::default()
            .with_max_tokens(100)
            .with_stop_sequences(vec!["\n\nHuman:".into()]);
        let payload = messages_payload(&config, Some("You are helpful."), &messages, &options);

        assert_eq!(payload["anthropic_version"], ANTHROPIC_VERSION);
        assert_eq!(payload["max_tokens"], 100);
        assert_eq!(payload["temperature"], 0.7);
        assert_eq!(payload["top_k"], 250);
        assert_eq!(payload["system"], "You are helpful.\n\nBe brief.");
        assert_eq!(payload["stop_sequences"][0], "\n\nHuman:");
        let turns = payload["messages"].as_array().unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1]["role"], "assistant");
        assert_eq!(turns[2]["content"][0]["text"], "What is Rust?");
    }

    #[test]
    fn test_payload_with_images() {
        let config = ProviderConfig::default();
        let message = ChatMessage::user_with_images(
            "Describe",
            vec![ImageData::new("AAAA", "image/png")],
        );
        let payload =
            messages_payload(&config, None, &[message], &CompletionOptions::default());
        let content = &payload["messages"][0]["content"];
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["media_type"], "image/png");
        assert_eq!(content[1]["text"], "Describe");
        assert!(payload.get("system").is_none());
    }

    #[test]
    fn test_extract_text() {
        let response = json!({"content": [
            {"type": "tool_use", "id": "x"},
            {"type": "text", "text": "answer"},
            {"type": "text", "text": "second"}
        ]});
        assert_eq!(extract_text(&response), "answer");
        assert_eq!(extract_text(&json!({"text": "legacy"})), "legacy");
        assert_eq!(extract_text(&json!({"other": 1})), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_uses_models() {
        let client = Arc::new(MockClient::new());
        client.push_text("slow answer");
        client.push_text("fast answer");
        let provider = provider(client.clone());

        assert_eq!(provider.complete("q1".into()).await.unwrap(), "slow answer");
        assert_eq!(
            provider.complete_fast("q2".into()).await.unwrap(),
            "fast answer"
        );

        let calls = client.calls();
        let config = ProviderConfig::default();
        assert_eq!(calls[0].model_id, config.completion_model);
        assert_eq!(calls[1].model_id, config.fast_model);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_prompt_rejected_without_call() {
        let client = Arc::new(MockClient::new());
        let provider = provider(client.clone());
        let err = provider.complete("   ".into()).await.unwrap_err();
        assert!(matches!(err, LlmError::ValidationError(_)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_batch_reports_per_item() {
        let client = Arc::new(MockClient::new());
        client.push_text("one");
        client.push_error(LlmError::AccessDenied("no".into()));
        client.push_text("three");
        let provider = provider(client.clone());

        // The client answers in arrival order, which join_all keeps.
        let results = provider
            .complete_batch(vec!["a".into(), "b".into(), "c".into()])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref().unwrap(), "one");
        assert!(matches!(results[1], Err(LlmError::AccessDenied(_))));
        assert_eq!(results[2].as_deref().unwrap(), "three");
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming() {
        let client = Arc::new(MockClient::new());
        client.push_stream(vec!["Hel", "lo"]);
        let provider = provider(client);

        let text: Vec<String> = provider
            .complete_streaming("hi".into())
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(text.concat(), "Hello");
    }
}
