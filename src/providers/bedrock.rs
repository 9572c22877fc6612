//! AWS Bedrock Runtime client.
//!
//! Implements [`ModelClient`] with the `InvokeModel` and
//! `InvokeModelWithResponseStream` APIs. Payloads are passed through as
//! model-native JSON; credentials come from the standard AWS chain
//! (environment, profile, IMDS, ...), optionally narrowed to a named profile.
//!
//! SDK failures are translated into [`LlmError`] so that the retry layer can
//! classify them:
//!
//! | SDK failure | Error |
//! |-------------|-------|
//! | timeout | `Timeout` |
//! | dispatch / response I/O failure | `NetworkError` |
//! | service error | by code, see [`LlmError::from_service_code`] |

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::providers::completion::extract_text;
use crate::traits::ModelClient;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use aws_sdk_bedrockruntime::Client;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, instrument};

/// Bedrock Runtime implementation of [`ModelClient`].
#[derive(Debug, Clone)]
pub struct BedrockClient {
    client: Client,
}

impl BedrockClient {
    /// Create a client from an already loaded SDK configuration.
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }

    /// Load credentials for the configured region and profile.
    pub async fn from_config(config: &ProviderConfig) -> Self {
        let mut loader =
            aws_config::from_env().region(aws_config::Region::new(config.region.clone()));
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        let sdk_config = loader.load().await;
        Self::new(&sdk_config)
    }
}

#[async_trait]
impl ModelClient for BedrockClient {
    fn name(&self) -> &str {
        "bedrock"
    }

    #[instrument(skip(self, payload), fields(provider = "bedrock"))]
    async fn invoke(&self, model_id: &str, payload: &Value) -> Result<Value> {
        let body = serde_json::to_vec(payload)?;
        debug!(bytes = body.len(), "Sending Bedrock InvokeModel request");

        let output = self
            .client
            .invoke_model()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(serde_json::from_slice(output.body().as_ref())?)
    }

    #[instrument(skip(self, payload), fields(provider = "bedrock"))]
    async fn invoke_streaming(
        &self,
        model_id: &str,
        payload: &Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let body = serde_json::to_vec(payload)?;
        debug!(bytes = body.len(), "Sending Bedrock InvokeModelWithResponseStream request");

        let output = self
            .client
            .invoke_model_with_response_stream()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await
            .map_err(map_sdk_error)?;

        // State is `None` once an error has been yielded, which ends the stream.
        let chunks = stream::unfold(Some(output.body), |receiver| async move {
            let mut rx = receiver?;
            loop {
                match rx.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let Some(bytes) = part.bytes() else {
                            continue;
                        };
                        match serde_json::from_slice::<Value>(bytes.as_ref()) {
                            Ok(event) => {
                                if let Some(text) = extract_stream_text(&event) {
                                    return Some((Ok(text), Some(rx)));
                                }
                            }
                            Err(e) => return Some((Err(e.into()), None)),
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return None,
                    Err(e) => return Some((Err(map_sdk_error(e)), None)),
                }
            }
        });

        Ok(Box::pin(chunks))
    }
}

/// Translate an SDK error into an [`LlmError`] the retry layer can classify.
fn map_sdk_error<E, R>(err: SdkError<E, R>) -> LlmError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    match &err {
        SdkError::TimeoutError(_) => {
            LlmError::Timeout(DisplayErrorContext(&err).to_string())
        }
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            LlmError::NetworkError(DisplayErrorContext(&err).to_string())
        }
        _ => match err.code() {
            Some(code) => {
                LlmError::from_service_code(code, err.message().unwrap_or("no message"))
            }
            None => LlmError::ModelError(DisplayErrorContext(&err).to_string()),
        },
    }
}

/// Text carried by one streaming event, if any.
///
/// Anthropic models emit `content_block_delta` events; some models send
/// whole messages with `content` blocks instead.
fn extract_stream_text(event: &Value) -> Option<String> {
    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => event
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ if event.get("content").is_some() => {
            Some(extract_text(event)).filter(|text| !text.is_empty())
        }
        _ => None,
    }
}
