//! Client seam and message types.
//!
//! The resilience layer never talks to the network itself. It calls a
//! [`ModelClient`], an opaque credentialed handle with two operations:
//!
//! ```text
//! ┌────────────────────┐  invoke(model, payload)            ┌──────────────┐
//! │  RequestPipeline   │ ─────────────────────────────────► │ ModelClient  │
//! │ (retry, limits...) │  invoke_streaming(model, payload)  │ (Bedrock,    │
//! └────────────────────┘ ─────────────────────────────────► │  Mock, ...)  │
//!                                                            └──────────────┘
//! ```
//!
//! Payloads and responses are model-native JSON documents; the providers in
//! [`crate::providers`] build and parse them.

use crate::error::{LlmError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Remote client
// ============================================================================

/// Credentialed handle to a remote foundation-model API.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Short client name for logs.
    fn name(&self) -> &str;

    /// Invoke `model_id` with a JSON payload and return the JSON response.
    async fn invoke(&self, model_id: &str, payload: &Value) -> Result<Value>;

    /// Invoke `model_id` and stream back text chunks.
    async fn invoke_streaming(
        &self,
        model_id: &str,
        payload: &Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let _ = (model_id, payload);
        Err(LlmError::NotSupported(format!(
            "streaming is not supported by the {} client",
            self.name()
        )))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A chat message, optionally carrying images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageData>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            images: None,
        }
    }

    /// User message with attached images.
    pub fn user_with_images(content: impl Into<String>, images: Vec<ImageData>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            images: Some(images),
        }
    }

    pub fn has_images(&self) -> bool {
        self.images.as_ref().is_some_and(|images| !images.is_empty())
    }
}

/// Base64-encoded image with its media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// Base64-encoded image data (without data: URI prefix).
    pub data: String,
    /// e.g. "image/png".
    pub mime_type: String,
}

impl ImageData {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Encode raw image bytes, detecting the media type from the content.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mime_type = sniff_media_type(bytes).ok_or_else(|| {
            LlmError::ValidationError("unrecognized image format".to_string())
        })?;
        Ok(Self::new(BASE64.encode(bytes), mime_type))
    }

    /// Accept base64 data (optionally a `data:` URI) and detect its media
    /// type. Undecodable data and unknown formats are rejected.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_resilience::ImageData;
    ///
    /// // 1x1 GIF header is enough for detection.
    /// let image = ImageData::from_base64("R0lGODlhAQABAAAAACw=").unwrap();
    /// assert_eq!(image.mime_type, "image/gif");
    /// ```
    pub fn from_base64(data: &str) -> Result<Self> {
        let data = match data.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => data,
        };
        let data = data.trim();
        let bytes = BASE64
            .decode(data)
            .map_err(|e| LlmError::ValidationError(format!("invalid base64 image data: {e}")))?;
        let mime_type = sniff_media_type(&bytes).ok_or_else(|| {
            LlmError::ValidationError("unrecognized image format".to_string())
        })?;
        Ok(Self::new(data, mime_type))
    }

    /// Size of the image once decoded.
    pub fn decoded_len(&self) -> usize {
        let data = self.data.trim_end().trim_end_matches('=');
        let tail = match data.len() % 4 {
            2 => 1,
            3 => 2,
            _ => 0,
        };
        data.len() / 4 * 3 + tail
    }
}

/// Detect PNG, JPEG, GIF and WebP from their magic bytes.
fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Per-call overrides of the configured inference defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl CompletionOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = Some(stop);
        self
    }
}
