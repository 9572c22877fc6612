//! Image analysis with multimodal completion models.

use crate::error::{LlmError, Result};
use crate::pipeline::{Operation, RequestPipeline};
use crate::providers::completion::{extract_text, messages_payload};
use crate::traits::{ChatMessage, ChatRole, CompletionOptions, ImageData};
use std::sync::Arc;
use tracing::instrument;

/// Vision operations of the façade.
#[derive(Clone)]
pub struct VisionProvider {
    pipeline: Arc<RequestPipeline>,
}

impl VisionProvider {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }

    /// Ask `prompt` about one image.
    #[instrument(skip_all, fields(mime_type = %image.mime_type))]
    pub async fn analyze_image(
        &self,
        prompt: &str,
        image: ImageData,
        model_id: Option<&str>,
    ) -> Result<String> {
        self.analyze_images(prompt, vec![image], model_id).await
    }

    /// Ask `prompt` about several images at once.
    pub async fn analyze_images(
        &self,
        prompt: &str,
        images: Vec<ImageData>,
        model_id: Option<&str>,
    ) -> Result<String> {
        if images.is_empty() {
            return Err(LlmError::ValidationError(
                "at least one image is required".to_string(),
            ));
        }
        let message = ChatMessage::user_with_images(prompt, images);
        self.analyze_messages(vec![message], model_id).await
    }

    /// Run a multimodal conversation. A system message becomes the system
    /// prompt.
    pub async fn analyze_messages(
        &self,
        messages: Vec<ChatMessage>,
        model_id: Option<&str>,
    ) -> Result<String> {
        if !messages.iter().any(|m| m.role != ChatRole::System) {
            return Err(LlmError::ValidationError(
                "at least one user message is required".to_string(),
            ));
        }
        for image in messages.iter().filter_map(|m| m.images.as_ref()).flatten() {
            self.check_image(image)?;
        }

        let config = self.pipeline.config();
        let model_id = model_id.unwrap_or(&config.completion_model).to_string();
        let payload = messages_payload(config, None, &messages, &CompletionOptions::default());
        let response = self
            .pipeline
            .invoke(Operation::AnalyzeImage, &model_id, payload)
            .await?;
        Ok(extract_text(&response))
    }

    fn check_image(&self, image: &ImageData) -> Result<()> {
        let limit = self.pipeline.config().max_image_bytes;
        let size = image.decoded_len();
        if size > limit {
            return Err(LlmError::ValidationError(format!(
                "image is {size} bytes, larger than the {limit} byte limit"
            )));
        }
        if !image.mime_type.starts_with("image/") {
            return Err(LlmError::ValidationError(format!(
                "unsupported media type '{}'",
                image.mime_type
            )));
        }
        Ok(())
    }
}
