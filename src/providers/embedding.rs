//! Text embeddings, coalesced into batches per model.
//!
//! ```text
//! embed_texts([t0, t1, ...])
//!   ├─ blank text ──────────────────────────► zero vector (no remote call)
//!   └─ submit(model, t) ─► BatchCoalescer ─► EmbeddingBatch::process(model, [..])
//!                                              ├─ Titan:  one cached call per text, concurrent
//!                                              └─ Cohere: cache per text, one call for the misses
//! ```
//!
//! Failures propagate to the caller; there is no zero-vector fallback for
//! errors. A failed Titan call fails only the text it carried, even when
//! other callers' texts shared the batch. A failed Cohere call fails every
//! text it carried.

use crate::batch::{BatchCoalescer, BatchConfig, BatchOperation};
use crate::error::{LlmError, Result};
use crate::pipeline::{Operation, RequestPipeline};
use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Longest text sent to an embedding model, in characters.
pub const MAX_EMBEDDING_CHARS: usize = 8000;

/// Request/response shape of an embedding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbeddingFamily {
    /// `{"inputText": ...}` → `{"embedding": [...]}`, one text per call.
    Titan,
    /// `{"texts": [...]}` → `{"embeddings": [[...], ...]}`.
    Cohere,
}

impl EmbeddingFamily {
    fn of(model_id: &str) -> Self {
        if model_id.starts_with("cohere.") {
            EmbeddingFamily::Cohere
        } else {
            EmbeddingFamily::Titan
        }
    }
}

/// The batch operation behind the coalescer. Batch key = model id.
struct EmbeddingBatch {
    pipeline: Arc<RequestPipeline>,
}

impl EmbeddingBatch {
    fn titan_payload(&self, model_id: &str, text: &str) -> Value {
        if model_id.contains("titan-embed-text-v2") {
            json!({
                "inputText": text,
                "dimensions": self.pipeline.config().embedding_dimension(),
                "normalize": true,
            })
        } else {
            json!({ "inputText": text })
        }
    }

    fn cohere_payload(texts: &[&str]) -> Value {
        json!({
            "texts": texts,
            "input_type": "search_document",
            "truncate": "END",
        })
    }

    async fn embed_titan(&self, model_id: &str, text: &str) -> Result<Vec<f32>> {
        let payload = self.titan_payload(model_id, text);
        let response = self
            .pipeline
            .invoke(Operation::Embed, model_id, payload)
            .await?;
        let embedding = response.get("embedding").ok_or_else(|| {
            LlmError::ModelError(format!("{model_id} response has no 'embedding' field"))
        })?;
        parse_vector(embedding)
    }

    async fn embed_cohere(&self, model_id: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = self.pipeline.key_for(
                Operation::Embed,
                model_id,
                &Self::cohere_payload(&[text.as_str()]),
            );
            match self.pipeline.lookup(Operation::Embed, model_id, &key).await {
                Some(cached) => vectors[i] = Some(parse_vector(&cached)?),
                None => misses.push((i, key)),
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<&str> = misses.iter().map(|(i, _)| texts[*i].as_str()).collect();
            debug!(model = model_id, texts = miss_texts.len(), "Embedding cache misses");
            let payload = Self::cohere_payload(&miss_texts);
            let response = self
                .pipeline
                .execute(Operation::Embed, model_id, &payload)
                .await?;
            let embeddings = response
                .get("embeddings")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    LlmError::ModelError(format!("{model_id} response has no 'embeddings' array"))
                })?;
            if embeddings.len() < misses.len() {
                return Err(LlmError::InsufficientBatchResults {
                    expected: misses.len(),
                    received: embeddings.len(),
                });
            }
            for ((i, key), embedding) in misses.into_iter().zip(embeddings) {
                vectors[i] = Some(parse_vector(embedding)?);
                self.pipeline
                    .store(Operation::Embed, key, embedding.clone())
                    .await;
            }
        }

        vectors
            .into_iter()
            .map(|v| v.ok_or_else(|| LlmError::ModelError("missing embedding".to_string())))
            .collect()
    }
}

#[async_trait]
impl BatchOperation<String, Vec<f32>> for EmbeddingBatch {
    async fn process(
        &self,
        model_id: &str,
        texts: Vec<String>,
    ) -> Result<Vec<Result<Vec<f32>>>> {
        match EmbeddingFamily::of(model_id) {
            EmbeddingFamily::Titan => Ok(join_all(
                texts.iter().map(|text| self.embed_titan(model_id, text)),
            )
            .await),
            EmbeddingFamily::Cohere => Ok(self
                .embed_cohere(model_id, texts)
                .await?
                .into_iter()
                .map(Ok)
                .collect()),
        }
    }
}

fn parse_vector(value: &Value) -> Result<Vec<f32>> {
    Ok(serde_json::from_value(value.clone())?)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Embedding operations of the façade.
#[derive(Clone)]
pub struct EmbeddingProvider {
    pipeline: Arc<RequestPipeline>,
    coalescer: BatchCoalescer<String, Vec<f32>>,
}

impl EmbeddingProvider {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        let config = pipeline.config();
        let batch_config = BatchConfig {
            batch_size: config.embedding_batch_size,
            batch_timeout: config.embedding_batch_timeout,
        };
        let operation = Arc::new(EmbeddingBatch {
            pipeline: Arc::clone(&pipeline),
        });
        Self {
            coalescer: BatchCoalescer::new(operation, batch_config),
            pipeline,
        }
    }

    /// Embed `texts`, preserving order.
    #[instrument(skip_all, fields(count = texts.len()))]
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_id = self.pipeline.config().embedding_model.as_str();
        let dimension = self.embedding_dimension();

        try_join_all(texts.iter().map(|text| async move {
            if text.trim().is_empty() {
                return Ok(vec![0.0; dimension]);
            }
            let text = truncate_chars(text, MAX_EMBEDDING_CHARS).to_string();
            self.coalescer.submit(model_id, text).await
        }))
        .await
    }

    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::ModelError("no embedding returned".to_string()))
    }

    /// Width of the produced vectors.
    pub fn embedding_dimension(&self) -> usize {
        self.pipeline.config().embedding_dimension()
    }

    /// Dispatch pending partial batches now; returns how many texts were
    /// flushed.
    pub async fn flush(&self) -> usize {
        self.coalescer.flush().await
    }

    pub fn pending(&self) -> usize {
        self.coalescer.pending_len()
    }
}
