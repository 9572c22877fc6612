//! Clients and the operation-specific providers built on the pipeline.

pub mod completion;
pub use completion::{extract_text, CompletionProvider, CompletionRequest};

pub mod vision;
pub use vision::VisionProvider;

pub mod embedding;
pub use embedding::EmbeddingProvider;

pub mod mock;
pub use mock::{mock_embedding, MockCall, MockClient};

#[cfg(feature = "bedrock")]
pub mod bedrock;
#[cfg(feature = "bedrock")]
pub use bedrock::BedrockClient;
