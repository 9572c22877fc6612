//! End-to-End tests against AWS Bedrock
//!
//! # Environment Variables Required
//!
//! - AWS credentials via standard credential chain (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY,
//!   AWS_PROFILE, IAM roles, etc.)
//! - Model access enabled for the default completion, fast and embedding models
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --features bedrock --test e2e_bedrock -- --ignored
//! ```

#![cfg(feature = "bedrock")]

use edgequake_resilience::{
    CompletionRequest, ErrorKind, ProviderConfig, ResilientProvider,
};
use futures::StreamExt;

async fn create_provider() -> ResilientProvider {
    let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
    let config = ProviderConfig {
        region,
        ..Default::default()
    };
    ResilientProvider::from_bedrock(config)
        .await
        .expect("valid default configuration")
}

#[tokio::test]
#[ignore = "Requires AWS credentials with Bedrock access"]
async fn test_bedrock_complete() {
    let provider = create_provider().await;

    let answer = provider
        .complete("What is 2 + 2? Reply with just the number.")
        .await
        .unwrap();
    println!("Response: {answer}");
    assert!(answer.contains('4'));
}

#[tokio::test]
#[ignore = "Requires AWS credentials with Bedrock access"]
async fn test_bedrock_complete_is_cached() {
    let provider = create_provider().await;
    let request = CompletionRequest::new("Name one primary color. One word.")
        .with_system_prompt("Answer with a single word.");

    let first = provider.complete(request.clone()).await.unwrap();
    let second = provider.complete(request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(provider.stats().cache_hits, 1);
}

#[tokio::test]
#[ignore = "Requires AWS credentials with Bedrock access"]
async fn test_bedrock_streaming() {
    let provider = create_provider().await;

    let mut stream = provider
        .complete_streaming("Count from 1 to 5, separated by spaces.")
        .await
        .unwrap();
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk.unwrap());
    }
    println!("Streamed: {text}");
    assert!(text.contains('5'));
}

#[tokio::test]
#[ignore = "Requires AWS credentials with Bedrock access"]
async fn test_bedrock_embeddings() {
    let provider = create_provider().await;
    let texts = vec![
        "Rust is a systems programming language.".to_string(),
        String::new(),
        "Token buckets smooth request rates.".to_string(),
    ];

    let vectors = provider.embed_texts(&texts).await.unwrap();
    assert_eq!(vectors.len(), 3);
    let dim = provider.info().embedding_dimension;
    assert!(vectors.iter().all(|v| v.len() == dim));
    assert!(vectors[1].iter().all(|x| *x == 0.0));
}

#[tokio::test]
#[ignore = "Requires AWS credentials with Bedrock access"]
async fn test_bedrock_unknown_model_is_not_retried() {
    let provider = create_provider().await;

    let err = provider
        .complete(CompletionRequest::new("hi").with_model("anthropic.no-such-model-v9:0"))
        .await
        .unwrap_err();
    println!("Error: {err}");
    assert!(matches!(
        err.kind(),
        ErrorKind::Validation | ErrorKind::AccessDenied | ErrorKind::Model
    ));
    assert_eq!(provider.stats().total_requests, 1);
}

#[tokio::test]
#[ignore = "Requires AWS credentials with Bedrock access"]
async fn test_bedrock_validate_access() {
    let provider = create_provider().await;
    provider.validate_access().await.unwrap();
}
