//! Error types for resilient model calls.
//!
//! # Error Handling Philosophy
//!
//! Callers must be able to branch on *what* went wrong, so errors are never
//! collapsed into a generic "request failed":
//! 1. **Kind-preserving**: the retry layer re-raises the last error unmodified
//! 2. **Classified**: every error carries an [`ErrorKind`] that retry policies
//!    and metrics key on
//! 3. **Contextual**: the façade adds the remote operation and model to the
//!    message without changing the variant
//!
//! # Common Errors and Solutions
//!
//! | Error | Cause | Retried | Solution |
//! |-------|-------|---------|----------|
//! | `ConfigError` | Invalid `ProviderConfig` | never | Fix the configuration |
//! | `AuthError` | Missing/expired credentials | never | Refresh credentials |
//! | `RateLimited` | Service throttling | yes | Lower `rate_limit_per_second` |
//! | `ServiceUnavailable` / `InternalServerError` | Remote outage | yes | Wait |
//! | `ModelTimeout` / `ModelNotReady` / `Timeout` | Slow or cold model | yes | Raise `request_timeout` |
//! | `ValidationError` / `AccessDenied` | Bad request or IAM policy | no | Fix the request / grant access |
//! | `InsufficientBatchResults` | Batch call returned too few items | no | Inspect the batch operation |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Result type for resilient model operations.
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// Error Kind
// ============================================================================

/// Classification tag carried by every [`LlmError`].
///
/// Retry policies hold a set of retryable kinds and the performance monitor
/// counts failures per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Throttling,
    ServiceUnavailable,
    InternalServer,
    ModelTimeout,
    ModelNotReady,
    Timeout,
    Network,
    Validation,
    AccessDenied,
    Model,
    Serialization,
    InsufficientBatchResults,
    NotSupported,
    Cancelled,
}

impl ErrorKind {
    /// Kinds that are retryable under the default policy.
    ///
    /// Generic connectivity failures (`Network`, `Timeout`) are always
    /// retryable and therefore not listed here.
    pub fn transient_defaults() -> HashSet<ErrorKind> {
        [
            ErrorKind::Throttling,
            ErrorKind::ServiceUnavailable,
            ErrorKind::InternalServer,
            ErrorKind::ModelTimeout,
            ErrorKind::ModelNotReady,
        ]
        .into_iter()
        .collect()
    }

    /// Map a remote service error code to a kind.
    ///
    /// Unknown codes map to [`ErrorKind::Model`].
    pub fn from_service_code(code: &str) -> Self {
        match code {
            "ThrottlingException" | "TooManyRequestsException" => ErrorKind::Throttling,
            "ServiceUnavailableException" => ErrorKind::ServiceUnavailable,
            "InternalServerException" | "InternalFailure" => ErrorKind::InternalServer,
            "ModelTimeoutException" => ErrorKind::ModelTimeout,
            "ModelNotReadyException" => ErrorKind::ModelNotReady,
            "ValidationException" | "ModelErrorException" => ErrorKind::Validation,
            "AccessDeniedException" => ErrorKind::AccessDenied,
            "UnrecognizedClientException"
            | "ExpiredTokenException"
            | "InvalidSignatureException"
            | "MissingAuthenticationTokenException" => ErrorKind::Authentication,
            _ => ErrorKind::Model,
        }
    }

    /// Stable snake_case name, used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Throttling => "throttling",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InternalServer => "internal_server",
            ErrorKind::ModelTimeout => "model_timeout",
            ErrorKind::ModelNotReady => "model_not_ready",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::Model => "model",
            ErrorKind::Serialization => "serialization",
            ErrorKind::InsufficientBatchResults => "insufficient_batch_results",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Generic connectivity failures, retryable regardless of policy.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }

    /// Kinds that are never retried, even when a policy lists them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::Configuration
                | ErrorKind::Authentication
                | ErrorKind::InsufficientBatchResults
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LLM Error Types
// ============================================================================

/// Errors that can occur while executing remote model calls.
///
/// `Clone` so that a single batch failure can be delivered to every request
/// of that batch.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Invalid configuration, surfaced at construction.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Credential problem; waiting does not fix it.
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Remote throttling.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Remote service temporarily unavailable.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Remote internal failure.
    #[error("Internal service error: {0}")]
    InternalServerError(String),

    /// The model itself timed out while generating.
    #[error("Model timed out: {0}")]
    ModelTimeout(String),

    /// The model is still being provisioned.
    #[error("Model not ready: {0}")]
    ModelNotReady(String),

    /// No response within the request timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connectivity failure.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Malformed or rejected request.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Caller is not allowed to use the model.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Any other model/service failure.
    #[error("Model error: {0}")]
    ModelError(String),

    /// Request or response (de)serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A batch operation returned fewer results than requests.
    #[error("Batch processing returned insufficient results: expected {expected}, got {received}")]
    InsufficientBatchResults { expected: usize, received: usize },

    /// Feature not supported by the client.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The request was dropped before a result was produced.
    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::SerializationError(err.to_string())
    }
}

impl LlmError {
    /// Build an error from a remote service error code and message.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_resilience::{ErrorKind, LlmError};
    ///
    /// let error = LlmError::from_service_code("ThrottlingException", "slow down");
    /// assert_eq!(error.kind(), ErrorKind::Throttling);
    /// ```
    pub fn from_service_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorKind::from_service_code(code) {
            ErrorKind::Throttling => LlmError::RateLimited(message),
            ErrorKind::ServiceUnavailable => LlmError::ServiceUnavailable(message),
            ErrorKind::InternalServer => LlmError::InternalServerError(message),
            ErrorKind::ModelTimeout => LlmError::ModelTimeout(message),
            ErrorKind::ModelNotReady => LlmError::ModelNotReady(message),
            ErrorKind::Validation => LlmError::ValidationError(message),
            ErrorKind::AccessDenied => LlmError::AccessDenied(message),
            ErrorKind::Authentication => LlmError::AuthError(message),
            _ => LlmError::ModelError(format!("{code}: {message}")),
        }
    }

    /// Get the classification tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigError(_) => ErrorKind::Configuration,
            Self::AuthError(_) => ErrorKind::Authentication,
            Self::RateLimited(_) => ErrorKind::Throttling,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::InternalServerError(_) => ErrorKind::InternalServer,
            Self::ModelTimeout(_) => ErrorKind::ModelTimeout,
            Self::ModelNotReady(_) => ErrorKind::ModelNotReady,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NetworkError(_) => ErrorKind::Network,
            Self::ValidationError(_) => ErrorKind::Validation,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::ModelError(_) => ErrorKind::Model,
            Self::SerializationError(_) => ErrorKind::Serialization,
            Self::InsufficientBatchResults { .. } => ErrorKind::InsufficientBatchResults,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether the default policy treats this error as transient.
    pub fn is_transient(&self) -> bool {
        let kind = self.kind();
        kind.is_connectivity() || ErrorKind::transient_defaults().contains(&kind)
    }

    /// Prefix the message with the remote operation and model.
    ///
    /// The variant (and therefore [`LlmError::kind`]) is unchanged.
    pub fn with_context(self, operation: &str, model_id: &str) -> Self {
        let wrap = |msg: String| format!("[{operation} model={model_id}] {msg}");
        match self {
            Self::ConfigError(m) => Self::ConfigError(wrap(m)),
            Self::AuthError(m) => Self::AuthError(wrap(m)),
            Self::RateLimited(m) => Self::RateLimited(wrap(m)),
            Self::ServiceUnavailable(m) => Self::ServiceUnavailable(wrap(m)),
            Self::InternalServerError(m) => Self::InternalServerError(wrap(m)),
            Self::ModelTimeout(m) => Self::ModelTimeout(wrap(m)),
            Self::ModelNotReady(m) => Self::ModelNotReady(wrap(m)),
            Self::Timeout(m) => Self::Timeout(wrap(m)),
            Self::NetworkError(m) => Self::NetworkError(wrap(m)),
            Self::ValidationError(m) => Self::ValidationError(wrap(m)),
            Self::AccessDenied(m) => Self::AccessDenied(wrap(m)),
            Self::ModelError(m) => Self::ModelError(wrap(m)),
            Self::SerializationError(m) => Self::SerializationError(wrap(m)),
            Self::NotSupported(m) => Self::NotSupported(wrap(m)),
            Self::Cancelled(m) => Self::Cancelled(wrap(m)),
            e @ Self::InsufficientBatchResults { .. } => e,
        }
    }

    /// Get a user-friendly description of the error with suggested action.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_resilience::LlmError;
    ///
    /// let error = LlmError::AuthError("expired token".to_string());
    /// assert!(error.user_description().contains("credentials"));
    /// ```
    pub fn user_description(&self) -> String {
        match self {
            Self::ConfigError(msg) => format!("Configuration error: {}.", msg),
            Self::AuthError(_) => {
                "Authentication failed. Check that your AWS credentials are valid and not expired."
                    .to_string()
            }
            Self::RateLimited(_) => {
                "Throttled by the model service. Lower the request rate or retry later.".to_string()
            }
            Self::ServiceUnavailable(_) | Self::InternalServerError(_) => {
                "The model service is having problems. Retrying usually helps.".to_string()
            }
            Self::ModelTimeout(_) | Self::Timeout(_) => {
                "The model did not answer in time. Increase the request timeout or retry."
                    .to_string()
            }
            Self::ModelNotReady(_) => {
                "The model is still being provisioned. Retry in a few seconds.".to_string()
            }
            Self::NetworkError(_) => {
                "Unable to reach the model service. Check your network connection.".to_string()
            }
            Self::ValidationError(msg) => {
                format!("Invalid request: {}. Check your parameters.", msg)
            }
            Self::AccessDenied(_) => {
                "Access to the model was denied. Enable model access for this account.".to_string()
            }
            Self::ModelError(msg) => format!("The model returned an error: {}", msg),
            Self::SerializationError(_) => {
                "Failed to encode the request or parse the response.".to_string()
            }
            Self::InsufficientBatchResults { expected, received } => format!(
                "Batch call returned {} results for {} requests.",
                received, expected
            ),
            Self::NotSupported(feature) => {
                format!("Feature '{}' is not supported by this client.", feature)
            }
            Self::Cancelled(_) => "The request was cancelled before completing.".to_string(),
        }
    }
}
