//! Retry executor for remote model calls with exponential backoff.
//!
//! # Usage
//!
//! ```
//! use edgequake_resilience::{RetryExecutor, RetryPolicy, LlmError};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), LlmError> {
//! let executor = RetryExecutor::new(Arc::new(RetryPolicy::default()));
//! let text = executor
//!     .execute_with_retry(|| async { Ok::<_, LlmError>("ok".to_string()) })
//!     .await?;
//! assert_eq!(text, "ok");
//! # Ok(())
//! # }
//! ```
//!
//! # State machine
//!
//! ```text
//! ATTEMPT ──ok──────────────────────────────► SUCCESS
//!    │
//!    ├──retryable, attempts left──► BACKOFF ──► ATTEMPT
//!    ├──retryable, exhausted─────────────────► FAIL (last error)
//!    └──non-retryable────────────────────────► FAIL (that error)
//! ```

use crate::error::{ErrorKind, LlmError};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Immutable retry configuration, shared by every call of one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base of the exponential backoff, in seconds. Must be > 1.
    pub backoff_factor: f64,
    /// Upper bound for a single backoff delay.
    pub max_backoff: Duration,
    /// Kinds that trigger a retry. Network and timeout failures are always
    /// retryable.
    pub retryable_kinds: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            retryable_kinds: ErrorKind::transient_defaults(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_factor: f64, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff_factor,
            max_backoff,
            ..Default::default()
        }
    }

    /// Replace the set of retryable kinds.
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Delay before the retry following attempt `attempt` (0-indexed).
    ///
    /// `min(max_backoff, f^n + jitter)` with jitter uniform in
    /// `[0.1, 0.3] * f^n`. Jitter only ever lengthens the delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
        let jitter = rand::thread_rng().gen_range(0.1..=0.3) * base;
        let delay = (base + jitter).min(self.max_backoff.as_secs_f64());
        if delay.is_finite() && delay > 0.0 {
            Duration::from_secs_f64(delay)
        } else {
            self.max_backoff
        }
    }
}

/// Snapshot of a retry decision, for logs and callers that report progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryInfo {
    /// 1-indexed attempt that produced `error`.
    pub attempt: u32,
    pub max_attempts: u32,
    pub error_kind: ErrorKind,
    pub error: String,
    pub retryable: bool,
    /// Delay before the next attempt, if one will be made.
    pub next_delay: Option<Duration>,
}

/// Executes async operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: Arc<RetryPolicy>,
    log_retries: bool,
}

impl RetryExecutor {
    /// Create a new retry executor that logs every retry.
    pub fn new(policy: Arc<RetryPolicy>) -> Self {
        Self {
            policy,
            log_retries: true,
        }
    }

    /// Create a retry executor without logging.
    pub fn silent(policy: Arc<RetryPolicy>) -> Self {
        Self {
            policy,
            log_retries: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether `error` should be retried under this executor's policy.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        let kind = error.kind();
        if kind.is_fatal() {
            return false;
        }
        kind.is_connectivity() || self.policy.retryable_kinds.contains(&kind)
    }

    /// Describe what the executor would do after `attempt` (1-indexed)
    /// failed with `error`.
    pub fn retry_info(&self, attempt: u32, error: &LlmError) -> RetryInfo {
        let retryable = self.should_retry(error);
        let next_delay = (retryable && attempt < self.policy.max_attempts)
            .then(|| self.policy.backoff_delay(attempt.saturating_sub(1)));
        RetryInfo {
            attempt,
            max_attempts: self.policy.max_attempts,
            error_kind: error.kind(),
            error: error.to_string(),
            retryable,
            next_delay,
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the policy's attempts are exhausted.
    ///
    /// The error returned after the final attempt is the last one observed,
    /// unmodified.
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 && self.log_retries {
                        info!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !self.should_retry(&e) {
                        if self.log_retries {
                            debug!(
                                error_kind = %e.kind(),
                                error = %e,
                                "Error is non-retryable, stopping"
                            );
                        }
                        return Err(e);
                    }

                    if attempt + 1 >= max_attempts {
                        if self.log_retries {
                            warn!(
                                attempts = attempt + 1,
                                error_kind = %e.kind(),
                                error = %e,
                                "Operation failed, retries exhausted"
                            );
                        }
                        return Err(e);
                    }

                    let delay = self.policy.backoff_delay(attempt);
                    if self.log_retries {
                        warn!(
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error_kind = %e.kind(),
                            error = %e,
                            "Retryable failure, backing off"
                        );
                    }
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> Arc<RetryPolicy> {
        Arc::new(RetryPolicy::new(max_attempts, 2.0, Duration::from_secs(60)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_retryable_failures() {
        let executor = RetryExecutor::silent(policy(5));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = executor
            .execute_with_retry(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(LlmError::ServiceUnavailable("down".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_called_once() {
        let executor = RetryExecutor::silent(policy(5));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = executor
            .execute_with_retry(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::ValidationError("bad".into())) }
            })
            .await;

        assert!(matches!(result, Err(LlmError::ValidationError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error_unmodified() {
        let executor = RetryExecutor::silent(policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = executor
            .execute_with_retry(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(LlmError::RateLimited(format!("attempt {n}"))) }
            })
            .await;

        match result {
            Err(LlmError::RateLimited(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_scenario_backoff_timing() {
        let executor = RetryExecutor::silent(policy(3));
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let recorder = stamps.clone();

        let result = executor
            .execute_with_retry(|| {
                let recorder = recorder.clone();
                async move {
                    let mut stamps = recorder.lock().await;
                    stamps.push(Instant::now());
                    if stamps.len() <= 2 {
                        Err(LlmError::RateLimited("throttled".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        let stamps = stamps.lock().await;
        assert_eq!(stamps.len(), 3);
        let first_gap = stamps[1] - stamps[0];
        let second_gap = stamps[2] - stamps[1];
        assert!(first_gap >= Duration::from_secs(1), "{first_gap:?}");
        assert!(first_gap <= Duration::from_millis(1300), "{first_gap:?}");
        assert!(second_gap >= Duration::from_secs(2), "{second_gap:?}");
        assert!(second_gap <= Duration::from_millis(2600), "{second_gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_never_retried_even_if_listed() {
        let policy = RetryPolicy::default()
            .with_retryable_kinds([ErrorKind::Authentication, ErrorKind::Throttling]);
        let executor = RetryExecutor::silent(Arc::new(policy));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = executor
            .execute_with_retry(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::AuthError("expired".into())) }
            })
            .await;

        assert!(matches!(result, Err(LlmError::AuthError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_should_retry_classification() {
        let executor = RetryExecutor::silent(Arc::new(
            RetryPolicy::default().with_retryable_kinds([ErrorKind::Throttling]),
        ));
        assert!(executor.should_retry(&LlmError::RateLimited("x".into())));
        assert!(executor.should_retry(&LlmError::NetworkError("x".into())));
        assert!(executor.should_retry(&LlmError::Timeout("x".into())));
        assert!(!executor.should_retry(&LlmError::ServiceUnavailable("x".into())));
        assert!(!executor.should_retry(&LlmError::AccessDenied("x".into())));
        assert!(!executor.should_retry(&LlmError::InsufficientBatchResults {
            expected: 2,
            received: 1
        }));
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy::new(10, 2.0, Duration::from_secs(60));
        let eps = 1e-6;
        for n in 0..10u32 {
            let base = 2f64.powi(n as i32);
            for _ in 0..50 {
                let delay = policy.backoff_delay(n).as_secs_f64();
                assert!(delay + eps >= base.min(60.0), "n={n} delay={delay}");
                assert!(delay <= 60.0 + 0.3 * base + eps, "n={n} delay={delay}");
                if base * 1.3 < 60.0 {
                    assert!(delay <= base * 1.3 + eps, "n={n} delay={delay}");
                }
            }
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(20, 3.0, Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(15), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_info() {
        let executor = RetryExecutor::silent(policy(3));
        let info = executor.retry_info(1, &LlmError::RateLimited("slow".into()));
        assert!(info.retryable);
        assert_eq!(info.error_kind, ErrorKind::Throttling);
        assert!(info.next_delay.unwrap() >= Duration::from_secs(1));

        let info = executor.retry_info(3, &LlmError::RateLimited("slow".into()));
        assert_eq!(info.next_delay, None);

        let info = executor.retry_info(1, &LlmError::ValidationError("bad".into()));
        assert!(!info.retryable);
        assert_eq!(info.next_delay, None);
    }
}
