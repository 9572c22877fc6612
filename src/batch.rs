//! Request coalescing for batch-capable remote operations.
//!
//! Many concurrent single-item requests sharing a batch key are merged into
//! one call to a [`BatchOperation`], and each caller gets back the result at
//! its own index.
//!
//! ```text
//!  submit(k, p1) ─┐
//!  submit(k, p2) ─┼─► pending[k] ──(batch_size reached | batch_timeout)──► process(k, [p1, p2, p3])
//!  submit(k, p3) ─┘                                                         │
//!         ▲                                                                 │
//!         └──────────── oneshot slot i ◄── result[i] ───────────────────────┘
//! ```
//!
//! - A batch closes when it reaches `batch_size` or when `batch_timeout` has
//!   elapsed since its first request, whichever comes first. Closing removes
//!   it from the pending set, so the next request for that key starts a new
//!   batch.
//! - Different keys are dispatched independently and concurrently.
//! - The operation returns one `Result` per request, so a failure of one
//!   item reaches only its own caller. If the operation fails as a whole,
//!   every request of that batch gets a clone of the error. If it returns
//!   fewer results than requests, the requests past the end get
//!   [`LlmError::InsufficientBatchResults`].
//! - Dropping a `submit` future before its batch is dispatched removes the
//!   request from the pending batch.

use crate::error::{LlmError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A remote operation that accepts many payloads at once.
///
/// Result `i` must correspond to payload `i`. Return `Err` for failures that
/// hit the whole batch (e.g. a single remote call covering every payload)
/// and an inner `Err` for a failure of one payload.
#[async_trait]
pub trait BatchOperation<P, R>: Send + Sync {
    async fn process(&self, batch_key: &str, payloads: Vec<P>) -> Result<Vec<Result<R>>>;
}

/// Batch closing thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            batch_timeout: Duration::from_millis(50),
        }
    }
}

struct PendingRequest<P, R> {
    id: u64,
    payload: P,
    slot: oneshot::Sender<Result<R>>,
}

struct PendingBatch<P, R> {
    /// Distinguishes this batch from later batches of the same key, so a
    /// stale timer never closes a newer batch.
    generation: u64,
    requests: Vec<PendingRequest<P, R>>,
}

struct PendingState<P, R> {
    batches: HashMap<String, PendingBatch<P, R>>,
    next_id: u64,
    next_generation: u64,
}

struct Shared<P, R> {
    state: Mutex<PendingState<P, R>>,
    operation: Arc<dyn BatchOperation<P, R>>,
    config: BatchConfig,
}

impl<P, R> Shared<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    async fn run_batch(&self, key: String, requests: Vec<PendingRequest<P, R>>) {
        let expected = requests.len();
        let (payloads, slots): (Vec<P>, Vec<_>) =
            requests.into_iter().map(|r| (r.payload, r.slot)).unzip();

        debug!(batch_key = %key, size = expected, "Dispatching batch");

        match self.operation.process(&key, payloads).await {
            Ok(results) => {
                let received = results.len();
                if received < expected {
                    warn!(
                        batch_key = %key,
                        expected,
                        received,
                        "Batch operation returned fewer results than requests"
                    );
                }
                let mut results = results.into_iter();
                for slot in slots {
                    let outcome = results.next().unwrap_or_else(|| {
                        Err(LlmError::InsufficientBatchResults { expected, received })
                    });
                    // The caller may have gone away; nothing to do then.
                    let _ = slot.send(outcome);
                }
            }
            Err(e) => {
                warn!(batch_key = %key, size = expected, error = %e, "Batch operation failed");
                for slot in slots {
                    let _ = slot.send(Err(e.clone()));
                }
            }
        }
    }

    fn take_batch(&self, key: &str, generation: Option<u64>) -> Option<PendingBatch<P, R>> {
        let mut state = self.state.lock();
        match state.batches.get(key) {
            Some(batch) if generation.map_or(true, |g| g == batch.generation) => {
                state.batches.remove(key)
            }
            _ => None,
        }
    }
}

/// Removes a request from its pending batch if the submitter goes away
/// before the batch is dispatched.
struct CancelGuard<'a, P, R> {
    state: &'a Mutex<PendingState<P, R>>,
    key: &'a str,
    id: u64,
    armed: bool,
}

impl<P, R> Drop for CancelGuard<'_, P, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        let now_empty = match state.batches.get_mut(self.key) {
            Some(batch) => {
                batch.requests.retain(|r| r.id != self.id);
                batch.requests.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.batches.remove(self.key);
        }
    }
}

/// Groups concurrent requests per batch key into batched calls.
pub struct BatchCoalescer<P, R> {
    shared: Arc<Shared<P, R>>,
}

impl<P, R> Clone for BatchCoalescer<P, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P, R> BatchCoalescer<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(operation: Arc<dyn BatchOperation<P, R>>, config: BatchConfig) -> Self {
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PendingState {
                    batches: HashMap::new(),
                    next_id: 0,
                    next_generation: 0,
                }),
                operation,
                config,
            }),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.shared.config
    }

    /// Submit one payload and wait for its result.
    pub async fn submit(&self, batch_key: &str, payload: P) -> Result<R> {
        let (tx, rx) = oneshot::channel();

        let (id, full, new_generation) = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            let new_generation = if state.batches.contains_key(batch_key) {
                None
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.batches.insert(
                    batch_key.to_string(),
                    PendingBatch {
                        generation,
                        requests: Vec::new(),
                    },
                );
                Some(generation)
            };

            let full = match state.batches.get_mut(batch_key) {
                Some(batch) => {
                    batch.requests.push(PendingRequest {
                        id,
                        payload,
                        slot: tx,
                    });
                    batch.requests.len() >= self.shared.config.batch_size
                }
                None => false,
            };
            let full = if full {
                state.batches.remove(batch_key)
            } else {
                None
            };
            (id, full, new_generation)
        };

        if let Some(batch) = full {
            self.spawn_batch(batch_key.to_string(), batch);
        } else if let Some(generation) = new_generation {
            self.spawn_timer(batch_key.to_string(), generation);
        }

        let mut guard = CancelGuard {
            state: &self.shared.state,
            key: batch_key,
            id,
            armed: true,
        };
        let outcome = rx.await;
        guard.armed = false;

        outcome.unwrap_or_else(|_| {
            Err(LlmError::Cancelled(format!(
                "batch for '{batch_key}' ended without a result"
            )))
        })
    }

    /// Dispatch every pending batch now and wait for them to finish.
    ///
    /// Returns the number of requests that were flushed.
    pub async fn flush(&self) -> usize {
        let batches: Vec<(String, PendingBatch<P, R>)> =
            self.shared.state.lock().batches.drain().collect();
        let mut flushed = 0;
        let handles: Vec<JoinHandle<()>> = batches
            .into_iter()
            .map(|(key, batch)| {
                flushed += batch.requests.len();
                self.spawn_batch(key, batch)
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Batch task failed during flush");
            }
        }
        flushed
    }

    /// Dispatch the pending batch of one key now, if any, and wait for it.
    pub async fn flush_key(&self, batch_key: &str) -> usize {
        let Some(batch) = self.shared.take_batch(batch_key, None) else {
            return 0;
        };
        let flushed = batch.requests.len();
        if let Err(e) = self.spawn_batch(batch_key.to_string(), batch).await {
            warn!(batch_key, error = %e, "Batch task failed during flush");
        }
        flushed
    }

    /// Requests waiting for their batch to close.
    pub fn pending_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .batches
            .values()
            .map(|b| b.requests.len())
            .sum()
    }

    fn spawn_batch(&self, key: String, batch: PendingBatch<P, R>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.run_batch(key, batch.requests).await })
    }

    fn spawn_timer(&self, key: String, generation: u64) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.batch_timeout).await;
            if let Some(batch) = shared.take_batch(&key, Some(generation)) {
                shared.run_batch(key, batch.requests).await;
            }
        });
    }
}
