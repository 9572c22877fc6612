//! Performance monitoring for remote model calls.
//!
//! [`PerformanceMonitor`] is a pure accumulator: counters for requests,
//! successes, failures, cache hits and rate-limit hits, per-operation,
//! per-model and per-error-kind breakdowns, and a bounded window of recent
//! latencies.
//!
//! Outcomes carrying [`TokenUsage`] add to the token counters and to an
//! estimated cost, priced by the monitor's [`PricingTable`].
//!
//! ## Percentiles are approximate
//!
//! p50/p95/p99 are computed over the most recent `window` latencies only
//! (oldest samples are dropped once the window is full), using the
//! nearest-rank index `floor(len * p)`. They describe recent behaviour, not
//! the whole process lifetime.
//!
//! Every recording method is synchronous and infallible, so the monitor can
//! be fed from any completion path, including `Drop`.

use crate::error::ErrorKind;
use crate::pipeline::Operation;
use crate::pricing::{PricingTable, TokenUsage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// One finished request, as seen by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub operation: Operation,
    pub model_id: String,
    pub success: bool,
    pub latency: Duration,
    pub cached: bool,
    pub error_kind: Option<ErrorKind>,
    /// Tokens reported by the response; `None` for cache hits and failures.
    pub usage: Option<TokenUsage>,
}

/// Push-only export target for metrics (e.g. a CloudWatch publisher).
pub trait MetricsSink: Send + Sync {
    fn record_outcome(&self, outcome: &RequestOutcome);

    fn record_rate_limit_hit(&self) {}
}

/// Emits every outcome as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_outcome(&self, outcome: &RequestOutcome) {
        if outcome.success {
            debug!(
                operation = outcome.operation.as_str(),
                model = %outcome.model_id,
                latency_ms = outcome.latency.as_millis() as u64,
                cached = outcome.cached,
                input_tokens = outcome.usage.map(|u| u.input_tokens).unwrap_or(0),
                output_tokens = outcome.usage.map(|u| u.output_tokens).unwrap_or(0),
                "Model request completed"
            );
        } else {
            info!(
                operation = outcome.operation.as_str(),
                model = %outcome.model_id,
                latency_ms = outcome.latency.as_millis() as u64,
                error_kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                "Model request failed"
            );
        }
    }

    fn record_rate_limit_hit(&self) {
        debug!("Rate limit hit");
    }
}

/// Request counts for one operation or model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakdownStats {
    pub requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub total_latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl BreakdownStats {
    fn add(&mut self, outcome: &RequestOutcome, cost: f64) {
        self.requests += 1;
        if let Some(usage) = outcome.usage {
            self.input_tokens += usage.input_tokens;
            self.output_tokens += usage.output_tokens;
        }
        self.estimated_cost_usd += cost;
        if !outcome.success {
            self.failures += 1;
        }
        if outcome.cached {
            self.cache_hits += 1;
        }
        self.total_latency_ms += outcome.latency.as_secs_f64() * 1000.0;
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms / self.requests as f64
        }
    }
}

/// Snapshot returned by [`PerformanceMonitor::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub rate_limit_hits: u64,
    pub avg_latency_ms: f64,
    /// Approximate, over the recent latency window.
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub latency_samples: usize,
    pub uptime_secs: f64,
    pub requests_per_minute: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Sum of per-model estimates; see [`PricingTable`].
    pub estimated_cost_usd: f64,
    pub by_operation: BTreeMap<String, BreakdownStats>,
    pub by_model: BTreeMap<String, BreakdownStats>,
    pub errors_by_kind: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Breakdown {
    by_operation: HashMap<Operation, BreakdownStats>,
    by_model: HashMap<String, BreakdownStats>,
    errors: HashMap<ErrorKind, u64>,
    estimated_cost_usd: f64,
}

/// Process-lifetime accumulator of request metrics.
pub struct PerformanceMonitor {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limit_hits: AtomicU64,
    total_latency_us: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    pricing: PricingTable,
    window_size: usize,
    latencies: Mutex<VecDeque<Duration>>,
    breakdown: Mutex<Breakdown>,
    started_at: Mutex<Instant>,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl PerformanceMonitor {
    /// Create a monitor keeping the `window_size` most recent latencies.
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            pricing: PricingTable::default(),
            window_size,
            latencies: Mutex::new(VecDeque::with_capacity(window_size)),
            breakdown: Mutex::new(Breakdown::default()),
            started_at: Mutex::new(Instant::now()),
            sinks: Vec::new(),
        }
    }

    /// Forward every outcome and rate-limit hit to `sink` as well.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Price token usage with `pricing` instead of the default table.
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Record a finished request.
    pub fn record_request(&self, success: bool, latency: Duration, cached: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        if cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);

        let mut latencies = self.latencies.lock();
        if latencies.len() == self.window_size {
            latencies.pop_front();
        }
        latencies.push_back(latency);
    }

    /// Record a request with its operation, model and error kind.
    pub fn record_outcome(&self, outcome: &RequestOutcome) {
        self.record_request(outcome.success, outcome.latency, outcome.cached);
        let cost = match outcome.usage {
            Some(usage) => {
                self.input_tokens
                    .fetch_add(usage.input_tokens, Ordering::Relaxed);
                self.output_tokens
                    .fetch_add(usage.output_tokens, Ordering::Relaxed);
                self.pricing.estimate(&outcome.model_id, &usage)
            }
            None => 0.0,
        };
        {
            let mut breakdown = self.breakdown.lock();
            breakdown.estimated_cost_usd += cost;
            breakdown
                .by_operation
                .entry(outcome.operation)
                .or_default()
                .add(outcome, cost);
            breakdown
                .by_model
                .entry(outcome.model_id.clone())
                .or_default()
                .add(outcome, cost);
            if let Some(kind) = outcome.error_kind {
                *breakdown.errors.entry(kind).or_insert(0) += 1;
            }
        }
        for sink in &self.sinks {
            sink.record_outcome(outcome);
        }
    }

    /// Count an admission delay or a remote throttling response.
    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        for sink in &self.sinks {
            sink.record_rate_limit_hit();
        }
    }

    /// Aggregate snapshot of everything recorded since creation or the last
    /// [`PerformanceMonitor::reset`].
    pub fn stats(&self) -> PerformanceStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let total_latency_us = self.total_latency_us.load(Ordering::Relaxed);
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);

        let mut sorted: Vec<Duration> = self.latencies.lock().iter().copied().collect();
        sorted.sort_unstable();

        let uptime = self.started_at.lock().elapsed().as_secs_f64();
        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        let breakdown = self.breakdown.lock();
        PerformanceStats {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate: ratio(successful, total),
            cache_hits,
            cache_misses,
            cache_hit_rate: ratio(cache_hits, cache_hits + cache_misses),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            avg_latency_ms: ratio(total_latency_us, total) / 1000.0,
            p50_latency_ms: percentile_ms(&sorted, 0.50),
            p95_latency_ms: percentile_ms(&sorted, 0.95),
            p99_latency_ms: percentile_ms(&sorted, 0.99),
            latency_samples: sorted.len(),
            uptime_secs: uptime,
            requests_per_minute: if uptime > 0.0 {
                total as f64 * 60.0 / uptime
            } else {
                0.0
            },
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost_usd: breakdown.estimated_cost_usd,
            by_operation: breakdown
                .by_operation
                .iter()
                .map(|(op, s)| (op.as_str().to_string(), s.clone()))
                .collect(),
            by_model: breakdown
                .by_model
                .iter()
                .map(|(model, s)| (model.clone(), s.clone()))
                .collect(),
            errors_by_kind: breakdown
                .errors
                .iter()
                .map(|(kind, n)| (kind.as_str().to_string(), *n))
                .collect(),
        }
    }

    /// Clear every counter and the latency window.
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.successful_requests,
            &self.failed_requests,
            &self.cache_hits,
            &self.cache_misses,
            &self.rate_limit_hits,
            &self.total_latency_us,
            &self.input_tokens,
            &self.output_tokens,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.latencies.lock().clear();
        *self.breakdown.lock() = Breakdown::default();
        *self.started_at.lock() = Instant::now();
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn percentile_ms(sorted: &[Duration], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
    sorted[idx].as_secs_f64() * 1000.0
}
