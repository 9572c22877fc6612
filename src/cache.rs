//! Response caching for remote model calls.
//!
//! [`ResponseCache`] is a TTL-aware store with least-recently-used eviction.
//! Identical requests (same operation, model and semantically equal payload)
//! map to the same key through [`cache_key`], so repeated prompts and texts
//! are served without a remote round trip.
//!
//! ## Eviction
//!
//! - **TTL**: an entry whose age exceeds its TTL is dropped on the next
//!   `get` or by [`ResponseCache::cleanup_expired`]. Entries stored with no
//!   TTL never expire by time.
//! - **LRU**: after every `put`, entries are evicted from the
//!   least-recently-used end until the cache holds at most `max_size`.
//!
//! Recency is tracked with a monotonically increasing sequence number per
//! touch and an ordered index over those numbers, so a touch or an eviction
//! costs `O(log n)`.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A cached value with metadata.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Option<Duration>,
    access_count: u64,
    /// Position in the recency index.
    seq: u64,
}

impl<V: Clone> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.created_at) > ttl,
            None => false,
        }
    }

    fn access(&mut self) -> V {
        self.access_count += 1;
        self.value.clone()
    }
}

/// Response cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (including expired entries).
    pub misses: u64,
    /// Entries dropped by capacity pressure.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Current number of entries.
    pub entries: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Sum of access counts over live entries.
    pub total_accesses: u64,
}

impl CacheStats {
    /// Get the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// seq -> key, oldest first. Always holds exactly the keys of `entries`.
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V: Clone> CacheInner<V> {
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.seq);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// TTL + LRU cache for remote model responses.
///
/// All operations take a single async mutex, and none of them perform I/O
/// while holding it.
pub struct ResponseCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_size: usize,
    default_ttl: Option<Duration>,
}

impl<V: Clone + Send + 'static> ResponseCache<V> {
    /// Create a cache holding at most `max_size` entries.
    ///
    /// `default_ttl` applies to [`ResponseCache::put`]; `None` stores
    /// entries that only leave the cache under capacity pressure.
    pub fn new(max_size: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    /// Look up a value, refreshing its recency on a hit.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove_entry(key);
            inner.expirations += 1;
            inner.misses += 1;
            tracing::debug!(key, "Cache entry expired");
            return None;
        }

        let seq = inner.bump_seq();
        let inner = &mut *inner;
        let entry = inner.entries.get_mut(key)?;
        inner.recency.remove(&entry.seq);
        entry.seq = seq;
        inner.recency.insert(seq, key.to_string());
        inner.hits += 1;
        Some(entry.access())
    }

    /// Store a value with the default TTL.
    pub async fn put(&self, key: impl Into<String>, value: V) {
        self.put_with_ttl(key, value, self.default_ttl).await;
    }

    /// Store a value with an explicit TTL (`None` = no time-based expiry).
    pub async fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let mut inner = self.inner.lock().await;

        inner.remove_entry(&key);
        let seq = inner.bump_seq();
        inner.recency.insert(seq, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl,
                access_count: 0,
                seq,
            },
        );

        while inner.entries.len() > self.max_size {
            match inner.evict_lru() {
                Some(evicted) => tracing::trace!(key = %evicted, "Evicted LRU cache entry"),
                None => break,
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> bool {
        self.inner.lock().await.remove_entry(key).is_some()
    }

    /// Drop every entry whose TTL has elapsed; returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove_entry(key);
        }
        inner.expirations += expired.len() as u64;

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Swept expired cache entries");
        }
        expired.len()
    }

    /// Remove all entries. Counters are kept.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.recency.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            entries: inner.entries.len(),
            max_size: self.max_size,
            total_accesses: inner.entries.values().map(|e| e.access_count).sum(),
        }
    }

    /// Run [`ResponseCache::cleanup_expired`] every `interval` until the
    /// returned handle is aborted.
    pub fn spawn_janitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()>
    where
        V: Sync,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.cleanup_expired().await;
            }
        })
    }
}

// ============================================================================
// Cache keys
// ============================================================================

/// Top-level payload fields that never take part in a cache key.
const VOLATILE_FIELDS: &[&str] = &["timestamp", "request_id"];

/// Derive a stable cache key for a remote call.
///
/// Object keys are sorted recursively, so two payloads differing only in
/// field order collide; volatile top-level fields are ignored.
///
/// The key is 128 bits: two `DefaultHasher` passes over the canonical form
/// with distinct domain tags. `DefaultHasher` output is only guaranteed for
/// one build of the standard library, so keys are meant for the in-process
/// cache. Do not persist them or share them between processes.
///
/// # Example
///
/// ```
/// use edgequake_resilience::cache_key;
/// use serde_json::json;
///
/// let a = cache_key("complete", "m", &json!({"prompt": "hi", "max_tokens": 5}));
/// let b = cache_key(
///     "complete",
///     "m",
///     &json!({"max_tokens": 5, "prompt": "hi", "request_id": "x"}),
/// );
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 32);
/// ```
pub fn cache_key(operation: &str, model_id: &str, payload: &Value) -> String {
    let mut canonical = String::new();
    match payload {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            write_canonical(&Value::Object(filtered), &mut canonical);
        }
        other => write_canonical(other, &mut canonical),
    }

    let digest = |tag: u8| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        tag.hash(&mut hasher);
        operation.hash(&mut hasher);
        model_id.hash(&mut hasher);
        canonical.hash(&mut hasher);
        hasher.finish()
    };
    format!("{:016x}{:016x}", digest(0), digest(1))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
