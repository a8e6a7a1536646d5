//! Content-hash deduplication for webhook deliveries.
//!
//! Providers redeliver webhooks, sometimes with fresh delivery IDs for
//! the same logical event. Deduplication therefore keys on the content:
//! the lowercase-hex SHA-256 of the raw body bytes, scoped by provider
//! (the same payload from two providers is not a duplicate).
//!
//! Two tiers answer "have we seen this?":
//!
//! 1. An in-memory TTL cache of recently seen `provider:hash` keys. A
//!    cache hit is trusted; entries expire after the TTL (default 5
//!    minutes).
//! 2. The store's uniqueness index, probed on a cache miss.
//!
//! The cache also records misses (negative caching). That is safe
//! because the store insert races on a `(provider, hash)` unique index:
//! when two concurrent requests both miss, exactly one insert wins and
//! the loser is translated to the duplicate response by the repository.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::EventStore;

/// Default TTL for cache entries (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::minutes(5);

/// Default soft size budget for the cache.
pub const DEFAULT_SOFT_CAP: usize = 10_000;

/// Error returned when parsing an invalid event hash.
#[derive(Debug, Clone, Error)]
#[error("invalid event hash: expected 64 hex characters, got {len} bytes: {preview}")]
pub struct InvalidEventHash {
    len: usize,
    preview: String,
}

/// A content hash: exactly 64 lowercase hex characters (SHA-256 output).
///
/// Construction is only possible via [`compute_hash`] or
/// [`EventHash::parse`], so a value of this type is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EventHash(String);

impl EventHash {
    /// Parses a string as an event hash, validating that it is exactly
    /// 64 hex characters. Uppercase input is normalized to lowercase.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidEventHash> {
        let s = s.into();
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(EventHash(s.to_ascii_lowercase()))
        } else {
            Err(InvalidEventHash {
                len: s.len(),
                preview: s.chars().take(20).collect(),
            })
        }
    }

    /// Returns the hash as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (8-character) prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Computes the canonical content hash of a payload.
///
/// Pure function over the raw bytes; the result is the lowercase-hex
/// SHA-256 digest, always 64 characters.
pub fn compute_hash(body: &[u8]) -> EventHash {
    EventHash(hex::encode(Sha256::digest(body)))
}

/// Builds the cache key for a `(provider, hash)` pair.
fn cache_key(provider: &str, hash: &EventHash) -> String {
    format!("{provider}:{hash}")
}

/// In-memory TTL cache of recently seen dedup keys.
///
/// Entry existence is a hint that a duplicate likely exists; the
/// authoritative answer is always the store's uniqueness index, so
/// eviction may be lazy and racy without affecting correctness.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    soft_cap: usize,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
    sweeping: AtomicBool,
}

impl DedupCache {
    /// Creates a cache with the given TTL and soft size budget.
    pub fn new(ttl: Duration, soft_cap: usize) -> Self {
        Self {
            ttl,
            soft_cap,
            seen: Mutex::new(HashMap::new()),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Creates a cache with the default TTL and size budget.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SOFT_CAP)
    }

    /// Checks whether a key was seen within the TTL.
    ///
    /// An expired entry is evicted on the way out and counts as unseen.
    pub fn is_seen(&self, key: &str) -> bool {
        let mut seen = self.lock();
        match seen.get(key) {
            Some(observed_at) if Utc::now() - *observed_at <= self.ttl => true,
            Some(_) => {
                seen.remove(key);
                false
            }
            None => false,
        }
    }

    /// Records a key as seen now.
    pub fn mark_seen(&self, key: String) {
        self.lock().insert(key, Utc::now());
    }

    /// Evicts every entry older than the TTL. Returns the number of
    /// entries removed.
    pub fn evict_expired(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, observed_at| *observed_at > cutoff);
        before - seen.len()
    }

    /// Current number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Spawns a background eviction sweep when the cache exceeds its
    /// soft budget and no sweep is already running.
    ///
    /// There is no hard cap: entries surviving past the budget are
    /// merely re-checked against the store after they expire.
    pub fn maybe_spawn_sweep(cache: &Arc<Self>) {
        if cache.len() <= cache.soft_cap {
            return;
        }
        if cache.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = Arc::clone(cache);
        tokio::spawn(async move {
            let evicted = cache.evict_expired();
            cache.sweeping.store(false, Ordering::Release);
            debug!(evicted, remaining = cache.len(), "dedup cache sweep finished");
        });
    }

    /// Locks the map, tolerating poisoning: the cache is a hint, and a
    /// panicking writer cannot corrupt anything the store would not
    /// catch.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn mark_seen_at(&self, key: String, observed_at: DateTime<Utc>) {
        self.lock().insert(key, observed_at);
    }
}

/// The deduplicator's answer for one delivery.
#[derive(Debug, Clone)]
pub struct DedupDecision {
    /// Whether a row for this `(provider, hash)` likely already exists.
    pub duplicate: bool,
    /// The content hash computed for the delivery; the repository inserts
    /// with exactly this value.
    pub hash: EventHash,
}

/// Two-tier duplicate detector: in-memory TTL cache over the store's
/// uniqueness index.
///
/// Read-only with respect to the store; the only writes it performs are
/// cache inserts.
#[derive(Debug)]
pub struct Deduplicator<S> {
    cache: Arc<DedupCache>,
    store: Arc<S>,
}

impl<S> Clone for Deduplicator<S> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: EventStore> Deduplicator<S> {
    /// Creates a deduplicator over the given cache and store.
    pub fn new(cache: Arc<DedupCache>, store: Arc<S>) -> Self {
        Self { cache, store }
    }

    /// Decides whether a delivery is a duplicate.
    ///
    /// Performs at most one store read. A failed store probe is treated
    /// as "not a duplicate": the uniqueness index still guards the
    /// subsequent insert, and losing an event is worse than attempting a
    /// redundant insert.
    pub async fn is_duplicate(&self, provider: &str, body: &[u8]) -> DedupDecision {
        let hash = compute_hash(body);
        let key = cache_key(provider, &hash);

        if self.cache.is_seen(&key) {
            return DedupDecision {
                duplicate: true,
                hash,
            };
        }

        match self.store.hash_exists(&hash).await {
            Ok(found) => {
                self.cache.mark_seen(key);
                DedupCache::maybe_spawn_sweep(&self.cache);
                DedupDecision {
                    duplicate: found,
                    hash,
                }
            }
            Err(error) => {
                warn!(
                    provider,
                    hash = hash.short(),
                    %error,
                    "dedup store probe failed, treating delivery as new"
                );
                DedupDecision {
                    duplicate: false,
                    hash,
                }
            }
        }
    }
}
