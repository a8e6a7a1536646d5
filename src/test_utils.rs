//! Shared test infrastructure.
//!
//! [`FakeStore`] is an in-memory [`EventStore`] with the same observable
//! semantics as the PostgreSQL implementation: `(provider, hash)`
//! uniqueness decided atomically, retry-wrapped inserts, and a
//! duplicate outcome for the insert race's loser. It adds failure
//! injection so tests can exercise the retry and fail-open paths.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dedup::{EventHash, compute_hash};
use crate::event::{NewWebhookEvent, StoredWebhookEvent};
use crate::store::{
    EventStore, InsertOutcome, RetryConfig, RetryError, StoreError, StoreErrorKind,
    retry_with_backoff,
};

/// In-memory event store for tests.
pub struct FakeStore {
    rows: Mutex<Vec<StoredWebhookEvent>>,
    probe_count: AtomicU32,
    fail_probes: AtomicBool,
    transient_insert_failures: AtomicU32,
    seed_sequence: AtomicI64,
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            probe_count: AtomicU32::new(0),
            fail_probes: AtomicBool::new(false),
            transient_insert_failures: AtomicU32::new(0),
            seed_sequence: AtomicI64::new(0),
        }
    }

    /// Snapshot of all stored rows.
    pub fn rows(&self) -> Vec<StoredWebhookEvent> {
        self.lock().clone()
    }

    /// Number of `hash_exists` probes made so far.
    pub fn probe_count(&self) -> u32 {
        self.probe_count.load(Ordering::SeqCst)
    }

    /// Makes every subsequent `hash_exists` probe fail (or stop failing).
    pub fn fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `n` insert attempts fail with a transient error.
    pub fn inject_transient_insert_failures(&self, n: u32) {
        self.transient_insert_failures.store(n, Ordering::SeqCst);
    }

    /// Seeds a row directly, bypassing the pipeline. Each seeded row gets
    /// a timestamp one millisecond after the previous one so ordering
    /// assertions are deterministic.
    pub async fn seed(&self, provider: &str, body: &[u8]) {
        let sequence = self.seed_sequence.fetch_add(1, Ordering::SeqCst);
        let received_at = Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .unwrap()
            + chrono::Duration::milliseconds(sequence);
        let hash = compute_hash(body);
        self.lock().push(StoredWebhookEvent {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            event_type: "unknown".to_string(),
            event_data: body.to_vec(),
            event_hash: hash.as_str().to_string(),
            received_at,
            source_address: Some("198.51.100.5".to_string()),
            headers: Some(serde_json::json!({})),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredWebhookEvent>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One insert attempt with the uniqueness check done atomically,
    /// mirroring the database's unique index.
    async fn insert_once(&self, event: &NewWebhookEvent) -> Result<Uuid, StoreError> {
        if self
            .transient_insert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::transient("injected failure"));
        }

        let mut rows = self.lock();
        let exists = rows
            .iter()
            .any(|r| r.provider == event.provider && r.event_hash == event.hash.as_str());
        if exists {
            return Err(StoreError::already_exists("duplicate key value"));
        }

        let id = Uuid::new_v4();
        rows.push(StoredWebhookEvent {
            id,
            provider: event.provider.clone(),
            event_type: event.event_type.clone(),
            event_data: event.body.clone(),
            event_hash: event.hash.as_str().to_string(),
            received_at: event.received_at,
            source_address: event.source_addr.map(|ip| ip.to_string()),
            headers: Some(serde_json::Value::Object(
                event
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            )),
        });
        Ok(id)
    }
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for FakeStore {
    async fn store_event(
        &self,
        event: &NewWebhookEvent,
        cancel: &CancellationToken,
    ) -> Result<InsertOutcome, StoreError> {
        // Tight delays so retry-path tests stay fast.
        let retry = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(10), 2.0);
        match retry_with_backoff(retry, cancel, || self.insert_once(event)).await {
            Ok(id) => Ok(InsertOutcome::Stored(id)),
            Err(RetryError::Aborted(e)) if e.kind == StoreErrorKind::AlreadyExists => {
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(other) => Err(other.into_store_error()),
        }
    }

    async fn hash_exists(&self, hash: &EventHash) -> Result<bool, StoreError> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(StoreError::transient("injected probe failure"));
        }
        Ok(self
            .lock()
            .iter()
            .any(|r| r.event_hash == hash.as_str()))
    }

    async fn check_health(&self) -> bool {
        !self.fail_probes.load(Ordering::SeqCst)
    }

    async fn recent_count(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| r.received_at >= since)
            .count() as i64)
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<StoredWebhookEvent>, StoreError> {
        let mut rows = self.rows();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
