//! Event persistence.
//!
//! The repository owns exactly one schema (`forwarder`) and one table
//! (`raw_webhook_events`). Rows are write-once, read-many: the service
//! never updates or deletes, and archival is someone else's job.
//!
//! [`EventStore`] is the seam between the pipeline and the database, so
//! the handler and deduplicator stay storage-agnostic and tests can run
//! against an in-memory fake.

pub mod error;
pub mod postgres;
pub mod retry;
pub mod schema;

pub use error::{StoreError, StoreErrorKind};
pub use postgres::PgEventStore;
pub use retry::{RetryConfig, RetryError, retry_with_backoff};

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dedup::EventHash;
use crate::event::{NewWebhookEvent, StoredWebhookEvent};

/// Result of attempting to persist one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written with the given ID.
    Stored(Uuid),
    /// The `(provider, hash)` pair was already present; a concurrent or
    /// earlier delivery won.
    AlreadyExists,
}

/// Storage backend for webhook events.
///
/// Implementations wrap the insert in the retry policy and translate a
/// uniqueness violation into [`InsertOutcome::AlreadyExists`] rather than
/// an error; that translation is what lets the deduplicator tolerate
/// races.
///
/// Cancellation: `store_event` takes an explicit token because it sleeps
/// between attempts. Single-statement reads are cancelled the Rust way,
/// by dropping their future.
pub trait EventStore: Send + Sync + 'static {
    /// Persists one event, retrying transient failures.
    fn store_event(
        &self,
        event: &NewWebhookEvent,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<InsertOutcome, StoreError>> + Send;

    /// Checks whether any row with this content hash exists.
    fn hash_exists(&self, hash: &EventHash) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Executes a trivial probe against the store.
    fn check_health(&self) -> impl Future<Output = bool> + Send;

    /// Counts rows received at or after `since`.
    fn recent_count(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Returns up to `limit` most recent rows, newest first.
    fn recent_events(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<StoredWebhookEvent>, StoreError>> + Send;
}
