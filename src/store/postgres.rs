//! PostgreSQL implementation of the event store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::retry::{RetryConfig, RetryError, retry_with_backoff};
use super::{EventStore, InsertOutcome, StoreError, StoreErrorKind};
use crate::dedup::EventHash;
use crate::event::{NewWebhookEvent, StoredWebhookEvent};

/// PostgreSQL-backed event store using `sqlx::PgPool`.
///
/// Reads are issue-and-forget; writes never read back. Connections are
/// held only for the duration of the statement itself, never across the
/// retry policy's backoff sleeps.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
    retry: RetryConfig,
}

impl PgEventStore {
    /// Creates a store with the default retry configuration.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry(pool, RetryConfig::DEFAULT)
    }

    /// Creates a store with an explicit retry configuration.
    #[must_use]
    pub fn with_retry(pool: PgPool, retry: RetryConfig) -> Self {
        Self { pool, retry }
    }

    /// Runs the insert statement once.
    ///
    /// The id is generated here, per attempt; a retried insert gets a
    /// fresh one (the previous attempt failed, so no row carries it).
    async fn insert_once(&self, event: &NewWebhookEvent) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let source_ip = event.source_addr.map(IpNetwork::from);
        let headers = headers_to_json(&event.headers);

        sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO forwarder.raw_webhook_events \
             (id, provider, event_type, event_data, event_hash, received_at, source_ip, headers) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
        )
        .bind(id)
        .bind(&event.provider)
        .bind(&event.event_type)
        .bind(&event.body)
        .bind(event.hash.as_str())
        .bind(event.received_at)
        .bind(source_ip)
        .bind(headers)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }
}

impl EventStore for PgEventStore {
    async fn store_event(
        &self,
        event: &NewWebhookEvent,
        cancel: &CancellationToken,
    ) -> Result<InsertOutcome, StoreError> {
        match retry_with_backoff(self.retry, cancel, || self.insert_once(event)).await {
            Ok(id) => Ok(InsertOutcome::Stored(id)),
            Err(RetryError::Aborted(e)) if e.kind == StoreErrorKind::AlreadyExists => {
                // The unique index on (provider, event_hash) fired: a
                // concurrent delivery won the race. Not an error.
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(RetryError::Exhausted {
                last_error,
                attempts,
            }) => {
                warn!(
                    provider = %event.provider,
                    hash = event.hash.short(),
                    attempts,
                    "store insert exhausted retries"
                );
                Err(last_error)
            }
            Err(other) => Err(other.into_store_error()),
        }
    }

    async fn hash_exists(&self, hash: &EventHash) -> Result<bool, StoreError> {
        // No provider scope: the insert path enforces (provider, hash),
        // and the hash alone is covered by the unique index, so this
        // probe stays cheap.
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM forwarder.raw_webhook_events WHERE event_hash = $1)",
        )
        .bind(hash.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn check_health(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    async fn recent_count(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM forwarder.raw_webhook_events WHERE received_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<StoredWebhookEvent>, StoreError> {
        type Row = (
            Uuid,
            String,
            String,
            Vec<u8>,
            String,
            DateTime<Utc>,
            Option<IpNetwork>,
            Option<serde_json::Value>,
        );

        let rows = sqlx::query_as::<_, Row>(
            "SELECT id, provider, event_type, event_data, event_hash, received_at, source_ip, headers \
             FROM forwarder.raw_webhook_events ORDER BY received_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, provider, event_type, event_data, event_hash, received_at, source_ip, headers)| {
                    StoredWebhookEvent {
                        id,
                        provider,
                        event_type,
                        event_data,
                        event_hash: event_hash.trim_end().to_string(),
                        received_at,
                        source_address: source_ip.map(|net| net.ip().to_string()),
                        headers,
                    }
                },
            )
            .collect())
    }
}

/// Serializes the captured request headers as a JSON string map.
///
/// Field ordering is whatever the map yields; consumers must not depend
/// on it.
fn headers_to_json(headers: &HashMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_serialize_as_string_map() {
        let headers = HashMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("x-alchemy-signature".to_string(), "sha256=ab".to_string()),
        ]);

        let value = headers_to_json(&headers);
        assert_eq!(value["content-type"], "application/json");
        assert_eq!(value["x-alchemy-signature"], "sha256=ab");
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn empty_headers_serialize_as_empty_object() {
        let value = headers_to_json(&HashMap::new());
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn ip_roundtrips_through_inet() {
        use std::net::IpAddr;

        let addr: IpAddr = "203.0.113.7".parse().unwrap();
        let net = IpNetwork::from(addr);
        assert_eq!(net.ip().to_string(), "203.0.113.7");
    }
}
