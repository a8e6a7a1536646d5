//! Embedded schema migrations.
//!
//! The service owns the `forwarder` schema and nothing else. Migration
//! history lives in `forwarder.migration_history`, private to this
//! service so it cannot collide with other services sharing the
//! database.
//!
//! Each step is a single statement, applied in order inside its own
//! transaction together with its history row. Already-applied steps are
//! skipped, so the runner is safe to invoke on every startup.

use sqlx::PgPool;
use tracing::{debug, info};

use super::StoreError;

/// Ordered migration steps: `(name, statement)`.
///
/// Names are recorded in the history table; never rename or reorder an
/// applied step.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_create_schema", "CREATE SCHEMA IF NOT EXISTS forwarder"),
    (
        "0002_create_raw_webhook_events",
        "CREATE TABLE IF NOT EXISTS forwarder.raw_webhook_events (\
            id UUID PRIMARY KEY, \
            provider VARCHAR(50) NOT NULL, \
            event_type VARCHAR(100) NOT NULL, \
            event_data BYTEA NOT NULL, \
            event_hash CHAR(64) NOT NULL, \
            received_at TIMESTAMPTZ NOT NULL, \
            source_ip INET, \
            headers JSONB\
        )",
    ),
    (
        "0003_index_received_at",
        "CREATE INDEX IF NOT EXISTS ix_raw_webhook_events_received_at \
         ON forwarder.raw_webhook_events (received_at)",
    ),
    (
        "0004_index_provider",
        "CREATE INDEX IF NOT EXISTS ix_raw_webhook_events_provider \
         ON forwarder.raw_webhook_events (provider)",
    ),
    (
        "0005_index_event_type",
        "CREATE INDEX IF NOT EXISTS ix_raw_webhook_events_event_type \
         ON forwarder.raw_webhook_events (event_type)",
    ),
    // The dedup guarantee. Scoped by provider: the same payload arriving
    // from two providers is two distinct events.
    (
        "0006_unique_provider_hash",
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_raw_webhook_events_provider_hash \
         ON forwarder.raw_webhook_events (provider, event_hash)",
    ),
];

/// Applies every pending migration step.
///
/// # Errors
///
/// Returns a [`StoreError`] when a statement or the history bookkeeping
/// fails; the failing step's transaction is rolled back and nothing
/// after it runs.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    // Bootstrap: schema and history table must exist before the history
    // can be consulted.
    sqlx::query("CREATE SCHEMA IF NOT EXISTS forwarder")
        .execute(pool)
        .await
        .map_err(StoreError::from_sqlx)?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS forwarder.migration_history (\
            name TEXT PRIMARY KEY, \
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()\
        )",
    )
    .execute(pool)
    .await
    .map_err(StoreError::from_sqlx)?;

    let applied: Vec<String> =
        sqlx::query_scalar("SELECT name FROM forwarder.migration_history")
            .fetch_all(pool)
            .await
            .map_err(StoreError::from_sqlx)?;

    let mut ran = 0usize;
    for (name, statement) in MIGRATIONS.iter().copied() {
        if applied.iter().any(|a| a.as_str() == name) {
            debug!(step = name, "migration already applied");
            continue;
        }

        let mut tx = pool.begin().await.map_err(StoreError::from_sqlx)?;
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        sqlx::query("INSERT INTO forwarder.migration_history (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        tx.commit().await.map_err(StoreError::from_sqlx)?;

        info!(step = name, "applied migration");
        ran += 1;
    }

    info!(applied = ran, total = MIGRATIONS.len(), "migrations up to date");
    Ok(())
}
