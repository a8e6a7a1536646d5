//! HTTP server for the callback forwarder.
//!
//! This module implements the HTTP server that:
//! - Accepts provider webhook callbacks, authenticates and deduplicates
//!   them, and persists the raw payload
//! - Provides a debug listing of recently captured events
//! - Provides a liveness probe
//!
//! # Endpoints
//!
//! - `POST /webhook/alchemy` - Accepts Alchemy event callbacks
//! - `GET /webhook/alchemy/events` - Returns the 50 most recent rows
//! - `GET /ping` - Returns 200 "pong"

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub mod events;
pub mod health;
pub mod webhook;

pub use events::recent_events_handler;
pub use health::ping_handler;
pub use webhook::{PROVIDER_ALCHEMY, webhook_handler};

use crate::auth::Authenticator;
use crate::dedup::{DedupCache, Deduplicator};
use crate::store::EventStore;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor. It holds
/// the pipeline collaborators, constructed once at startup and immutable
/// afterwards; the dedup cache is the only shared mutable state.
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct AppStateInner<S> {
    /// Signature checking, enabled or fail-open.
    authenticator: Authenticator,

    /// Two-tier duplicate detection over the store.
    deduplicator: Deduplicator<S>,

    /// Event persistence.
    store: Arc<S>,

    /// Request body size cap in bytes.
    max_body_bytes: usize,

    /// Cancelled at shutdown; in-flight store retries observe it.
    shutdown: CancellationToken,
}

impl<S: EventStore> AppState<S> {
    /// Creates a new `AppState` wiring the pipeline together.
    ///
    /// # Arguments
    ///
    /// * `authenticator` - Webhook authentication policy
    /// * `store` - Event persistence backend
    /// * `cache` - Dedup cache shared across requests
    /// * `max_body_bytes` - Request body size cap
    /// * `shutdown` - Token cancelled when the process is stopping
    pub fn new(
        authenticator: Authenticator,
        store: Arc<S>,
        cache: Arc<DedupCache>,
        max_body_bytes: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let deduplicator = Deduplicator::new(cache, Arc::clone(&store));
        AppState {
            inner: Arc::new(AppStateInner {
                authenticator,
                deduplicator,
                store,
                max_body_bytes,
                shutdown,
            }),
        }
    }

    /// Returns the authenticator.
    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    /// Returns the deduplicator.
    pub fn deduplicator(&self) -> &Deduplicator<S> {
        &self.inner.deduplicator
    }

    /// Returns the event store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Returns the request body size cap.
    pub fn max_body_bytes(&self) -> usize {
        self.inner.max_body_bytes
    }

    /// Returns the shutdown token.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: EventStore>(app_state: AppState<S>) -> axum::Router {
    use axum::extract::DefaultBodyLimit;
    use axum::routing::{get, post};

    let body_limit = app_state.max_body_bytes();

    axum::Router::new()
        .route("/webhook/alchemy", post(webhook_handler::<S>))
        .route("/webhook/alchemy/events", get(recent_events_handler::<S>))
        .route("/ping", get(ping_handler))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
}
