//! Recent-events listing endpoint.
//!
//! Debug-only surface: returns the 50 most recent rows, newest first,
//! with no pagination. Useful for eyeballing what a provider actually
//! delivered; anything heavier belongs on the database itself.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use super::AppState;
use crate::event::StoredWebhookEvent;
use crate::store::{EventStore, StoreError};

/// Hard cap on the number of rows returned.
const LISTING_LIMIT: i64 = 50;

/// Errors that can occur when listing events.
#[derive(Debug, Error)]
pub enum ListingError {
    /// Store read failure.
    #[error("failed to read recent events")]
    Store(#[source] StoreError),
}

impl IntoResponse for ListingError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Listing handler for `GET /webhook/alchemy/events`.
pub async fn recent_events_handler<S: EventStore>(
    State(app_state): State<AppState<S>>,
) -> Result<Json<Vec<StoredWebhookEvent>>, ListingError> {
    let events = app_state
        .store()
        .recent_events(LISTING_LIMIT)
        .await
        .map_err(|e| {
            error!(error = %e, "recent-events query failed");
            ListingError::Store(e)
        })?;

    Ok(Json(events))
}
