//! Webhook intake endpoint.
//!
//! Accepts provider event callbacks and drives the ingestion pipeline:
//! capture, authenticate, deduplicate, persist. The service is a dumb
//! capture surface; it never interprets the event or calls anyone back.
//!
//! Duplicates are not errors: the client gets a 200 either way, with a
//! `duplicate` flag saying which path was taken.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use super::AppState;
use crate::event::{IncomingEvent, NewWebhookEvent, WebhookAck};
use crate::store::{EventStore, InsertOutcome, StoreError};

/// Provider name for the Alchemy intake route.
pub const PROVIDER_ALCHEMY: &str = "alchemy";

/// Signature headers, in resolution order: first present wins.
const SIGNATURE_HEADERS: [&str; 3] = ["x-alchemy-signature", "x-signature", "x-hub-signature-256"];

/// Event type recorded when the body carries none.
const EVENT_TYPE_UNKNOWN: &str = "unknown";

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The request carried no body at all.
    #[error("empty request body")]
    EmptyBody,

    /// The body exceeded the configured size cap.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// The configured cap.
        limit: usize,
    },

    /// Authentication is enabled and the request failed it.
    #[error("authentication failed: {0}")]
    Unauthenticated(&'static str),

    /// The store rejected the event after retries.
    #[error("failed to store event")]
    Store(#[source] StoreError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::EmptyBody => StatusCode::BAD_REQUEST,
            WebhookError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            WebhookError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            WebhookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

/// Webhook intake handler for `POST /webhook/alchemy`.
///
/// # Request
///
/// - Method: POST
/// - Body: raw JSON payload, at most the configured cap (default 1 MiB)
/// - Optional signature header, first present wins:
///   `X-Alchemy-Signature`, `X-Signature`, `X-Hub-Signature-256`
///
/// # Response
///
/// - 200 `{"message":"Event stored","eventId":...,"duplicate":false}`
/// - 200 `{"message":"Event already processed","duplicate":true}`
/// - 400: empty body
/// - 401: authentication enabled and failed
/// - 413: body over the size cap
/// - 500: store failure after retries
pub async fn webhook_handler<S: EventStore>(
    State(app_state): State<AppState<S>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), WebhookError> {
    if body.len() > app_state.max_body_bytes() {
        warn!(
            provider = PROVIDER_ALCHEMY,
            size = body.len(),
            limit = app_state.max_body_bytes(),
            "rejecting oversized webhook body"
        );
        return Err(WebhookError::BodyTooLarge {
            limit: app_state.max_body_bytes(),
        });
    }

    let event = build_incoming_event(PROVIDER_ALCHEMY, &headers, peer, &body)?;

    let auth = app_state.authenticator().authenticate(&event);
    if !auth.authenticated {
        // The reason is safe to log; secret material never is.
        warn!(
            provider = %event.provider,
            event_type = %event.event_type,
            reason = auth.failure_reason,
            "webhook rejected"
        );
        return Err(WebhookError::Unauthenticated(
            auth.failure_reason.unwrap_or("authentication failed"),
        ));
    }

    let decision = app_state
        .deduplicator()
        .is_duplicate(&event.provider, &event.body)
        .await;
    if decision.duplicate {
        info!(
            provider = %event.provider,
            event_type = %event.event_type,
            hash = decision.hash.short(),
            outcome = "duplicate",
            "webhook already processed"
        );
        return Ok((StatusCode::OK, Json(WebhookAck::duplicate())));
    }

    // Persist with exactly the hash the deduplicator computed.
    let row = NewWebhookEvent::from_incoming(&event, decision.hash.clone());
    match app_state
        .store()
        .store_event(&row, app_state.shutdown_token())
        .await
    {
        Ok(InsertOutcome::Stored(event_id)) => {
            info!(
                provider = %event.provider,
                event_type = %event.event_type,
                hash = decision.hash.short(),
                %event_id,
                outcome = "stored",
                "webhook stored"
            );
            Ok((StatusCode::OK, Json(WebhookAck::stored(event_id))))
        }
        Ok(InsertOutcome::AlreadyExists) => {
            // Lost the insert race: a concurrent delivery of the same
            // (provider, hash) committed first.
            info!(
                provider = %event.provider,
                event_type = %event.event_type,
                hash = decision.hash.short(),
                outcome = "duplicate",
                "webhook already processed (insert race)"
            );
            Ok((StatusCode::OK, Json(WebhookAck::duplicate())))
        }
        Err(error) => {
            tracing::error!(
                provider = %event.provider,
                event_type = %event.event_type,
                hash = decision.hash.short(),
                %error,
                outcome = "store-failure",
                "failed to store webhook"
            );
            Err(WebhookError::Store(error))
        }
    }
}

/// Builds the request-scoped event from the raw intake artifacts.
fn build_incoming_event(
    provider: &str,
    headers: &HeaderMap,
    peer: SocketAddr,
    body: &Bytes,
) -> Result<IncomingEvent, WebhookError> {
    if body.is_empty() {
        warn!(provider, "rejecting empty webhook body");
        return Err(WebhookError::EmptyBody);
    }

    Ok(IncomingEvent {
        provider: provider.to_string(),
        event_type: extract_event_type(body),
        body: body.to_vec(),
        signature: extract_signature(headers),
        source_addr: Some(peer.ip()),
        received_at: Utc::now(),
        headers: extract_headers(headers),
    })
}

/// Extracts the event type from the body's top-level `type` field.
///
/// Parsing is best-effort only: an unparseable body, or one that is not
/// an object carrying a string `type`, yields `"unknown"` and the
/// request proceeds. The hash is over the raw bytes either way.
fn extract_event_type(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(EVENT_TYPE_UNKNOWN)
            .to_string(),
        Err(error) => {
            warn!(%error, "webhook body is not valid JSON, storing with unknown event type");
            EVENT_TYPE_UNKNOWN.to_string()
        }
    }
}

/// Returns the first signature header present, in resolution order.
fn extract_signature(headers: &HeaderMap) -> Option<String> {
    SIGNATURE_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    })
}

/// Extracts HTTP headers into a map for persistence.
///
/// Every header is kept. Values that are not valid UTF-8 cannot survive
/// the JSON headers column exactly, so they are carried through a lossy
/// conversion rather than dropped.
fn extract_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = match value.to_str() {
                Ok(v) => v.to_string(),
                Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
            };
            (name.to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_from_json_object() {
        assert_eq!(
            extract_event_type(br#"{"type":"ADDRESS_ACTIVITY","event":{}}"#),
            "ADDRESS_ACTIVITY"
        );
    }

    #[test]
    fn event_type_unknown_when_field_missing() {
        assert_eq!(extract_event_type(br#"{"webhookId":"wh_1"}"#), "unknown");
    }

    #[test]
    fn event_type_unknown_for_non_object_json() {
        assert_eq!(extract_event_type(b"[1,2,3]"), "unknown");
        assert_eq!(extract_event_type(b"\"just a string\""), "unknown");
        assert_eq!(extract_event_type(b"42"), "unknown");
    }

    #[test]
    fn event_type_unknown_for_non_string_type() {
        assert_eq!(extract_event_type(br#"{"type":7}"#), "unknown");
    }

    #[test]
    fn event_type_unknown_for_unparseable_body() {
        assert_eq!(extract_event_type(b"not-json"), "unknown");
    }

    #[test]
    fn signature_resolution_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", "third".parse().unwrap());
        headers.insert("x-signature", "second".parse().unwrap());
        assert_eq!(extract_signature(&headers), Some("second".to_string()));

        headers.insert("x-alchemy-signature", "first".parse().unwrap());
        assert_eq!(extract_signature(&headers), Some("first".to_string()));
    }

    #[test]
    fn signature_absent() {
        let headers = HeaderMap::new();
        assert_eq!(extract_signature(&headers), None);
    }

    #[test]
    fn extract_headers_keeps_invalid_utf8_values() {
        use axum::http::HeaderValue;

        let mut headers = HeaderMap::new();
        headers.insert("valid-header", "valid-value".parse().unwrap());

        // Bytes 0x80-0xFF are invalid as standalone UTF-8.
        let invalid_utf8_value = HeaderValue::from_bytes(&[0x80, 0x81, 0x82]).unwrap();
        headers.insert("invalid-header", invalid_utf8_value);

        let result = extract_headers(&headers);

        assert_eq!(result.get("valid-header"), Some(&"valid-value".to_string()));
        // Kept, not dropped; the bytes degrade to replacement chars.
        assert_eq!(
            result.get("invalid-header"),
            Some(&"\u{FFFD}\u{FFFD}\u{FFFD}".to_string())
        );
    }

    #[test]
    fn empty_body_rejected() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let result = build_incoming_event("alchemy", &headers, peer, &Bytes::new());
        assert!(matches!(result, Err(WebhookError::EmptyBody)));
    }

    #[test]
    fn incoming_event_captures_peer_ip() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "203.0.113.7:1234".parse().unwrap();
        let event =
            build_incoming_event("alchemy", &headers, peer, &Bytes::from_static(b"{}")).unwrap();
        assert_eq!(event.source_addr, Some("203.0.113.7".parse().unwrap()));
        assert_eq!(event.provider, "alchemy");
    }
}
