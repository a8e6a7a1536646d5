//! Domain types for webhook events.
//!
//! An [`IncomingEvent`] is the request-scoped product of intake: raw body
//! bytes plus everything the pipeline needs to authenticate, deduplicate,
//! and persist it. A [`NewWebhookEvent`] is the row about to be inserted;
//! a [`StoredWebhookEvent`] is a row read back for the listing endpoint.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::dedup::EventHash;

/// A webhook delivery as captured at intake, before any pipeline stage
/// has run. Created once per request and consumed by the authenticator,
/// deduplicator, and repository in order.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    /// Source provider, fixed by the route (e.g. `"alchemy"`).
    pub provider: String,

    /// Event type extracted from the body's `type` field, or `"unknown"`
    /// when the body is not a JSON object carrying one.
    pub event_type: String,

    /// Raw body bytes, exactly as received. The content hash and the HMAC
    /// verification both run over these bytes.
    pub body: Vec<u8>,

    /// First signature header present on the request, if any.
    pub signature: Option<String>,

    /// Peer address of the connection that delivered the event.
    pub source_addr: Option<IpAddr>,

    /// Intake timestamp, set once, in UTC.
    pub received_at: DateTime<Utc>,

    /// Verbatim request headers. Values that are not valid UTF-8 are
    /// carried through a lossy conversion rather than dropped.
    pub headers: HashMap<String, String>,
}

/// A row about to be written to `forwarder.raw_webhook_events`.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    /// Source provider.
    pub provider: String,

    /// Event type, capped at 100 characters.
    pub event_type: String,

    /// Verbatim body bytes. Stored as `bytea`, not `jsonb` or `text`:
    /// the store must hold the bytes exactly as received, jsonb
    /// normalizes, and text cannot carry invalid UTF-8.
    pub body: Vec<u8>,

    /// Content hash of the raw body bytes.
    pub hash: EventHash,

    /// Intake timestamp.
    pub received_at: DateTime<Utc>,

    /// Peer address, persisted as `inet` when present.
    pub source_addr: Option<IpAddr>,

    /// Request headers, persisted as a JSON string map.
    pub headers: HashMap<String, String>,
}

impl NewWebhookEvent {
    /// Builds the row for an incoming event using the hash the
    /// deduplicator already computed for it.
    pub fn from_incoming(event: &IncomingEvent, hash: EventHash) -> Self {
        Self {
            provider: event.provider.clone(),
            event_type: truncate_chars(&event.event_type, 100),
            body: event.body.clone(),
            hash,
            received_at: event.received_at,
            source_addr: event.source_addr,
            headers: event.headers.clone(),
        }
    }
}

/// A persisted row as served by the listing endpoint.
///
/// `source_address` is the string form of the stored `inet` value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredWebhookEvent {
    /// Row ID, generated at insertion time.
    pub id: Uuid,
    /// Source provider.
    pub provider: String,
    /// Event type discriminator.
    pub event_type: String,
    /// Verbatim body bytes as stored. Serialized as text in the listing
    /// response; the conversion is display-only, the stored value is
    /// byte-exact.
    #[serde(serialize_with = "serialize_bytes_as_text")]
    pub event_data: Vec<u8>,
    /// Lowercase-hex SHA-256 of the raw body bytes.
    pub event_hash: String,
    /// Intake timestamp.
    pub received_at: DateTime<Utc>,
    /// Peer address, if one was recorded.
    pub source_address: Option<String>,
    /// Request headers as stored.
    pub headers: Option<serde_json::Value>,
}

/// Response body for `POST /webhook/{provider}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    /// Human-readable outcome.
    pub message: &'static str,
    /// ID of the newly stored row; absent on the duplicate path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    /// Whether the event was already known.
    pub duplicate: bool,
}

impl WebhookAck {
    /// Acknowledgment for a freshly persisted event.
    pub fn stored(event_id: Uuid) -> Self {
        Self {
            message: "Event stored",
            event_id: Some(event_id),
            duplicate: false,
        }
    }

    /// Acknowledgment for a duplicate delivery.
    pub fn duplicate() -> Self {
        Self {
            message: "Event already processed",
            event_id: None,
            duplicate: true,
        }
    }
}

/// Truncates a string to at most `max` characters, respecting char
/// boundaries.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Renders stored body bytes as text for JSON responses.
fn serialize_bytes_as_text<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}
