//! Store error types.
//!
//! This module defines error types that distinguish between transient and
//! permanent store failures. The distinction is critical for retry logic:
//!
//! - **Transient** errors are retriable (timeouts, pool exhaustion,
//!   connectivity loss)
//! - **Permanent** errors are returned immediately (constraint violations
//!   other than uniqueness, encode/decode failures, bad statements)
//!
//! Special case:
//! - **AlreadyExists**: the `(provider, event_hash)` unique index fired.
//!   This is a lost insert race, not a failure; retrying would fail
//!   forever. The repository translates it to the duplicate outcome.

use std::fmt;

use thiserror::Error;

/// The kind of store error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Transient error - safe to retry with backoff.
    ///
    /// Examples:
    /// - Connection-pool timeout or closed pool
    /// - I/O or TLS errors talking to the store
    /// - Serialization failures and deadlocks the server asks us to retry
    /// - Statement timeouts
    Transient,

    /// Permanent error - retrying the same statement cannot help.
    ///
    /// Examples:
    /// - Encode/decode and type mismatches
    /// - Constraint violations other than the dedup unique index
    /// - Malformed statements
    Permanent,

    /// The `(provider, event_hash)` unique index rejected the insert.
    ///
    /// A concurrent request already stored this event. Not retriable:
    /// the caller must take the duplicate path instead.
    AlreadyExists,
}

impl StoreErrorKind {
    /// Returns true if this error is retriable.
    ///
    /// Note: `AlreadyExists` returns false because the row is already
    /// there; re-running the insert just loses the race again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreErrorKind::Transient)
    }
}

/// A store error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct StoreError {
    /// The kind of error (transient, permanent, or already-exists).
    pub kind: StoreErrorKind,

    /// A human-readable description of the error.
    pub message: String,

    /// The underlying driver error, if available.
    #[source]
    pub source: Option<sqlx::Error>,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.message)
    }
}

impl StoreError {
    /// Creates a transient error without a driver source.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Transient,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent error without a driver source.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Permanent,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an already-exists result without a driver source.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::AlreadyExists,
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes a driver error.
    ///
    /// The classification inspects the error variant first, then the
    /// server-side SQLSTATE code, and finally falls back to scanning the
    /// cause chain for connectivity symptoms. Anything unrecognized is
    /// permanent: retrying an unknown failure against a money-related
    /// event stream must be a deliberate choice, not a default.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let message = err.to_string();
        let kind = classify(&err);
        Self {
            kind,
            message,
            source: Some(err),
        }
    }
}

/// Decides the [`StoreErrorKind`] for a driver error.
fn classify(err: &sqlx::Error) -> StoreErrorKind {
    match err {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return StoreErrorKind::AlreadyExists;
            }
            match db.code().as_deref() {
                Some(code) if is_transient_sqlstate(code) => StoreErrorKind::Transient,
                _ => StoreErrorKind::Permanent,
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => StoreErrorKind::Transient,
        other => {
            if has_transient_cause(other) {
                StoreErrorKind::Transient
            } else {
                StoreErrorKind::Permanent
            }
        }
    }
}

/// Checks whether a SQLSTATE code names a condition that resolves on
/// retry.
///
/// - `08xxx`: connection exceptions
/// - `40001`/`40P01`: serialization failure / deadlock detected
/// - `53300`: too many connections
/// - `57014`: statement canceled (timeout)
/// - `57P03`: the server is starting up
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code == "40001"
        || code == "40P01"
        || code == "53300"
        || code == "57014"
        || code == "57P03"
}

/// Walks the cause chain looking for connectivity symptoms.
///
/// Driver wrappers sometimes bury the interesting error (an I/O timeout,
/// a dropped connection) behind variants this module does not know; a
/// transient nested cause makes the whole error transient.
fn has_transient_cause(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause = err.source();
    while let Some(inner) = cause {
        if inner.is::<std::io::Error>() || is_connectivity_message(&inner.to_string()) {
            return true;
        }
        cause = inner.source();
    }
    is_connectivity_message(&err.to_string())
}

/// Checks if an error message indicates a connectivity-level problem.
fn is_connectivity_message(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("timeout")
        || message_lower.contains("timed out")
        || message_lower.contains("connection refused")
        || message_lower.contains("connection reset")
        || message_lower.contains("broken pipe")
}
