//! Webhook authentication.
//!
//! The authenticator sits between intake and deduplication. It is
//! constructed once at startup in one of two states:
//!
//! - **Disabled** (default): every request is accepted.
//! - **Enabled** (`ENABLE_AUTH=true`): requests must carry a valid
//!   HMAC-SHA256 signature, and optionally come from an allowlisted
//!   source address.
//!
//! Even when enabled, a provider with no configured secret is accepted
//! with a warning. The service exists to capture money-related events;
//! losing one to a missing config entry is worse than storing an
//! unverified one.

mod signature;

pub use signature::{
    compute_signature, format_signature_header, normalize_signature_header, verify_signature,
};

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::config::{Config, SECRET_ENV_PREFIX};
use crate::event::IncomingEvent;

/// Failure reason: the request carried no recognized signature header.
pub const REASON_MISSING_SIGNATURE: &str = "Missing signature";
/// Failure reason: the signature did not match the payload.
pub const REASON_INVALID_SIGNATURE: &str = "Invalid signature";
/// Failure reason: the peer address is not on the allowlist.
pub const REASON_IP_NOT_ALLOWED: &str = "IP not allowed";

/// The outcome of authenticating one incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Whether the request may proceed down the pipeline.
    pub authenticated: bool,
    /// Provider the decision was made for.
    pub provider: String,
    /// Reason for rejection; `None` when authenticated.
    pub failure_reason: Option<&'static str>,
}

impl AuthOutcome {
    fn accepted(provider: &str) -> Self {
        Self {
            authenticated: true,
            provider: provider.to_string(),
            failure_reason: None,
        }
    }

    fn denied(provider: &str, reason: &'static str) -> Self {
        Self {
            authenticated: false,
            provider: provider.to_string(),
            failure_reason: Some(reason),
        }
    }
}

/// Webhook authenticator.
///
/// Holds an immutable snapshot of the authentication configuration.
/// Secret resolution additionally consults `SECRET_<PROVIDER>` in the
/// live environment so operators can rotate a secret without rebuilding
/// the snapshot.
#[derive(Debug, Clone)]
pub struct Authenticator {
    enabled: bool,
    provider_secrets: HashMap<String, String>,
    allowed_ips: Vec<IpAddr>,
}

impl Authenticator {
    /// Creates an authenticator with explicit settings.
    pub fn new(
        enabled: bool,
        provider_secrets: HashMap<String, String>,
        allowed_ips: Vec<IpAddr>,
    ) -> Self {
        Self {
            enabled,
            provider_secrets,
            allowed_ips,
        }
    }

    /// Creates an authenticator from the service configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.enable_auth,
            config.provider_secrets.clone(),
            config.allowed_ips.clone(),
        )
    }

    /// Whether signature checking is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Authenticates one incoming event.
    ///
    /// Never fails on malformed input: unparseable secrets and headers
    /// degrade to the corresponding rejection (or, for secrets, to the
    /// fail-open branch).
    pub fn authenticate(&self, event: &IncomingEvent) -> AuthOutcome {
        let provider = event.provider.as_str();

        if !self.enabled {
            debug!(provider, "authentication disabled, accepting event");
            return AuthOutcome::accepted(provider);
        }

        let secret = match self.resolve_secret(provider) {
            Some(secret) => secret,
            None => {
                warn!(
                    provider,
                    "no webhook secret configured, accepting unverified event"
                );
                return AuthOutcome::accepted(provider);
            }
        };

        let Some(signature) = event.signature.as_deref() else {
            return AuthOutcome::denied(provider, REASON_MISSING_SIGNATURE);
        };

        if !verify_signature(&event.body, signature, secret.as_bytes()) {
            return AuthOutcome::denied(provider, REASON_INVALID_SIGNATURE);
        }

        if !self.allowed_ips.is_empty()
            && let Some(addr) = event.source_addr
            && !self.allowed_ips.contains(&addr)
        {
            return AuthOutcome::denied(provider, REASON_IP_NOT_ALLOWED);
        }

        debug!(provider, "signature verified");
        AuthOutcome::accepted(provider)
    }

    /// Resolves the HMAC secret for a provider.
    ///
    /// `SECRET_<PROVIDER>` in the environment wins; the startup snapshot
    /// (environment variables merged over the config file's
    /// `Authentication.ProviderSecrets` table) is the fallback. Blank
    /// values count as unconfigured.
    fn resolve_secret(&self, provider: &str) -> Option<String> {
        let env_key = format!("{SECRET_ENV_PREFIX}{}", provider.to_ascii_uppercase());
        if let Ok(value) = std::env::var(&env_key)
            && !value.trim().is_empty()
        {
            return Some(value);
        }

        self.provider_secrets
            .get(provider)
            .filter(|s| !s.trim().is_empty())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn incoming(provider: &str, body: &[u8], signature: Option<&str>) -> IncomingEvent {
        IncomingEvent {
            provider: provider.to_string(),
            event_type: "unknown".to_string(),
            body: body.to_vec(),
            signature: signature.map(String::from),
            source_addr: None,
            received_at: Utc::now(),
            headers: HashMap::new(),
        }
    }

    fn secrets(provider: &str, secret: &str) -> HashMap<String, String> {
        HashMap::from([(provider.to_string(), secret.to_string())])
    }

    fn signed_header(body: &[u8], secret: &str) -> String {
        format_signature_header(&compute_signature(body, secret.as_bytes()))
    }

    #[test]
    fn disabled_accepts_everything() {
        let auth = Authenticator::new(false, HashMap::new(), Vec::new());

        // No signature
        let outcome = auth.authenticate(&incoming("alchemy", b"{}", None));
        assert!(outcome.authenticated);

        // Garbage signature
        let outcome = auth.authenticate(&incoming("alchemy", b"{}", Some("nonsense")));
        assert!(outcome.authenticated);
        assert_eq!(outcome.failure_reason, None);
    }

    #[test]
    fn enabled_valid_signature_accepted() {
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), Vec::new());
        let body = br#"{"type":"ADDRESS_ACTIVITY"}"#;
        let header = signed_header(body, "s3cret");

        let outcome = auth.authenticate(&incoming("alchemy", body, Some(&header)));
        assert!(outcome.authenticated);
    }

    #[test]
    fn enabled_invalid_signature_rejected() {
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), Vec::new());
        let body = br#"{"type":"ADDRESS_ACTIVITY"}"#;
        let header = signed_header(body, "wrong-secret");

        let outcome = auth.authenticate(&incoming("alchemy", body, Some(&header)));
        assert!(!outcome.authenticated);
        assert_eq!(outcome.failure_reason, Some(REASON_INVALID_SIGNATURE));
    }

    #[test]
    fn enabled_missing_signature_rejected() {
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), Vec::new());

        let outcome = auth.authenticate(&incoming("alchemy", b"{}", None));
        assert!(!outcome.authenticated);
        assert_eq!(outcome.failure_reason, Some(REASON_MISSING_SIGNATURE));
    }

    #[test]
    fn enabled_no_secret_fails_open() {
        let auth = Authenticator::new(true, HashMap::new(), Vec::new());

        // With a signature
        let outcome = auth.authenticate(&incoming("unconfigured", b"{}", Some("sha256=abcd")));
        assert!(outcome.authenticated);

        // Without one
        let outcome = auth.authenticate(&incoming("unconfigured", b"{}", None));
        assert!(outcome.authenticated);
    }

    #[test]
    fn blank_secret_counts_as_unconfigured() {
        let auth = Authenticator::new(true, secrets("alchemy", "   "), Vec::new());

        let outcome = auth.authenticate(&incoming("alchemy", b"{}", None));
        assert!(outcome.authenticated, "blank secret must fail open");
    }

    #[test]
    fn allowlisted_address_accepted() {
        let allowed = vec!["10.0.0.1".parse().unwrap()];
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), allowed);
        let body = b"{}";
        let header = signed_header(body, "s3cret");

        let mut event = incoming("alchemy", body, Some(&header));
        event.source_addr = Some("10.0.0.1".parse().unwrap());

        assert!(auth.authenticate(&event).authenticated);
    }

    #[test]
    fn non_allowlisted_address_rejected() {
        let allowed = vec!["10.0.0.1".parse().unwrap()];
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), allowed);
        let body = b"{}";
        let header = signed_header(body, "s3cret");

        let mut event = incoming("alchemy", body, Some(&header));
        event.source_addr = Some("192.168.1.99".parse().unwrap());

        let outcome = auth.authenticate(&event);
        assert!(!outcome.authenticated);
        assert_eq!(outcome.failure_reason, Some(REASON_IP_NOT_ALLOWED));
    }

    #[test]
    fn allowlist_skipped_when_source_unknown() {
        let allowed = vec!["10.0.0.1".parse().unwrap()];
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), allowed);
        let body = b"{}";
        let header = signed_header(body, "s3cret");

        // No source address recorded: signature alone decides.
        let event = incoming("alchemy", body, Some(&header));
        assert!(auth.authenticate(&event).authenticated);
    }

    #[test]
    fn allowlist_checked_after_signature() {
        // A bad signature from an allowlisted address is still rejected
        // for the signature, not the address.
        let allowed = vec!["10.0.0.1".parse().unwrap()];
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), allowed);

        let mut event = incoming("alchemy", b"{}", Some("sha256=00"));
        event.source_addr = Some("10.0.0.1".parse().unwrap());

        let outcome = auth.authenticate(&event);
        assert_eq!(outcome.failure_reason, Some(REASON_INVALID_SIGNATURE));
    }

    #[test]
    fn bare_hex_signature_accepted() {
        let auth = Authenticator::new(true, secrets("alchemy", "s3cret"), Vec::new());
        let body = b"{}";
        let header = hex::encode(compute_signature(body, b"s3cret"));

        let outcome = auth.authenticate(&incoming("alchemy", body, Some(&header)));
        assert!(outcome.authenticated);
    }
}
