//! Webhook signature verification using HMAC-SHA256.
//!
//! Providers sign webhook payloads using HMAC-SHA256 with a shared secret.
//! The signature arrives as lowercase hex, optionally prefixed with
//! `sha256=` (the header form Alchemy emits).
//!
//! This module provides verification against the shared secret. The
//! comparison runs in constant time over the decoded MAC bytes; a
//! malformed (non-hex) signature is rejected before comparison, which
//! leaks only that it was malformed.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Normalizes a signature header value into raw MAC bytes.
///
/// Trims surrounding whitespace, strips a leading `sha256=` prefix
/// case-insensitively if present, and hex-decodes the remainder.
/// Returns `None` for invalid hex. Never panics.
///
/// # Examples
///
/// ```
/// use callback_forwarder::auth::normalize_signature_header;
///
/// // Prefixed form
/// assert!(normalize_signature_header("sha256=abcd1234").is_some());
///
/// // Bare hex is accepted too
/// assert!(normalize_signature_header("abcd1234").is_some());
///
/// // Invalid: bad hex
/// assert!(normalize_signature_header("sha256=xyz").is_none());
/// ```
pub fn normalize_signature_header(header: &str) -> Option<Vec<u8>> {
    let trimmed = header.trim();
    // get(..7) rather than slicing: an arbitrary header may not have a
    // char boundary at byte 7.
    let hex_sig = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256=") => &trimmed[7..],
        _ => trimmed,
    };

    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
///
/// This is useful for testing purposes (generating expected signatures).
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a `sha256=<hex>` header value.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a webhook signature against the payload and secret.
///
/// Returns `true` if the signature is valid, `false` otherwise.
/// The comparison is constant-time over the full MAC length; there is no
/// early-out on the first mismatching byte.
///
/// # Arguments
///
/// * `payload` - The raw webhook payload bytes
/// * `signature_header` - The signature header value (with or without the
///   `sha256=` prefix)
/// * `secret` - The shared secret configured for the provider
///
/// # Examples
///
/// ```
/// use callback_forwarder::auth::{compute_signature, format_signature_header, verify_signature};
///
/// let payload = b"Hello, World!";
/// let secret = b"my-secret-key";
///
/// let sig = compute_signature(payload, secret);
/// let header = format_signature_header(&sig);
///
/// assert!(verify_signature(payload, &header, secret));
/// assert!(!verify_signature(payload, &header, b"wrong-secret"));
/// ```
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let provided = match normalize_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.as_slice().ct_eq(provided.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ========================================================================
    // Unit tests for header normalization and edge cases
    // ========================================================================

    #[test]
    fn normalize_valid_prefixed() {
        let result = normalize_signature_header("sha256=1234abcd");
        assert_eq!(result, Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn normalize_bare_hex() {
        let result = normalize_signature_header("1234abcd");
        assert_eq!(result, Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn normalize_prefix_case_insensitive() {
        let result = normalize_signature_header("SHA256=1234abcd");
        assert_eq!(result, Some(vec![0x12, 0x34, 0xab, 0xcd]));
        let result = normalize_signature_header("Sha256=1234abcd");
        assert_eq!(result, Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn normalize_trims_whitespace() {
        let result = normalize_signature_header("  sha256=1234abcd \t");
        assert_eq!(result, Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn normalize_full_length() {
        // Full SHA256 output (64 hex chars = 32 bytes)
        let header = format!("sha256={}", "a".repeat(64));
        let result = normalize_signature_header(&header);
        assert!(result.is_some());
        assert_eq!(result.unwrap().len(), 32);
    }

    #[test]
    fn normalize_invalid_hex() {
        assert_eq!(normalize_signature_header("sha256=xyz"), None);
    }

    #[test]
    fn normalize_odd_length_hex() {
        assert_eq!(normalize_signature_header("sha256=abc"), None);
    }

    #[test]
    fn normalize_empty() {
        assert_eq!(normalize_signature_header(""), Some(vec![]));
    }

    #[test]
    fn normalize_just_prefix() {
        assert_eq!(normalize_signature_header("sha256="), Some(vec![]));
    }

    #[test]
    fn normalize_uppercase_hex() {
        let result = normalize_signature_header("sha256=ABCD1234");
        assert_eq!(result, Some(vec![0xab, 0xcd, 0x12, 0x34]));
    }

    #[test]
    fn verify_roundtrip() {
        let payload = b"Hello, World!";
        let secret = b"It's a Secret to Everybody";

        let sig = compute_signature(payload, secret);
        let header = format_signature_header(&sig);

        assert!(verify_signature(payload, &header, secret));
    }

    #[test]
    fn verify_bare_hex_header() {
        let payload = b"payload";
        let secret = b"secret";

        let header = hex::encode(compute_signature(payload, secret));
        assert!(verify_signature(payload, &header, secret));
    }

    #[test]
    fn verify_wrong_secret() {
        let payload = b"test payload";
        let correct_secret = b"correct-secret";
        let wrong_secret = b"wrong-secret";

        let sig = compute_signature(payload, correct_secret);
        let header = format_signature_header(&sig);

        assert!(verify_signature(payload, &header, correct_secret));
        assert!(!verify_signature(payload, &header, wrong_secret));
    }

    #[test]
    fn verify_modified_payload() {
        let original = b"original payload";
        let modified = b"modified payload";
        let secret = b"secret";

        let sig = compute_signature(original, secret);
        let header = format_signature_header(&sig);

        assert!(verify_signature(original, &header, secret));
        assert!(!verify_signature(modified, &header, secret));
    }

    #[test]
    fn verify_flipped_last_digit_fails() {
        let payload = b"test payload";
        let secret = b"s3cret";

        let mut hex_sig = hex::encode(compute_signature(payload, secret));
        let last = hex_sig.pop().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        hex_sig.push(flipped);

        assert!(!verify_signature(payload, &format!("sha256={hex_sig}"), secret));
    }

    #[test]
    fn verify_malformed_header_returns_false() {
        let payload = b"test";
        let secret = b"secret";

        // Malformed headers should all return false, not panic
        assert!(!verify_signature(payload, "", secret));
        assert!(!verify_signature(payload, "sha256=", secret));
        assert!(!verify_signature(payload, "sha256=invalid", secret));
        assert!(!verify_signature(payload, "not hex at all", secret));
        assert!(!verify_signature(payload, "sha256=zzzz", secret));
    }

    #[test]
    fn verify_truncated_signature_fails() {
        let payload = b"test payload";
        let secret = b"secret";

        let sig = compute_signature(payload, secret);
        let header = format!("sha256={}", hex::encode(&sig[..16]));
        assert!(!verify_signature(payload, &header, secret));
    }

    #[test]
    fn verify_empty_payload() {
        let payload = b"";
        let secret = b"secret";

        let sig = compute_signature(payload, secret);
        let header = format_signature_header(&sig);

        assert!(verify_signature(payload, &header, secret));
    }

    #[test]
    fn verify_empty_secret() {
        let payload = b"test payload";
        let secret = b"";

        let sig = compute_signature(payload, secret);
        let header = format_signature_header(&sig);

        assert!(verify_signature(payload, &header, secret));
    }

    #[test]
    fn verify_binary_payload() {
        let payload = &[0x00, 0x01, 0xff, 0xfe, 0x00, 0x00, 0x7f];
        let secret = b"secret";

        let sig = compute_signature(payload, secret);
        let header = format_signature_header(&sig);

        assert!(verify_signature(payload, &header, secret));
    }

    #[test]
    fn signature_is_32_bytes() {
        let sig = compute_signature(b"any payload", b"any secret");
        assert_eq!(sig.len(), 32);
    }

    // ========================================================================
    // Property-based tests
    // ========================================================================

    proptest! {
        /// Property: verify(payload, sign(payload, secret), secret) == true
        #[test]
        fn prop_sign_verify_roundtrip(payload: Vec<u8>, secret: Vec<u8>) {
            let sig = compute_signature(&payload, &secret);
            let header = format_signature_header(&sig);
            prop_assert!(verify_signature(&payload, &header, &secret));
        }

        /// Property: signing with one secret and verifying with a different
        /// secret always fails.
        #[test]
        fn prop_wrong_secret_fails(payload: Vec<u8>, secret1: Vec<u8>, secret2: Vec<u8>) {
            prop_assume!(secret1 != secret2);

            let sig = compute_signature(&payload, &secret1);
            let header = format_signature_header(&sig);
            prop_assert!(!verify_signature(&payload, &header, &secret2));
        }

        /// Property: any modification to the payload causes verification
        /// to fail.
        #[test]
        fn prop_modified_payload_fails(
            original: Vec<u8>,
            modified: Vec<u8>,
            secret: Vec<u8>
        ) {
            prop_assume!(original != modified);

            let sig = compute_signature(&original, &secret);
            let header = format_signature_header(&sig);
            prop_assert!(!verify_signature(&modified, &header, &secret));
        }

        /// Property: normalize(format(signature)) roundtrips.
        #[test]
        fn prop_format_normalize_roundtrip(signature: [u8; 32]) {
            let header = format_signature_header(&signature);
            let parsed = normalize_signature_header(&header);
            prop_assert_eq!(parsed, Some(signature.to_vec()));
        }

        /// Property: compute_signature is deterministic.
        #[test]
        fn prop_signature_deterministic(payload: Vec<u8>, secret: Vec<u8>) {
            let sig1 = compute_signature(&payload, &secret);
            let sig2 = compute_signature(&payload, &secret);
            prop_assert_eq!(sig1, sig2);
        }

        /// Property: malformed headers never cause a panic.
        #[test]
        fn prop_malformed_header_no_panic(header: String, payload: Vec<u8>, secret: Vec<u8>) {
            let _ = normalize_signature_header(&header);
            let _ = verify_signature(&payload, &header, &secret);
        }
    }
}
