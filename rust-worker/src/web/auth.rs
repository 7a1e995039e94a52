//! Request authentication.
//!
//! - Mailgun signs webhook requests using HMAC-SHA256 over `timestamp + token`.
//!   Reference: https://documentation.mailgun.com/docs/mailgun/user-manual/events/webhooks/#securing-webhooks
//! - Cloudflare Email Workers send a shared secret in `X-Custom-Auth`.
//! - The jobs API takes an optional `Authorization: Bearer <token>`.
//!
//! All secret comparisons are constant-time.

use axum::http::{header, HeaderMap};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const CLOUDFLARE_AUTH_HEADER: &str = "X-Custom-Auth";

/// Verify a Mailgun webhook signature and reject stale timestamps
/// (older or newer than `max_age_seconds`) to prevent replays.
pub fn verify_mailgun_signature(
    signing_key: &str,
    timestamp: &str,
    token: &str,
    signature: &str,
    max_age_seconds: u64,
) -> bool {
    if signing_key.is_empty() || timestamp.is_empty() || token.is_empty() || signature.is_empty() {
        warn!(
            has_timestamp = !timestamp.is_empty(),
            has_token = !token.is_empty(),
            has_signature = !signature.is_empty(),
            "mailgun_signature_missing_fields"
        );
        return false;
    }

    let webhook_time: i64 = match timestamp.parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp = %timestamp, "mailgun_signature_invalid_timestamp");
            return false;
        }
    };

    let age = Utc::now().timestamp().abs_diff(webhook_time);
    if age > max_age_seconds {
        warn!(
            webhook_time = webhook_time,
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "mailgun_signature_stale"
        );
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(signing_key.as_bytes()) else {
        warn!("mailgun_signature_invalid_key");
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let valid = constant_time_eq(expected.as_bytes(), signature.to_ascii_lowercase().as_bytes());
    if !valid {
        warn!(actual_length = signature.len(), "mailgun_signature_mismatch");
    }
    valid
}

/// Compare two secrets without short-circuiting on the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A configured secret that is not just whitespace.
pub fn configured(secret: &Option<String>) -> Option<&str> {
    secret.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Why a request failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
}

/// Check a shared-secret header. Passes when no secret is configured.
pub fn check_header_secret(
    headers: &HeaderMap,
    name: &str,
    expected: Option<&str>,
) -> Result<(), AuthFailure> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match headers.get(name).and_then(|v| v.to_str().ok()) {
        None => Err(AuthFailure::Missing),
        Some(provided) if constant_time_eq(provided.as_bytes(), expected.as_bytes()) => Ok(()),
        Some(_) => Err(AuthFailure::Invalid),
    }
}

/// Check `Authorization: Bearer <token>`. Passes when no token is configured.
pub fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AuthFailure> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match provided {
        None => Err(AuthFailure::Missing),
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        Some(_) => Err(AuthFailure::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sign(key: &str, timestamp: &str, token: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}{}", timestamp, token).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_verify_signature_missing_fields() {
        assert!(!verify_mailgun_signature("", "123", "token", "sig", 300));
        assert!(!verify_mailgun_signature("key", "", "token", "sig", 300));
        assert!(!verify_mailgun_signature("key", "123", "", "sig", 300));
        assert!(!verify_mailgun_signature("key", "123", "token", "", 300));
    }

    #[test]
    fn test_verify_signature_invalid_timestamp() {
        assert!(!verify_mailgun_signature("key", "not-a-number", "token", "sig", 300));
    }

    #[test]
    fn test_verify_signature_stale() {
        let old = "946684800"; // year 2000
        let signature = sign("key", old, "token");
        assert!(!verify_mailgun_signature("key", old, "token", &signature, 300));
    }

    #[test]
    fn test_verify_signature_valid() {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign("test-signing-key", &timestamp, "random-token");

        assert!(verify_mailgun_signature(
            "test-signing-key",
            &timestamp,
            "random-token",
            &signature,
            300
        ));
        assert!(!verify_mailgun_signature(
            "other-key",
            &timestamp,
            "random-token",
            &signature,
            300
        ));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_configured() {
        assert_eq!(configured(&None), None);
        assert_eq!(configured(&Some("   ".to_string())), None);
        assert_eq!(configured(&Some("key123".to_string())), Some("key123"));
    }

    #[test]
    fn test_check_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(check_bearer(&headers, None), Ok(()));
        assert_eq!(check_bearer(&headers, Some("s3cret")), Err(AuthFailure::Missing));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert_eq!(check_bearer(&headers, Some("s3cret")), Err(AuthFailure::Invalid));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(check_bearer(&headers, Some("s3cret")), Ok(()));
    }

    #[test]
    fn test_check_header_secret() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            check_header_secret(&headers, CLOUDFLARE_AUTH_HEADER, Some("t")),
            Err(AuthFailure::Missing)
        );
        headers.insert(CLOUDFLARE_AUTH_HEADER, HeaderValue::from_static("t"));
        assert_eq!(check_header_secret(&headers, CLOUDFLARE_AUTH_HEADER, Some("t")), Ok(()));
        assert_eq!(check_header_secret(&headers, CLOUDFLARE_AUTH_HEADER, None), Ok(()));
    }
}
