//! Webhook Signature Verification
//! Mission: Prove a delivery came from a registered producer and is fresh
//!
//! Producers sign `timestamp || "." || raw_body` with HMAC-SHA256 under their
//! shared secret and send the hex digest in `X-Signature`. The body bytes are
//! verified exactly as received, before any JSON decoding.

use crate::clock::SharedClock;
use crate::error::AuthError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";
const MAC_LEN: usize = 32;

/// An authenticated delivery: its parsed timestamp and the decoded MAC bytes.
///
/// Replay detection keys on `mac`, so every header spelling of the same digest
/// (case, `sha256=` prefix, whitespace) maps to one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDelivery {
    pub timestamp: DateTime<Utc>,
    pub mac: Vec<u8>,
}

/// Stateless verifier; the only input besides the request is the clock.
#[derive(Clone)]
pub struct SignatureVerifier {
    clock: SharedClock,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(clock: SharedClock, tolerance: Duration) -> Self {
        Self { clock, tolerance }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Verify a delivery and return its parsed timestamp and decoded MAC.
    ///
    /// Header checks run first, then the clock-skew check, then the MAC. A stale
    /// request is rejected as `ClockSkewExceeded` whether or not its MAC is valid.
    pub fn verify(
        &self,
        raw_body: &[u8],
        provided_signature: Option<&str>,
        secret: &[u8],
        timestamp: Option<&str>,
    ) -> Result<VerifiedDelivery, AuthError> {
        let signature = provided_signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingSignature)?;
        let expected = decode_signature(signature)?;

        let raw_timestamp = timestamp
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingTimestamp)?;
        let ts = parse_timestamp(raw_timestamp)?;

        let now = self.clock.now();
        let skew_ms = (now - ts).num_milliseconds().abs();
        if skew_ms > self.tolerance.as_millis() as i64 {
            debug!(skew_ms, "Webhook timestamp outside tolerance");
            return Err(AuthError::ClockSkewExceeded);
        }

        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::BadSignature)?;
        mac.update(raw_timestamp.as_bytes());
        mac.update(b".");
        mac.update(raw_body);
        mac.verify_slice(&expected)
            .map_err(|_| AuthError::BadSignature)?;

        Ok(VerifiedDelivery {
            timestamp: ts,
            mac: expected,
        })
    }
}

/// Compute the hex signature a producer sends for `body` at `timestamp`.
pub fn sign(secret: &[u8], timestamp: &str, raw_body: &[u8]) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| anyhow!("HMAC key error: {}", e))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn decode_signature(signature: &str) -> Result<Vec<u8>, AuthError> {
    let hex_part = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature);
    let bytes = hex::decode(hex_part).map_err(|_| AuthError::MalformedSignature)?;
    if bytes.len() != MAC_LEN {
        return Err(AuthError::MalformedSignature);
    }
    Ok(bytes)
}

/// Parse an `X-Timestamp` value: Unix seconds, RFC 3339, or a naive ISO-8601
/// date-time taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, AuthError> {
    let raw = raw.trim();

    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = raw.parse().map_err(|_| AuthError::MalformedTimestamp)?;
        return DateTime::from_timestamp(secs, 0).ok_or(AuthError::MalformedTimestamp);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| AuthError::MalformedTimestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    const SECRET: &[u8] = b"producer-secret-0123456789";
    const BODY: &[u8] = br#"{"instrument":"EURUSD","side":"buy"}"#;

    fn verifier(clock: &ManualClock) -> SignatureVerifier {
        SignatureVerifier::new(Arc::new(clock.clone()), Duration::from_secs(300))
    }

    #[test]
    fn accepts_valid_signature_in_both_timestamp_formats() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let v = verifier(&clock);

        let unix = "1700000000";
        let sig = sign(SECRET, unix, BODY).unwrap();
        let delivery = v.verify(BODY, Some(&sig), SECRET, Some(unix)).unwrap();
        assert_eq!(delivery.timestamp.timestamp(), 1_700_000_000);

        let iso = "2023-11-14T22:13:20Z";
        let sig = sign(SECRET, iso, BODY).unwrap();
        let prefixed = format!("sha256={}", sig.to_uppercase());
        assert!(v.verify(BODY, Some(&prefixed), SECRET, Some(iso)).is_ok());
    }

    #[test]
    fn header_spellings_decode_to_same_mac() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let v = verifier(&clock);
        let sig = sign(SECRET, "1700000000", BODY).unwrap();

        let bare = v.verify(BODY, Some(&sig), SECRET, Some("1700000000")).unwrap();
        for spelling in [
            format!("sha256={}", sig),
            sig.to_uppercase(),
            format!("  sha256={} ", sig),
        ] {
            let other = v
                .verify(BODY, Some(&spelling), SECRET, Some("1700000000"))
                .unwrap();
            assert_eq!(other.mac, bare.mac);
        }
        assert_eq!(bare.mac.len(), MAC_LEN);
    }

    #[test]
    fn single_flipped_byte_is_rejected() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let v = verifier(&clock);
        let sig = sign(SECRET, "1700000000", BODY).unwrap();

        let mut tampered = BODY.to_vec();
        tampered[5] ^= 0x01;
        assert_eq!(
            v.verify(&tampered, Some(&sig), SECRET, Some("1700000000")),
            Err(AuthError::BadSignature)
        );
        // Re-serialized JSON with the same meaning is a different byte string.
        let reordered = br#"{"side":"buy","instrument":"EURUSD"}"#;
        assert_eq!(
            v.verify(reordered, Some(&sig), SECRET, Some("1700000000")),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn timestamp_is_bound_into_mac() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let v = verifier(&clock);
        let sig = sign(SECRET, "1700000000", BODY).unwrap();

        assert_eq!(
            v.verify(BODY, Some(&sig), SECRET, Some("1700000001")),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn skew_is_checked_before_mac() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let v = verifier(&clock);

        let stale = "1699999699"; // 301s old
        let sig = sign(SECRET, stale, BODY).unwrap();
        assert_eq!(
            v.verify(BODY, Some(&sig), SECRET, Some(stale)),
            Err(AuthError::ClockSkewExceeded)
        );
        // Garbage MAC on a stale request still reports skew.
        assert_eq!(
            v.verify(BODY, Some(&"00".repeat(32)), SECRET, Some(stale)),
            Err(AuthError::ClockSkewExceeded)
        );

        // Exactly at the tolerance edge is accepted, both directions.
        for edge in ["1699999700", "1700000300"] {
            let sig = sign(SECRET, edge, BODY).unwrap();
            assert!(v.verify(BODY, Some(&sig), SECRET, Some(edge)).is_ok());
        }
    }

    #[test]
    fn header_errors_are_distinct() {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let v = verifier(&clock);
        let sig = sign(SECRET, "1700000000", BODY).unwrap();

        assert_eq!(
            v.verify(BODY, None, SECRET, Some("1700000000")),
            Err(AuthError::MissingSignature)
        );
        assert_eq!(
            v.verify(BODY, Some("not-hex"), SECRET, Some("1700000000")),
            Err(AuthError::MalformedSignature)
        );
        assert_eq!(
            v.verify(BODY, Some("abcd"), SECRET, Some("1700000000")),
            Err(AuthError::MalformedSignature)
        );
        assert_eq!(
            v.verify(BODY, Some(&sig), SECRET, None),
            Err(AuthError::MissingTimestamp)
        );
        assert_eq!(
            v.verify(BODY, Some(&sig), SECRET, Some("yesterday")),
            Err(AuthError::MalformedTimestamp)
        );
    }

    #[test]
    fn parses_naive_iso_timestamp_as_utc() {
        let ts = parse_timestamp("2026-03-02T09:30:00.250").unwrap();
        assert_eq!(ts.timestamp_millis() % 1000, 250);
        assert!(parse_timestamp("-5").is_err());
    }
}
