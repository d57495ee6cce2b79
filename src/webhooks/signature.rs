//! Webhook signature verification.
//!
//! Pure functions deciding whether an inbound delivery may be trusted. The
//! parsed payload is only exposed on success; every failure path returns a
//! `Verification` with a distinct message so callers can log the specific
//! cause (missing header, missing secret, and bad signature are never
//! conflated).

use ring::hmac;
use serde_json::Value;
use subtle::ConstantTimeEq;

/// HMAC algorithm for signature computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HmacAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HmacAlgorithm {
    fn ring_algorithm(&self) -> hmac::Algorithm {
        match self {
            Self::Sha256 => hmac::HMAC_SHA256,
            Self::Sha384 => hmac::HMAC_SHA384,
            Self::Sha512 => hmac::HMAC_SHA512,
        }
    }
}

/// Outcome of a verification attempt.
#[derive(Debug, Clone)]
pub struct Verification {
    pub verified: bool,
    pub error: Option<String>,
    /// Parsed JSON payload, present only when verified
    pub payload: Option<Value>,
}

impl Verification {
    fn ok(payload: Value) -> Self {
        Self {
            verified: true,
            error: None,
            payload: Some(payload),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            verified: false,
            error: Some(message.into()),
            payload: None,
        }
    }
}

/// Compute the hex HMAC signature of a payload.
pub fn compute_signature(secret: &str, payload: &[u8], algorithm: HmacAlgorithm) -> String {
    let key = hmac::Key::new(algorithm.ring_algorithm(), secret.as_bytes());
    hex::encode(hmac::sign(&key, payload).as_ref())
}

/// Verify a hex HMAC signature against a raw payload.
///
/// A supplied signature whose length differs from the computed one is an
/// invalid *format* (short-circuits before the timing-safe comparison); a
/// same-length mismatch is an invalid *signature*. On success the payload is
/// parsed as JSON; parse failure is reported as not-verified rather than
/// propagated.
pub fn verify_hmac(
    payload: &[u8],
    signature: &str,
    secret: &str,
    algorithm: HmacAlgorithm,
) -> Verification {
    let expected = compute_signature(secret, payload, algorithm);

    if signature.len() != expected.len() {
        return Verification::failed("Invalid signature format");
    }

    let matches: bool = signature
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into();
    if !matches {
        return Verification::failed("Invalid signature");
    }

    match serde_json::from_slice(payload) {
        Ok(value) => Verification::ok(value),
        Err(e) => Verification::failed(format!("Invalid payload: {}", e)),
    }
}

/// Verify a delivery given optional header and secret, reporting missing
/// header, missing secret, and signature failure as distinct conditions.
pub fn verify_request(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: Option<&str>,
    algorithm: HmacAlgorithm,
) -> Verification {
    let Some(signature) = signature_header.filter(|s| !s.is_empty()) else {
        return Verification::failed("Missing signature header");
    };
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Verification::failed("Webhook secret not configured");
    };

    verify_hmac(payload, signature, secret, algorithm)
}

/// Default tolerance for signed-timestamp verification (seconds).
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Verify a signed-timestamp header of the form `t=<unix>,v1=<hex>`
/// (payments-provider scheme): the signature covers `"{t}.{body}"` and the
/// timestamp must fall within the tolerance window.
pub fn verify_signed_timestamp(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
) -> Verification {
    verify_signed_timestamp_at(
        payload,
        header,
        secret,
        tolerance_secs,
        chrono::Utc::now().timestamp(),
    )
}

fn verify_signed_timestamp_at(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Verification {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<&str> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }

    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return Verification::failed("Invalid signature header format");
    };

    if (now_unix - timestamp).abs() > tolerance_secs {
        return Verification::failed("Timestamp outside tolerance window");
    }

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let expected = compute_signature(secret, signed_payload.as_bytes(), HmacAlgorithm::Sha256);

    if signature.len() != expected.len() {
        return Verification::failed("Invalid signature format");
    }
    let matches: bool = signature.as_bytes().ct_eq(expected.as_bytes()).into();
    if !matches {
        return Verification::failed("Invalid signature");
    }

    match serde_json::from_slice(payload) {
        Ok(value) => Verification::ok(value),
        Err(e) => Verification::failed(format!("Invalid payload: {}", e)),
    }
}
