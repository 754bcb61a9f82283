// src/utils/signature.rs

//! Authenticity checks for inbound webhooks.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Clock skew accepted on signed deliveries, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: u64 = 5 * 60;

const QSTASH_ISSUER: &str = "Upstash";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("signature does not match")]
    Mismatch,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("body hash does not match signature")]
    BodyMismatch,
}

#[derive(Debug, Deserialize)]
struct QstashClaims {
    body: String,
}

/// Verifies an `Upstash-Signature` JWT against the current signing key, then the
/// next one, so deliveries keep validating while keys rotate.
pub fn verify_qstash(
    signature: &str,
    body: &[u8],
    current_key: &str,
    next_key: &str,
) -> Result<(), SignatureError> {
    match verify_qstash_with_key(signature, body, current_key) {
        Ok(()) => Ok(()),
        Err(SignatureError::BodyMismatch) => Err(SignatureError::BodyMismatch),
        Err(_) => verify_qstash_with_key(signature, body, next_key),
    }
}

fn verify_qstash_with_key(signature: &str, body: &[u8], key: &str) -> Result<(), SignatureError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = SIGNATURE_TOLERANCE_SECS;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation.set_issuer(&[QSTASH_ISSUER]);

    let claims = decode::<QstashClaims>(
        signature,
        &DecodingKey::from_secret(key.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature
        | jsonwebtoken::errors::ErrorKind::ImmatureSignature => SignatureError::Expired,
        jsonwebtoken::errors::ErrorKind::InvalidSignature => SignatureError::Mismatch,
        _ => SignatureError::Malformed(e.to_string()),
    })?
    .claims;

    if claims.body.trim_end_matches('=') != body_hash(body) {
        return Err(SignatureError::BodyMismatch);
    }
    Ok(())
}

/// base64url SHA-256 of a request body, without padding.
pub fn body_hash(body: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}

/// Verifies a `Stripe-Signature` header (`t=<unix>,v1=<hex hmac>,...`) for `payload`.
pub fn verify_stripe(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed("bad timestamp".to_string()))?,
                );
            }
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("missing timestamp".into()))?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed("missing v1 signature".into()));
    }
    if now_unix.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let matches = candidates.iter().filter_map(|c| decode_hex(c)).any(|expected| {
        let mut mac = stripe_mac(secret);
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected).is_ok()
    });

    if matches { Ok(()) } else { Err(SignatureError::Mismatch) }
}

/// Produces the `v1` value for a payload; used when answering test deliveries.
pub fn stripe_signature(payload: &str, secret: &str, timestamp: i64) -> String {
    let mut mac = stripe_mac(secret);
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn stripe_mac(secret: &str) -> Hmac<Sha256> {
    // HMAC accepts keys of any length.
    <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).expect("hmac key of any size")
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(value.get(i..i + 2)?, 16).ok())
        .collect()
}
