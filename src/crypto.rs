use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64URL};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::proto::AuditEntry;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("canonicalization error: {0}")]
    Canonicalization(String),
    #[error("base64 decode failed")]
    Base64,
    #[error("invalid key material")]
    KeyMaterial,
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let json_value = serde_json::to_value(value)?;
    canonical_json_value(&json_value)
}

pub fn canonical_json_value(value: &Value) -> Result<Vec<u8>, CryptoError> {
    serde_jcs::to_vec(value).map_err(|e| CryptoError::Canonicalization(e.to_string()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn strip_field<T: Serialize>(value: &T, field: &str) -> Result<Value, CryptoError> {
    let mut json_value = serde_json::to_value(value)?;
    if let Value::Object(ref mut map) = json_value {
        map.remove(field);
    }
    Ok(json_value)
}

/// Chain-hash an audit entry: SHA-256 over the previous entry's hash (empty
/// string for the first entry), a `|` separator, and the canonical JSON of
/// the entry with its own `chain_hash` removed.
pub fn compute_entry_hash(prev_hash: &str, entry: &AuditEntry) -> Result<String, CryptoError> {
    let payload = strip_field(entry, "chain_hash")?;
    let canonical = canonical_json_value(&payload)?;

    let mut preimage = Vec::with_capacity(prev_hash.len() + 1 + canonical.len());
    preimage.extend_from_slice(prev_hash.as_bytes());
    preimage.push(b'|');
    preimage.extend_from_slice(&canonical);
    Ok(sha256_hex(&preimage))
}

// ---------------------------------------------------------------------------
// Signing-key material
// ---------------------------------------------------------------------------

pub fn signing_key_from_b64(secret_b64: &str) -> Result<SigningKey, CryptoError> {
    let raw = B64.decode(secret_b64).map_err(|_| CryptoError::Base64)?;
    let arr: [u8; 32] = raw.try_into().map_err(|_| CryptoError::KeyMaterial)?;
    Ok(SigningKey::from_bytes(&arr))
}

pub fn signing_key_to_b64(key: &SigningKey) -> String {
    B64.encode(key.to_bytes())
}

pub fn verifying_key_to_b64url(key: &VerifyingKey) -> String {
    B64URL.encode(key.to_bytes())
}

/// Token segments are unpadded base64url per the three-segment wire format.
pub fn b64url_encode(bytes: &[u8]) -> String {
    B64URL.encode(bytes)
}

pub fn b64url_decode(segment: &str) -> Result<Vec<u8>, CryptoError> {
    B64URL.decode(segment).map_err(|_| CryptoError::Base64)
}

// ---------------------------------------------------------------------------
// Static credentials
// ---------------------------------------------------------------------------

/// Generate a prefixed random secret, e.g. `agk_…` or `adk_…`.
pub fn generate_secret(prefix: &str) -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    format!("{prefix}{}", B64URL.encode(raw))
}

/// Generate a prefixed opaque identifier, e.g. `agt_…` or `adm_…`.
pub fn generate_id(prefix: &str) -> String {
    let mut raw = [0u8; 12];
    OsRng.fill_bytes(&mut raw);
    format!("{prefix}{}", B64URL.encode(raw))
}

pub fn hash_secret(secret: &str) -> String {
    sha256_hex(secret.as_bytes())
}

/// First characters of a secret, kept for diagnostics after the raw value
/// is discarded.
pub fn secret_prefix(secret: &str) -> String {
    secret.chars().take(12).collect()
}

// ---------------------------------------------------------------------------
// Webhook signature
// ---------------------------------------------------------------------------

/// Hex HMAC-SHA256 of the payload body, carried as `sha256=<hex>`.
pub fn webhook_signature(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
