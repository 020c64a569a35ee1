//! Idempotency-key helpers shared by the endpoints that accept one.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

const MAX_KEY_LEN: usize = 128;

/// Trim a caller-supplied key; blank keys count as absent.
pub fn normalize_key(key: Option<&str>) -> Result<Option<String>> {
    let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    if key.len() > MAX_KEY_LEN {
        return Err(AppError::validation(format!(
            "Idempotency key must be at most {MAX_KEY_LEN} characters"
        )));
    }
    Ok(Some(key.to_string()))
}

pub fn require_key(key: Option<&str>) -> Result<String> {
    normalize_key(key)?.ok_or_else(|| AppError::validation("An idempotency key is required"))
}

/// SHA-256 over the canonical JSON of the payload. Struct fields serialize in
/// declaration order, so equal payloads hash equally.
pub fn payload_hash<T: Serialize>(payload: &T) -> Result<String> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| AppError::Internal(format!("cannot hash payload: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Compare a stored hash with the hash of a replayed request.
pub fn check_replay(key: &str, stored_hash: Option<&str>, hash: &str) -> Result<()> {
    match stored_hash {
        Some(stored) if stored != hash => Err(AppError::IdempotencyMismatch(key.to_string())),
        _ => Ok(()),
    }
}
