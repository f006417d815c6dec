//! Payload compression used by the storage engine.
//!
//! Payloads are JSON-encoded, then compressed with zstd. The transform is lossless and
//! deterministic for a given level.

use serde_json::Value;

pub const DEFAULT_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zstd codec failure: {0}")]
    Codec(#[from] std::io::Error),
}

/// Compressed payload plus the size of its uncompressed JSON encoding.
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub bytes: Vec<u8>,
    pub original_len: usize,
}

pub fn compress(value: &Value, level: i32) -> Result<CompressedPayload, CompressionError> {
    let raw = serde_json::to_vec(value)?;
    let bytes = zstd::encode_all(raw.as_slice(), level)?;

    Ok(CompressedPayload {
        bytes,
        original_len: raw.len(),
    })
}

pub fn decompress(bytes: &[u8]) -> Result<Value, CompressionError> {
    let raw = zstd::decode_all(bytes)?;
    Ok(serde_json::from_slice(&raw)?)
}
