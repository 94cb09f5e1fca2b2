use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;

use crate::net::xor::XorKey;

/// Upper bound for an inflated object snapshot.
const MAX_INFLATED_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not valid gzip: {0}")]
    Gzip(std::io::Error),
    #[error("{0}")]
    Token(String),
}

/// Envelope codec for push-channel payloads.
///
/// Outbound: compact JSON, XOR with the session key, standard Base64.
/// Object snapshots additionally travel gzip-compressed.
#[derive(Debug, Clone)]
pub struct TransportCodec {
    key: XorKey,
}

impl TransportCodec {
    pub fn new(key: XorKey) -> Self {
        Self { key }
    }

    pub fn for_token(token: &str) -> Result<Self, CodecError> {
        Ok(Self::new(XorKey::from_token(token)?))
    }

    pub fn encode(&self, value: &Value) -> Result<String, CodecError> {
        let mut bytes = serde_json::to_vec(value)?;
        self.key.apply_in_place(&mut bytes);
        Ok(BASE64_ENGINE.encode(bytes))
    }

    pub fn decode(&self, text: &str) -> Result<Value, CodecError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CodecError::Empty);
        }
        let mut bytes = BASE64_ENGINE.decode(text)?;
        self.key.apply_in_place(&mut bytes);
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn encode_packed(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let text = self.encode(value)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(text.as_bytes())
            .map_err(CodecError::Gzip)?;
        encoder.finish().map_err(CodecError::Gzip)
    }

    pub fn decode_packed(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Empty);
        }
        let mut inflated = Vec::new();
        GzDecoder::new(bytes)
            .take(MAX_INFLATED_BYTES)
            .read_to_end(&mut inflated)
            .map_err(CodecError::Gzip)?;
        let text = String::from_utf8_lossy(&inflated);
        self.decode(&text)
    }
}
