use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;

use crate::net::codec::CodecError;

const CLIENT_XOR_CLAIM: &str = "clientXor";
const DEFAULT_CLIENT_XOR: &str = "0";

/// Symmetric byte-wise obfuscation applied to every push-channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorKey {
    key: Vec<u8>,
}

impl XorKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Token("xor key is empty".to_string()));
        }
        Ok(Self {
            key: bytes.to_vec(),
        })
    }

    /// Derives the key from the `clientXor` claim of a session token.
    ///
    /// The token is a JWT; only its payload segment is read. A missing claim
    /// falls back to `"0"`, matching what the service issues to web clients.
    pub fn from_token(token: &str) -> Result<Self, CodecError> {
        let mut segments = token.trim().split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(CodecError::Token(
                "session token is not a three-segment JWT".to_string(),
            ));
        };
        let raw = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|err| CodecError::Token(format!("token payload is not base64url: {err}")))?;
        let claims: Value = serde_json::from_slice(&raw)
            .map_err(|err| CodecError::Token(format!("token payload is not json: {err}")))?;
        let material = match claims.get(CLIENT_XOR_CLAIM) {
            Some(Value::String(value)) if !value.is_empty() => value.clone(),
            Some(Value::Number(value)) => value.to_string(),
            _ => DEFAULT_CLIENT_XOR.to_string(),
        };
        Self::from_bytes(material.as_bytes())
    }

    pub fn apply_in_place(&self, data: &mut [u8]) {
        for (idx, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[idx % self.key.len()];
        }
    }

    pub fn apply_to_vec(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        self.apply_in_place(&mut buf);
        buf
    }
}

#[cfg(test)]
pub(crate) fn token_with_claims(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}
