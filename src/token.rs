//! Start tokens: sealed, authenticated payloads that seed a new session's
//! agent/model/context.
//!
//! Sealing uses AES-256-GCM: a random 96-bit nonce, the JSON-encoded
//! payload as plaintext, no additional authenticated data. The sealed
//! token is `base64(nonce || ciphertext)`. `issued_at` is stamped by
//! `pack` and checked against a 24-hour freshness window by `unpack`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TokenError;

pub const FRESHNESS_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartTokenParams {
    pub agent: String,
    pub model: Option<String>,
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    pub start_func: Option<String>,
    #[serde(default)]
    pub start_params: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Sealing/unsealing key, parsed from a hex string of 16, 24, or 32 bytes.
///
/// AES-256-GCM needs exactly 32 key bytes; 16/24-byte keys are accepted
/// and expanded to 32 bytes by zero-padding, treating shorter keys as
/// valid-but-weaker secrets rather than rejecting them.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; 32],
}

impl EncryptionKey {
    pub fn from_hex(hex_str: &str) -> Result<Self, TokenError> {
        let raw = hex::decode(hex_str).map_err(|e| TokenError::Malformed {
            reason: e.to_string(),
        })?;
        if ![16, 24, 32].contains(&raw.len()) {
            return Err(TokenError::InvalidKeyLength { len: raw.len() });
        }
        let mut bytes = [0u8; 32];
        bytes[..raw.len()].copy_from_slice(&raw);
        Ok(Self { bytes })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes))
    }
}

/// Seal `params`, stamping `issued_at = now`, and return the token string.
pub fn pack(key: &EncryptionKey, mut params: StartTokenParams) -> Result<String, TokenError> {
    params.issued_at = Some(Utc::now());
    let plaintext = serde_json::to_vec(&params).map_err(|e| TokenError::Malformed {
        reason: e.to_string(),
    })?;

    let cipher = key.cipher();
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_ref())
        .map_err(|_| TokenError::Tamper)?;

    let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

/// Unseal a token, verifying the AEAD tag and the freshness window.
pub fn unpack(key: &EncryptionKey, token: &str) -> Result<StartTokenParams, TokenError> {
    let sealed = BASE64.decode(token).map_err(|e| TokenError::Malformed {
        reason: e.to_string(),
    })?;
    if sealed.len() < 12 {
        return Err(TokenError::Malformed {
            reason: "token shorter than the nonce".to_string(),
        });
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = key
        .cipher()
        .decrypt(nonce, ciphertext)
        .map_err(|_| TokenError::Tamper)?;

    let params: StartTokenParams =
        serde_json::from_slice(&plaintext).map_err(|e| TokenError::Malformed {
            reason: e.to_string(),
        })?;

    let issued_at = params.issued_at.ok_or(TokenError::Malformed {
        reason: "missing issued_at".to_string(),
    })?;
    if Utc::now().signed_duration_since(issued_at) > FRESHNESS_WINDOW {
        return Err(TokenError::Expired);
    }

    Ok(params)
}
