//! Payload codecs for the persistent cache tier
//!
//! The cache logic never touches a cryptographic or compression primitive
//! directly; it hands serialized entry bytes to a [`Codec`] and stores
//! whatever envelope comes back. Swapping or disabling a transform never
//! touches cache invariants.

use aes_gcm::{
    aead::{
        rand_core::{OsRng, RngCore},
        Aead, KeyInit,
    },
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version tag carried by encrypted envelopes; an unknown future version
/// makes the payload undecodable (treated as absent by the store).
pub const ENCRYPTION_VERSION: u8 = 1;

/// Zstd compression level for cache payloads.
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize payload: {0}")]
    Serialization(String),
    #[error("failed to deserialize payload: {0}")]
    Deserialization(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("unsupported payload version {found} (supported up to {supported})")]
    VersionMismatch { found: u8, supported: u8 },
    #[error("payload encoding does not match codec")]
    EncodingMismatch,
}

/// On-disk envelope for one cache entry.
///
/// `Plain` keeps the entry inline as JSON; `Compressed` holds base64 zstd
/// bytes; `Encrypted` is the `{data, salt, iv, version}` wrapping produced
/// by the authenticated cipher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum StoredPayload {
    Plain {
        body: serde_json::Value,
    },
    Compressed {
        body: String,
    },
    Encrypted {
        data: String,
        salt: String,
        iv: String,
        version: u8,
    },
}

/// Reversible transform between entry bytes and a stored envelope.
pub trait Codec: Send + Sync {
    fn encode(&self, plain: &[u8]) -> Result<StoredPayload, CodecError>;
    fn decode(&self, payload: &StoredPayload) -> Result<Vec<u8>, CodecError>;
}

/// No transform; the entry is stored as readable JSON.
#[derive(Debug, Clone, Default)]
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn encode(&self, plain: &[u8]) -> Result<StoredPayload, CodecError> {
        let body = serde_json::from_slice(plain)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        Ok(StoredPayload::Plain { body })
    }

    fn decode(&self, payload: &StoredPayload) -> Result<Vec<u8>, CodecError> {
        match payload {
            StoredPayload::Plain { body } => {
                serde_json::to_vec(body).map_err(|e| CodecError::Deserialization(e.to_string()))
            }
            _ => Err(CodecError::EncodingMismatch),
        }
    }
}

/// Zstd compression with a raw fallback.
///
/// When compression does not shrink the payload the plain envelope is
/// stored instead, so decoding must accept both shapes.
#[derive(Debug, Clone)]
pub struct ZstdCodec {
    level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: ZSTD_LEVEL }
    }
}

impl Codec for ZstdCodec {
    fn encode(&self, plain: &[u8]) -> Result<StoredPayload, CodecError> {
        let compressed = zstd::stream::encode_all(plain, self.level)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        if compressed.len() >= plain.len() {
            return PlainCodec.encode(plain);
        }
        Ok(StoredPayload::Compressed {
            body: BASE64.encode(compressed),
        })
    }

    fn decode(&self, payload: &StoredPayload) -> Result<Vec<u8>, CodecError> {
        match payload {
            StoredPayload::Compressed { body } => {
                let compressed = BASE64
                    .decode(body)
                    .map_err(|e| CodecError::Deserialization(e.to_string()))?;
                zstd::stream::decode_all(compressed.as_slice())
                    .map_err(|e| CodecError::Deserialization(e.to_string()))
            }
            StoredPayload::Plain { .. } => PlainCodec.decode(payload),
            _ => Err(CodecError::EncodingMismatch),
        }
    }
}

/// AES-256-GCM with an Argon2 key derived from the owner address.
///
/// Salt and nonce are random per entry; both travel in the envelope. The
/// owner address is key material, not a secret: this tier hides cached
/// balances from casual inspection of local storage, nothing more.
#[derive(Debug, Clone)]
pub struct EncryptedCodec {
    key_material: String,
}

impl EncryptedCodec {
    /// Salt length in bytes.
    const SALT_LEN: usize = 16;
    /// AES-GCM nonce length in bytes.
    const NONCE_LEN: usize = 12;

    pub fn for_owner(owner: &str) -> Self {
        Self {
            key_material: owner.to_ascii_lowercase(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<Key<Aes256Gcm>, CodecError> {
        let mut key_bytes = [0u8; 32];
        Argon2::default()
            .hash_password_into(self.key_material.as_bytes(), salt, &mut key_bytes)
            .map_err(|e| CodecError::Encryption(format!("key derivation failed: {}", e)))?;
        Ok(*Key::<Aes256Gcm>::from_slice(&key_bytes))
    }
}

impl Codec for EncryptedCodec {
    fn encode(&self, plain: &[u8]) -> Result<StoredPayload, CodecError> {
        let mut salt = [0u8; Self::SALT_LEN];
        let mut nonce_bytes = [0u8; Self::NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(&key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plain)
            .map_err(|e| CodecError::Encryption(e.to_string()))?;

        Ok(StoredPayload::Encrypted {
            data: BASE64.encode(ciphertext),
            salt: BASE64.encode(salt),
            iv: BASE64.encode(nonce_bytes),
            version: ENCRYPTION_VERSION,
        })
    }

    fn decode(&self, payload: &StoredPayload) -> Result<Vec<u8>, CodecError> {
        let (data, salt, iv, version) = match payload {
            StoredPayload::Encrypted {
                data,
                salt,
                iv,
                version,
            } => (data, salt, iv, *version),
            _ => return Err(CodecError::EncodingMismatch),
        };

        if version > ENCRYPTION_VERSION {
            return Err(CodecError::VersionMismatch {
                found: version,
                supported: ENCRYPTION_VERSION,
            });
        }

        let ciphertext = BASE64
            .decode(data)
            .map_err(|e| CodecError::Decryption(e.to_string()))?;
        let salt = BASE64
            .decode(salt)
            .map_err(|e| CodecError::Decryption(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(iv)
            .map_err(|e| CodecError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != Self::NONCE_LEN {
            return Err(CodecError::Decryption("bad nonce length".to_string()));
        }

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(&key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|_| CodecError::Decryption("authentication failed".to_string()))
    }
}
