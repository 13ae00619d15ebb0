// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Object Store Key Client Trait - Anti-Corruption Layer for KMS-wrapped keys
//!
//! With the KMS_OBJECT_STORE key source a host's passphrase is an object in
//! a bucket, named after the host. The object carries the passphrase sealed
//! with a one-off AES-256 data key, next to that data key wrapped by the KMS
//! master key. Only a caller allowed to decrypt with the master key (the
//! fetcher on the host) can recover the passphrase.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::domain::secret::{ObjectStoreLocation, Passphrase};

/// AES-256 key length in bytes.
pub const DATA_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// A data encryption key as the KMS hands it out.
pub struct DataKey {
    /// Wrapped by the master key; safe to store next to the data.
    pub ciphertext: String,
    pub plaintext: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("ciphertext", &self.ciphertext)
            .field("plaintext", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait ObjectStoreKeyClient: Send + Sync {
    /// Fresh data key wrapped under `location.kms_key_id`.
    async fn generate_data_key(&self, location: &ObjectStoreLocation) -> Result<DataKey, ObjectStoreError>;

    async fn object_exists(&self, location: &ObjectStoreLocation, name: &str) -> Result<bool, ObjectStoreError>;

    /// Create or replace `name`.
    async fn put_object(
        &self,
        location: &ObjectStoreLocation,
        name: &str,
        body: Vec<u8>,
    ) -> Result<(), ObjectStoreError>;

    async fn delete_object(&self, location: &ObjectStoreLocation, name: &str) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store network error: {0}")]
    Network(String),

    #[error("object store request timed out: {0}")]
    Timeout(String),

    #[error("object store rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected object store response: {0}")]
    InvalidResponse(String),

    #[error("sealing the passphrase failed: {0}")]
    Crypto(String),
}

impl ObjectStoreError {
    /// Transport-level failures a read may be retried on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

/// JSON body of a passphrase object. The field names are what the fetcher
/// on the host parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPassphrase {
    #[serde(rename = "encDEK")]
    pub wrapped_key: String,
    /// Base64 of nonce followed by AES-256-GCM ciphertext.
    #[serde(rename = "encData")]
    pub sealed: String,
}

impl SealedPassphrase {
    pub fn seal(passphrase: &Passphrase, key: &DataKey) -> Result<Self, ObjectStoreError> {
        let cipher = Aes256Gcm::new_from_slice(&key.plaintext)
            .map_err(|_| ObjectStoreError::Crypto(format!("data key is not {} bytes", DATA_KEY_BYTES)))?;
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), passphrase.expose().as_bytes())
            .map_err(|e| ObjectStoreError::Crypto(e.to_string()))?;

        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(Self {
            wrapped_key: key.ciphertext.clone(),
            sealed: STANDARD.encode(payload),
        })
    }

    /// Recover the passphrase with the unwrapped data key.
    pub fn open(&self, plaintext_key: &[u8]) -> Result<Passphrase, ObjectStoreError> {
        let payload = STANDARD
            .decode(self.sealed.trim())
            .map_err(|e| ObjectStoreError::Crypto(format!("encData is not base64: {}", e)))?;
        if payload.len() <= NONCE_BYTES {
            return Err(ObjectStoreError::Crypto("encData is truncated".to_string()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_BYTES);
        let cipher = Aes256Gcm::new_from_slice(plaintext_key)
            .map_err(|_| ObjectStoreError::Crypto(format!("data key is not {} bytes", DATA_KEY_BYTES)))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| ObjectStoreError::Crypto("data key does not open encData".to_string()))?,
        );
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| ObjectStoreError::Crypto("passphrase is not UTF-8".to_string()))?;
        Ok(Passphrase::from_plaintext(text))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ObjectStoreError> {
        serde_json::to_vec(self).map_err(|e| ObjectStoreError::Crypto(e.to_string()))
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, ObjectStoreError> {
        serde_json::from_slice(body).map_err(|e| ObjectStoreError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_key(byte: u8) -> DataKey {
        DataKey {
            ciphertext: format!("wrapped-{}", byte),
            plaintext: Zeroizing::new(vec![byte; DATA_KEY_BYTES]),
        }
    }

    #[test]
    fn test_sealed_passphrase_opens_only_with_its_key() {
        let passphrase = Passphrase::generate();
        let sealed = SealedPassphrase::seal(&passphrase, &data_key(7)).unwrap();
        assert_eq!(sealed.wrapped_key, "wrapped-7");
        assert!(!sealed.sealed.contains(passphrase.expose()));

        let body = sealed.to_bytes().unwrap();
        let text = String::from_utf8(body.clone()).unwrap();
        assert!(text.contains("\"encDEK\"") && text.contains("\"encData\""));

        let parsed = SealedPassphrase::from_slice(&body).unwrap();
        assert_eq!(parsed.open(&[7u8; DATA_KEY_BYTES]).unwrap(), passphrase);
        assert!(matches!(
            parsed.open(&[8u8; DATA_KEY_BYTES]),
            Err(ObjectStoreError::Crypto(_))
        ));
    }

    #[test]
    fn test_short_key_and_truncated_payload_are_rejected() {
        let short = DataKey {
            ciphertext: "w".into(),
            plaintext: Zeroizing::new(vec![1u8; 16]),
        };
        assert!(SealedPassphrase::seal(&Passphrase::generate(), &short).is_err());

        let truncated = SealedPassphrase {
            wrapped_key: "w".into(),
            sealed: STANDARD.encode([0u8; 4]),
        };
        assert!(truncated.open(&[1u8; DATA_KEY_BYTES]).is_err());
        assert!(format!("{:?}", data_key(1)).contains("<redacted>"));
    }
}
