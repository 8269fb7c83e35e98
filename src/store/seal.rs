//! At-rest sealing of key material records.
//!
//! Serialized records are encrypted with AES-256-GCM under the operator's
//! master key before they reach any storage backend. The record's composite
//! storage key is bound as associated data, so a sealed blob cannot be
//! replayed under a different (conversation, user) address.

use crate::error::{PqRatchetError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::ZeroizeOnDrop;

/// AES-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes.
const TAG_SIZE: usize = 16;

/// A sealed record as persisted by a storage backend:
/// a `{ciphertext, nonce, authTag}` triple.
#[derive(Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Encrypted record bytes
    pub ciphertext: Vec<u8>,
    /// Per-record random nonce
    pub nonce: [u8; NONCE_SIZE],
    /// GCM authentication tag
    pub auth_tag: [u8; TAG_SIZE],
}

impl fmt::Debug for SealedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedRecord")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Seals and unseals records under the master key.
#[derive(ZeroizeOnDrop)]
pub struct Sealer {
    key: [u8; 32],
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer").field("key", &"[REDACTED]").finish()
    }
}

impl Sealer {
    /// Creates a sealer from a 32-byte master key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Seals plaintext bytes, binding `aad` into the tag.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedRecord> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| PqRatchetError::crypto("At-rest encryption failed"))?;

        let tag_bytes = sealed.split_off(sealed.len() - TAG_SIZE);
        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(&tag_bytes);

        Ok(SealedRecord {
            ciphertext: sealed,
            nonce: nonce_bytes,
            auth_tag,
        })
    }

    /// Opens a sealed record. Failure means tampering, a wrong master key, or
    /// a record addressed under a different composite key.
    pub fn open(&self, record: &SealedRecord, aad: &[u8]) -> Result<Vec<u8>> {
        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&record.nonce);

        let mut sealed = Vec::with_capacity(record.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&record.ciphertext);
        sealed.extend_from_slice(&record.auth_tag);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: sealed.as_ref(),
                    aad,
                },
            )
            .map_err(|_| PqRatchetError::corrupted("at-rest decryption failed"))
    }
}
