//! Encrypted message envelope wire format.
//!
//! The envelope is the unit the ratchet hands to the messaging layer and the
//! unit the relay persists. All byte fields are base64 strings at the wire
//! boundary (camelCase JSON), and the format round-trips exactly.
//!
//! The Poly1305 tag travels in its own `authTag` field; tampering with the
//! tag, the ciphertext, or any bound header field makes decryption fail with
//! an authentication error.

use crate::ratchet::{ENVELOPE_ALGORITHM, ENVELOPE_SECURITY_LEVEL};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

/// Size of the ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the Poly1305 authentication tag in bytes.
pub const AUTH_TAG_SIZE: usize = 16;

/// An encrypted message envelope.
///
/// Produced by `RatchetEngine::encrypt`, consumed by `RatchetEngine::decrypt`.
/// Opaque to every component in between.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Encrypted payload (without the authentication tag)
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// AEAD nonce
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Poly1305 authentication tag
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
    /// Sender's current X25519 ephemeral public key
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
    /// Message number within the sending chain
    pub message_number: u32,
    /// Number of completed ratchet steps on the sending side
    pub chain_length: u32,
    /// Message count of the previous sending chain
    pub previous_chain_length: u32,
    /// Deterministic identifier of the message key
    pub key_id: String,
    /// Algorithm suite identifier
    pub algorithm: String,
    /// NIST security category of the suite
    pub security_level: u32,
    /// ML-KEM ciphertext for the ratchet step that opened this chain
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub pqc_ciphertext: Option<Vec<u8>>,
    /// Optional sender signature over the envelope (applied by callers)
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("message_number", &self.message_number)
            .field("chain_length", &self.chain_length)
            .field("previous_chain_length", &self.previous_chain_length)
            .field("key_id", &self.key_id)
            .field("has_pqc_ciphertext", &self.pqc_ciphertext.is_some())
            .finish()
    }
}

impl MessageEnvelope {
    /// Returns the envelope's default algorithm metadata pair.
    pub fn suite() -> (String, u32) {
        (ENVELOPE_ALGORITHM.to_string(), ENVELOPE_SECURITY_LEVEL)
    }

    /// Total size of the encrypted portion.
    pub fn encrypted_size(&self) -> usize {
        self.ciphertext.len() + self.nonce.len() + self.auth_tag.len()
    }
}

/// Derives the deterministic identifier of a message key.
///
/// Both the engine and the skipped-key store address keys through this id, so
/// it must depend on everything that selects a unique position in the key
/// schedule: the chain's ephemeral key, the chain length, and the message
/// number.
pub fn message_key_id(ephemeral_public_key: &[u8], chain_length: u32, message_number: u32) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(ephemeral_public_key);
    hasher.update(chain_length.to_be_bytes());
    hasher.update(message_number.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Builds the associated data bound into the AEAD tag.
///
/// Binds the caller-supplied data (sender identity) together with the
/// counters and ephemeral key from the header, length-prefixed so field
/// boundaries cannot be shifted.
pub fn binding_data(
    caller_data: &[u8],
    message_number: u32,
    chain_length: u32,
    ephemeral_public_key: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(caller_data.len() + ephemeral_public_key.len() + 16);
    data.extend_from_slice(&(caller_data.len() as u32).to_be_bytes());
    data.extend_from_slice(caller_data);
    data.extend_from_slice(&message_number.to_be_bytes());
    data.extend_from_slice(&chain_length.to_be_bytes());
    data.extend_from_slice(ephemeral_public_key);
    data
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
