//! Two-party hybrid key-exchange relay.
//!
//! The coordinator never sees private keys or plaintext: it relays public key
//! bundles and opaque encrypted payloads between the two parties and tracks
//! the exchange through a strictly forward-moving state machine:
//!
//! ```text
//! pending -(recipient responds)-> responded -(either party confirms)-> completed
//!    |                               |
//!    +------- TTL elapsed -----------+--> expired
//! ```
//!
//! Each party can only read the half of the payload it is entitled to
//! decrypt: the initiator sees `responseData`, the recipient sees
//! `encryptedKeyData`.

pub mod coordinator;

pub use coordinator::{ExchangeStats, KeyExchangeCoordinator};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifetime of an exchange before it expires (24 hours).
pub const EXCHANGE_TTL_SECS: u64 = 24 * 60 * 60;

/// Why a key exchange was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeType {
    /// First exchange for a conversation
    InitialSetup,
    /// Periodic ratchet key rotation
    RatchetUpdate,
    /// Upgrading an existing session to a post-quantum suite
    PqcUpgrade,
    /// Bringing a newly added device into a conversation
    DeviceAddition,
}

impl ExchangeType {
    /// Returns the wire name of this exchange type.
    pub fn name(&self) -> &'static str {
        match self {
            ExchangeType::InitialSetup => "initial_setup",
            ExchangeType::RatchetUpdate => "ratchet_update",
            ExchangeType::PqcUpgrade => "pqc_upgrade",
            ExchangeType::DeviceAddition => "device_addition",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Current position of an exchange in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    /// Waiting for the recipient to answer
    Pending,
    /// Recipient answered, waiting for confirmation
    Responded,
    /// Both sides confirmed
    Completed,
    /// TTL elapsed before completion
    Expired,
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeStatus::Pending => "pending",
            ExchangeStatus::Responded => "responded",
            ExchangeStatus::Completed => "completed",
            ExchangeStatus::Expired => "expired",
        };
        write!(f, "{}", name)
    }
}

/// A party's published hybrid public key bundle.
///
/// Typed fields rather than a free-form blob: unknown key material is a
/// deserialization error, not a silently ignored extra.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBundle {
    /// X25519 public key, base64 on the wire
    pub classical_public_key: String,
    /// ML-KEM encapsulation key, base64 on the wire
    pub pqc_public_key: String,
    /// Signature over the bundle by the owner's identity key, base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// NIST security category claimed by the bundle
    pub security_level: u32,
    /// Whether the bundle carries post-quantum material
    pub quantum_resistant: bool,
}

/// A relayed key exchange between two parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchange {
    /// Exchange identifier
    pub id: String,
    /// Party that opened the exchange
    pub initiator_id: String,
    /// Party expected to respond
    pub recipient_id: String,
    /// Conversation the exchange belongs to
    pub conversation_id: String,
    /// Why the exchange was initiated
    pub exchange_type: ExchangeType,
    /// State machine position
    pub status: ExchangeStatus,
    /// Initiator's public key bundle
    pub public_key_bundle: PublicKeyBundle,
    /// Recipient's bundle, set on respond
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_bundle: Option<PublicKeyBundle>,
    /// Opaque payload decryptable only by the recipient, base64
    pub encrypted_key_data: String,
    /// Opaque payload decryptable only by the initiator, base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<String>,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Expiry time (unix seconds)
    pub expires_at: u64,
    /// Completion time (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl KeyExchange {
    /// Whether the given user is one of the two parties.
    pub fn involves(&self, user_id: &str) -> bool {
        self.initiator_id == user_id || self.recipient_id == user_id
    }

    /// Whether the exchange is past its TTL and not completed.
    pub fn is_expired(&self, now: u64) -> bool {
        self.status != ExchangeStatus::Completed && now > self.expires_at
    }
}

/// The payload half a caller is entitled to decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeData {
    /// Exchange identifier
    pub exchange_id: String,
    /// State machine position
    pub status: ExchangeStatus,
    /// Why the exchange was initiated
    pub exchange_type: ExchangeType,
    /// The peer's public key bundle, when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_bundle: Option<PublicKeyBundle>,
    /// The opaque payload addressed to the caller, base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
}
