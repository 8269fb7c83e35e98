//! Algorithm negotiation ledger.
//!
//! Records which algorithm suite two parties settled on for a conversation.
//! One record is active per conversation; renegotiation supersedes the
//! previous record rather than mutating it, so the history stays auditable.
//!
//! Algorithm identifiers are typed enums: an unknown identifier is a
//! deserialization error at the boundary, never a silently ignored string.

use crate::error::Result;
use crate::exchange::PublicKeyBundle;
use crate::exchange::coordinator::generate_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tracing::info;

/// Supported key-exchange algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyExchangeAlgorithm {
    /// Hybrid X25519 + ML-KEM-1024
    X25519MlKem1024,
    /// Classical X25519 only
    X25519,
}

impl KeyExchangeAlgorithm {
    /// Returns the algorithm name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            KeyExchangeAlgorithm::X25519MlKem1024 => "x25519-ml-kem1024",
            KeyExchangeAlgorithm::X25519 => "x25519",
        }
    }

    /// Returns true if this algorithm resists quantum attack.
    pub fn is_post_quantum(&self) -> bool {
        matches!(self, KeyExchangeAlgorithm::X25519MlKem1024)
    }
}

impl fmt::Display for KeyExchangeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    /// Classical Ed25519
    Ed25519,
    /// Hybrid Ed25519 + ML-DSA-87
    Ed25519MlDsa87,
}

impl SignatureAlgorithm {
    /// Returns the algorithm name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::Ed25519MlDsa87 => "ed25519-ml-dsa87",
        }
    }
}

/// Supported message encryption algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    /// ChaCha20-Poly1305 AEAD
    Chacha20Poly1305,
    /// AES-256-GCM AEAD
    Aes256Gcm,
}

impl EncryptionAlgorithm {
    /// Returns the algorithm name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Chacha20Poly1305 => "chacha20-poly1305",
            EncryptionAlgorithm::Aes256Gcm => "aes256-gcm",
        }
    }
}

/// A selected algorithm suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmSuite {
    /// Key-exchange algorithm
    pub key_exchange: KeyExchangeAlgorithm,
    /// Signature algorithm
    pub signature: SignatureAlgorithm,
    /// Message encryption algorithm
    pub encryption: EncryptionAlgorithm,
}

impl AlgorithmSuite {
    /// Selects the suite for a negotiation outcome.
    pub fn select(quantum_resistant: bool) -> Self {
        if quantum_resistant {
            Self {
                key_exchange: KeyExchangeAlgorithm::X25519MlKem1024,
                signature: SignatureAlgorithm::Ed25519MlDsa87,
                encryption: EncryptionAlgorithm::Chacha20Poly1305,
            }
        } else {
            Self {
                key_exchange: KeyExchangeAlgorithm::X25519,
                signature: SignatureAlgorithm::Ed25519,
                encryption: EncryptionAlgorithm::Chacha20Poly1305,
            }
        }
    }
}

/// Algorithms one party advertises support for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    /// Key-exchange algorithms the party supports
    pub key_exchange: Vec<KeyExchangeAlgorithm>,
    /// Signature algorithms the party supports
    pub signatures: Vec<SignatureAlgorithm>,
    /// Encryption algorithms the party supports
    pub encryption: Vec<EncryptionAlgorithm>,
    /// Highest security category the party can achieve
    pub max_security_level: u32,
}

impl CapabilitySet {
    /// Derives a capability set from a published key bundle.
    pub fn from_bundle(bundle: &PublicKeyBundle) -> Self {
        let mut key_exchange = vec![KeyExchangeAlgorithm::X25519];
        let mut signatures = vec![SignatureAlgorithm::Ed25519];
        if bundle.quantum_resistant {
            key_exchange.insert(0, KeyExchangeAlgorithm::X25519MlKem1024);
            signatures.insert(0, SignatureAlgorithm::Ed25519MlDsa87);
        }
        Self {
            key_exchange,
            signatures,
            encryption: vec![
                EncryptionAlgorithm::Chacha20Poly1305,
                EncryptionAlgorithm::Aes256Gcm,
            ],
            max_security_level: bundle.security_level,
        }
    }
}

/// A recorded negotiation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmNegotiation {
    /// Negotiation identifier
    pub id: String,
    /// Conversation the record belongs to
    pub conversation_id: String,
    /// Party that initiated the underlying exchange
    pub initiator_id: String,
    /// Party that responded
    pub responder_id: String,
    /// Selected algorithm suite
    pub suite: AlgorithmSuite,
    /// NIST security category achieved by both parties
    pub achieved_security_level: u32,
    /// Whether the suite is quantum resistant
    pub quantum_resistant: bool,
    /// Initiator's advertised capabilities
    pub initiator_capabilities: CapabilitySet,
    /// Responder's advertised capabilities
    pub responder_capabilities: CapabilitySet,
    /// Recording time (unix seconds)
    pub negotiated_at: u64,
    /// Optional expiry (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Whether this is the conversation's active record
    pub is_active: bool,
}

/// Aggregate negotiation statistics over a timeframe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationStats {
    /// Negotiations recorded within the timeframe
    pub total: u64,
    /// Counts per key-exchange algorithm
    pub by_algorithm: HashMap<String, u64>,
    /// Fraction of tracked conversations with an active record
    pub encryption_rate: f64,
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Ledger of negotiation records, one active per conversation.
#[derive(Default)]
pub struct AlgorithmNegotiationLedger {
    records: RwLock<HashMap<String, Vec<AlgorithmNegotiation>>>,
}

impl AlgorithmNegotiationLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a negotiation, superseding any prior active record for the
    /// conversation. Returns the new negotiation id.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        conversation_id: &str,
        initiator_id: &str,
        responder_id: &str,
        suite: AlgorithmSuite,
        achieved_security_level: u32,
        quantum_resistant: bool,
        initiator_capabilities: CapabilitySet,
        responder_capabilities: CapabilitySet,
    ) -> Result<String> {
        let negotiation = AlgorithmNegotiation {
            id: generate_id(),
            conversation_id: conversation_id.to_string(),
            initiator_id: initiator_id.to_string(),
            responder_id: responder_id.to_string(),
            suite,
            achieved_security_level,
            quantum_resistant,
            initiator_capabilities,
            responder_capabilities,
            negotiated_at: now_secs(),
            expires_at: None,
            is_active: true,
        };
        let id = negotiation.id.clone();

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let history = records.entry(conversation_id.to_string()).or_default();
        for prior in history.iter_mut() {
            prior.is_active = false;
        }
        history.push(negotiation);

        info!(
            conversation_id,
            suite = %suite.key_exchange,
            quantum_resistant,
            "recorded algorithm negotiation"
        );
        Ok(id)
    }

    /// Returns the conversation's active, unexpired record.
    pub fn get_active(&self, conversation_id: &str) -> Option<AlgorithmNegotiation> {
        let now = now_secs();
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(conversation_id).and_then(|history| {
            history
                .iter()
                .rev()
                .find(|n| n.is_active && n.expires_at.map_or(true, |at| at > now))
                .cloned()
        })
    }

    /// Aggregates statistics over negotiations recorded in the last
    /// `timeframe_secs` seconds. Read-only.
    pub fn stats(&self, timeframe_secs: u64) -> NegotiationStats {
        let now = now_secs();
        let since = now.saturating_sub(timeframe_secs);
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());

        let mut total = 0u64;
        let mut by_algorithm: HashMap<String, u64> = HashMap::new();
        let mut conversations = 0u64;
        let mut encrypted_conversations = 0u64;

        for history in records.values() {
            conversations += 1;
            if history
                .iter()
                .any(|n| n.is_active && n.expires_at.map_or(true, |at| at > now))
            {
                encrypted_conversations += 1;
            }
            for negotiation in history.iter().filter(|n| n.negotiated_at >= since) {
                total += 1;
                *by_algorithm
                    .entry(negotiation.suite.key_exchange.to_string())
                    .or_default() += 1;
            }
        }

        NegotiationStats {
            total,
            by_algorithm,
            encryption_rate: if conversations > 0 {
                encrypted_conversations as f64 / conversations as f64
            } else {
                0.0
            },
        }
    }
}
