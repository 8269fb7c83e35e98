//! Forward-secret message ratchet with hybrid key material.
//!
//! This module implements a Double Ratchet in which the Diffie-Hellman
//! ratchet is hybrid: each ratchet step mixes an X25519 shared secret with an
//! ML-KEM-1024 encapsulation secret into the root key derivation. It
//! provides:
//!
//! - **Forward Secrecy**: each message has a unique key derived from chain
//!   keys via a one-way KDF
//! - **Post-Compromise Security**: sessions self-heal once a ratchet step
//!   with fresh ephemeral material completes a round trip
//! - **Out-of-Order Messages**: skipped message keys are derived and retained
//!   (bounded, expiring) for late arrivals
//!
//! ## How It Works
//!
//! ### Hybrid Ratchet (DH + KEM)
//!
//! When a message carries a new ephemeral public key, the receiver:
//! 1. Computes the X25519 shared secret with its current ephemeral key
//! 2. Decapsulates the accompanying KEM ciphertext, when present
//! 3. Feeds both into HKDF with the root key to derive a new root and
//!    receiving chain, then rotates its own ephemeral for the reply chain
//!
//! ### Symmetric Ratchet (Chain Keys)
//!
//! For each message in a chain:
//! 1. Derive a message key from the chain key
//! 2. Advance the chain key (one-way function)
//! 3. Encrypt/decrypt with ChaCha20-Poly1305, binding sender identity and
//!    counters as associated data
//!
//! ## Session Bootstrap
//!
//! Both parties derive the responder's base X25519 and ML-KEM keypairs
//! deterministically from the exchange secret, so the initiator performs its
//! first ratchet step at initialization time. The initiator's first envelope
//! therefore already carries `chainLength = 1` and a KEM ciphertext. The
//! responder cannot send until it has received one message (it has no sending
//! chain before the initiator's ephemeral key arrives).

pub mod engine;
pub mod envelope;
pub mod keys;
pub mod state;

pub use engine::{RatchetEngine, RatchetStatistics};
pub use envelope::MessageEnvelope;
pub use keys::{ChainKey, EphemeralKeyPair, KemKeyPair, KemPublicKey, MessageKey, RootKey};
pub use state::RatchetState;

/// Maximum number of message keys skipped in a single decrypt call.
/// Bounds resource consumption under maliciously inflated counters.
pub const MAX_SKIP: u32 = 1000;

/// Lifetime of a retained skipped message key (7 days).
pub const SKIPPED_KEY_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Wire identifier of the envelope algorithm suite.
pub const ENVELOPE_ALGORITHM: &str = "x25519-mlkem1024-chacha20poly1305";

/// NIST security category achieved by the hybrid suite (ML-KEM-1024).
pub const ENVELOPE_SECURITY_LEVEL: u32 = 5;

/// Domain separation constants for HKDF operations.
pub mod kdf_info {
    /// Initial root key from the exchange secret.
    pub const ROOT_INIT: &[u8] = b"PQRATCHET-v1-root-init";
    /// New root key from a hybrid ratchet step.
    pub const RATCHET_ROOT: &[u8] = b"PQRATCHET-v1-ratchet-root";
    /// New chain key from a hybrid ratchet step or previous chain key.
    pub const RATCHET_CHAIN: &[u8] = b"PQRATCHET-v1-ratchet-chain";
    /// Message key from chain key.
    pub const RATCHET_MESSAGE: &[u8] = b"PQRATCHET-v1-ratchet-message";
    /// Responder base X25519 secret from the exchange secret.
    pub const BASE_DH: &[u8] = b"PQRATCHET-v1-base-dh";
    /// Responder base ML-KEM `d` seed from the exchange secret.
    pub const BASE_KEM_D: &[u8] = b"PQRATCHET-v1-base-kem-d";
    /// Responder base ML-KEM `z` seed from the exchange secret.
    pub const BASE_KEM_Z: &[u8] = b"PQRATCHET-v1-base-kem-z";
    /// Initiator base ML-KEM `d` seed from the exchange secret.
    pub const PEER_KEM_D: &[u8] = b"PQRATCHET-v1-peer-kem-d";
    /// Initiator base ML-KEM `z` seed from the exchange secret.
    pub const PEER_KEM_Z: &[u8] = b"PQRATCHET-v1-peer-kem-z";
}
