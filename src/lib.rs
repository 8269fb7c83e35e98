//! # PQRatchet - Hybrid Post-Quantum Message Ratchet
//!
//! A forward-secret message ratchet (Signal-style Double Ratchet) with hybrid
//! classical + post-quantum key material, together with the server-side
//! machinery a deployment needs around it: encrypted-at-rest key-material
//! storage, a two-party key-exchange relay, multi-device key synchronization,
//! and an algorithm-negotiation ledger.
//!
//! ## Features
//!
//! - **Forward Secrecy**: every message is encrypted under a unique key
//!   derived from a one-way HKDF chain
//! - **Hybrid Ratchet Steps**: X25519 Diffie-Hellman output mixed with
//!   ML-KEM-1024 encapsulation secrets on every ratchet step
//! - **Out-of-Order Delivery**: skipped message keys are retained (bounded,
//!   with expiry) so late messages still decrypt
//! - **Zero-Knowledge Relay**: the coordinators only store and forward
//!   ciphertext and public key material
//!
//! ## Cryptographic Algorithms
//!
//! - **Key Encapsulation**: ML-KEM-1024 (NIST FIPS 203)
//! - **Classical Key Agreement**: X25519
//! - **Message Encryption**: ChaCha20-Poly1305
//! - **At-Rest Encryption**: AES-256-GCM
//! - **Key Derivation**: HKDF-SHA3-512
//!
//! ## Example
//!
//! ```rust,no_run
//! use pqratchet::ratchet::RatchetEngine;
//! use pqratchet::store::{KeyMaterialStore, MemoryBackend, StaticMasterKey};
//! use std::sync::Arc;
//!
//! # fn main() -> pqratchet::Result<()> {
//! let store = Arc::new(KeyMaterialStore::new(
//!     Box::new(MemoryBackend::new()),
//!     &StaticMasterKey::from_bytes([7u8; 32]),
//! )?);
//! let engine = RatchetEngine::new(store);
//!
//! let secret = [42u8; 32];
//! engine.initialize("conv-1", "alice", &secret, true, false)?;
//! let envelope = engine.encrypt("conv-1", "alice", b"hello", b"alice")?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod exchange;
pub mod negotiation;
pub mod ratchet;
pub mod store;
pub mod sync;
pub mod validation;

pub use error::{PqRatchetError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version identifier carried in envelopes and bundles.
pub const PROTOCOL_VERSION: u8 = 1;
