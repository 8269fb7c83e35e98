//! Input validation and security limits for PQRatchet
//!
//! This module provides validation functions and limits to prevent resource
//! exhaustion and malformed input attacks at the library boundary. The relay
//! applies the same validators before touching coordinator or store state.

use crate::error::{PqRatchetError, Result};

/// Maximum allowed plaintext size for a single ratchet message (1MB)
///
/// Larger payloads (file transfer) belong to the excluded upload pipeline;
/// the ratchet only ever sees chat-sized plaintexts.
pub const MAX_PLAINTEXT_SIZE: usize = 1024 * 1024;

/// Maximum allowed size for opaque encrypted relay payloads (1MB)
pub const MAX_RELAY_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum allowed key material size (10KB - generous for post-quantum keys)
pub const MAX_KEY_SIZE: usize = 10 * 1024;

/// Maximum allowed identifier length (conversation, user, device ids)
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Minimum shared secret length accepted by ratchet initialization
pub const MIN_SHARED_SECRET_SIZE: usize = 32;

/// Input validator with static validation methods
pub struct Validator;

impl Validator {
    /// Validates a conversation/user/device identifier.
    ///
    /// Identifiers must be non-empty, bounded, and printable-ASCII without
    /// whitespace so they can be embedded in composite storage keys.
    pub fn validate_identifier(name: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(PqRatchetError::validation(format!("{} is empty", name)));
        }
        if value.len() > MAX_IDENTIFIER_LENGTH {
            return Err(PqRatchetError::validation(format!(
                "{} exceeds {} bytes",
                name, MAX_IDENTIFIER_LENGTH
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        {
            return Err(PqRatchetError::validation(format!(
                "{} contains invalid characters",
                name
            )));
        }
        Ok(())
    }

    /// Validates plaintext size before encryption.
    pub fn validate_plaintext_size(plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(PqRatchetError::validation(format!(
                "plaintext size {} exceeds maximum {}",
                plaintext.len(),
                MAX_PLAINTEXT_SIZE
            )));
        }
        Ok(())
    }

    /// Validates an opaque relay payload (encrypted key data, sync packages).
    pub fn validate_relay_payload(name: &str, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(PqRatchetError::validation(format!("{} is empty", name)));
        }
        if payload.len() > MAX_RELAY_PAYLOAD_SIZE {
            return Err(PqRatchetError::validation(format!(
                "{} size {} exceeds maximum {}",
                name,
                payload.len(),
                MAX_RELAY_PAYLOAD_SIZE
            )));
        }
        Ok(())
    }

    /// Validates public key material size.
    pub fn validate_key_size(name: &str, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(PqRatchetError::validation(format!("{} is empty", name)));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(PqRatchetError::validation(format!(
                "{} size {} exceeds maximum {}",
                name,
                key.len(),
                MAX_KEY_SIZE
            )));
        }
        Ok(())
    }

    /// Validates the shared secret handed to ratchet initialization.
    pub fn validate_shared_secret(secret: &[u8]) -> Result<()> {
        if secret.len() < MIN_SHARED_SECRET_SIZE {
            return Err(PqRatchetError::validation(format!(
                "shared secret must be at least {} bytes",
                MIN_SHARED_SECRET_SIZE
            )));
        }
        Ok(())
    }
}
