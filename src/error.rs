//! Error types for PQRatchet operations.

use thiserror::Error;

/// Result type alias for PQRatchet operations.
pub type Result<T> = std::result::Result<T, PqRatchetError>;

/// Main error type for PQRatchet operations.
///
/// Cryptographic failures (`AuthenticationFailure`, `CorruptedState`) are
/// terminal: callers must never retry them with different keys, and their
/// messages never contain key material or plaintext.
#[derive(Error, Debug)]
pub enum PqRatchetError {
    /// No ratchet state exists for the addressed (conversation, user) pair
    #[error("Ratchet not initialized: {0}")]
    RatchetNotInitialized(String),

    /// A ratchet state already exists and no reset was requested
    #[error("Ratchet already initialized: {0}")]
    AlreadyInitialized(String),

    /// AEAD tag verification failed (tampering or wrong key)
    #[error("Authentication failure")]
    AuthenticationFailure,

    /// Too many out-of-order message keys requested in one step
    #[error("Skip window exceeded: {0}")]
    SkipWindowExceeded(String),

    /// At-rest decryption of stored key material failed
    #[error("Corrupted state: {0}")]
    CorruptedState(String),

    /// Key exchange record does not exist
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Caller is not a party to the exchange, or not the required party
    #[error("Exchange unauthorized: {0}")]
    ExchangeUnauthorized(String),

    /// Exchange is not in the state the operation requires
    #[error("Exchange invalid state: {0}")]
    ExchangeInvalidState(String),

    /// Exchange passed its TTL before completing
    #[error("Exchange expired: {0}")]
    ExchangeExpired(String),

    /// Sync package endpoints must belong to the same user
    #[error("Device ownership mismatch: {0}")]
    DeviceOwnershipMismatch(String),

    /// Sync package does not exist
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Storage backend failed
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Malformed request shape or parameter
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors (missing master key, malformed settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cryptographic operation errors other than tag verification
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PqRatchetError {
    /// Creates a new not-initialized error.
    pub fn not_initialized<T: ToString>(msg: T) -> Self {
        Self::RatchetNotInitialized(msg.to_string())
    }

    /// Creates a new already-initialized error.
    pub fn already_initialized<T: ToString>(msg: T) -> Self {
        Self::AlreadyInitialized(msg.to_string())
    }

    /// Creates a new skip-window error.
    pub fn skip_window<T: ToString>(msg: T) -> Self {
        Self::SkipWindowExceeded(msg.to_string())
    }

    /// Creates a new corrupted-state error.
    pub fn corrupted<T: ToString>(msg: T) -> Self {
        Self::CorruptedState(msg.to_string())
    }

    /// Creates a new storage error.
    pub fn storage<T: ToString>(msg: T) -> Self {
        Self::StorageUnavailable(msg.to_string())
    }

    /// Creates a new validation error.
    pub fn validation<T: ToString>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Creates a new cryptographic error.
    pub fn crypto<T: ToString>(msg: T) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Creates a new serialization error.
    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Stable machine-readable error code for wire boundaries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RatchetNotInitialized(_) => "RATCHET_NOT_INITIALIZED",
            Self::AlreadyInitialized(_) => "ALREADY_INITIALIZED",
            Self::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            Self::SkipWindowExceeded(_) => "SKIP_WINDOW_EXCEEDED",
            Self::CorruptedState(_) => "CORRUPTED_STATE",
            Self::ExchangeNotFound(_) => "EXCHANGE_NOT_FOUND",
            Self::ExchangeUnauthorized(_) => "EXCHANGE_UNAUTHORIZED",
            Self::ExchangeInvalidState(_) => "EXCHANGE_INVALID_STATE",
            Self::ExchangeExpired(_) => "EXCHANGE_EXPIRED",
            Self::DeviceOwnershipMismatch(_) => "DEVICE_OWNERSHIP_MISMATCH",
            Self::PackageNotFound(_) => "PACKAGE_NOT_FOUND",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Crypto(_) => "CRYPTO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}
