//! Key material persistence with application-level encryption at rest.
//!
//! `KeyMaterialStore` owns every byte of ratchet state that leaves memory:
//! full `RatchetState` records and retained `SkippedMessageKey` records, both
//! sealed under an operator-supplied master key before they reach the
//! pluggable storage backend. The store also owns skipped-key expiry.
//!
//! ## Storage Layout
//!
//! Two logical tables, keyed by composite ids:
//! - ratchet states: `{conversation}:{user}` -> sealed `RatchetState`
//! - skipped keys: `{conversation}:{user}:{message_key_id}` -> framed record
//!   carrying plaintext expiry metadata plus the sealed key
//!
//! The expiry metadata stays outside the seal so the cleanup sweep never
//! touches the master key.
//!
//! ## Master key
//!
//! The key is injected through [`MasterKeyProvider`] at construction and read
//! exactly once; a missing or malformed key is a construction error, never a
//! silent fallback.

pub mod memory;
pub mod rocksdb;
mod seal;

pub use memory::MemoryBackend;
pub use rocksdb::RocksDbBackend;
pub use seal::{SealedRecord, Sealer};

use crate::error::{PqRatchetError, Result};
use crate::ratchet::keys::{MessageKey, MESSAGE_KEY_SIZE};
use crate::ratchet::RatchetState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Logical tables a backend must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Sealed ratchet states
    RatchetStates,
    /// Framed skipped message keys
    SkippedKeys,
}

/// A raw key-value backend under the sealing layer.
///
/// Backends never see plaintext key material; they store opaque framed
/// records. All errors must surface as `StorageUnavailable`.
pub trait StoreBackend: Send + Sync {
    /// Inserts or overwrites a record.
    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()>;
    /// Fetches a record.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Deletes a record, reporting whether it existed.
    fn delete(&self, table: Table, key: &[u8]) -> Result<bool>;
    /// Returns all records whose key starts with `prefix`.
    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Supplies the at-rest master key.
///
/// Implementations decide where the key lives (environment, KMS, test
/// fixture); the store only requires that one is present at construction.
pub trait MasterKeyProvider {
    /// Returns the 32-byte master key.
    fn master_key(&self) -> Result<[u8; 32]>;
}

/// A fixed in-process master key, for tests and embedded deployments.
pub struct StaticMasterKey {
    key: [u8; 32],
}

impl StaticMasterKey {
    /// Creates a provider from raw key bytes.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl MasterKeyProvider for StaticMasterKey {
    fn master_key(&self) -> Result<[u8; 32]> {
        Ok(self.key)
    }
}

/// Reads the master key from an environment variable (64 hex characters).
///
/// Absence or malformation is an error; there is deliberately no default.
pub struct EnvMasterKey {
    var: String,
}

impl EnvMasterKey {
    /// Creates a provider reading the given environment variable.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl MasterKeyProvider for EnvMasterKey {
    fn master_key(&self) -> Result<[u8; 32]> {
        let value = std::env::var(&self.var).map_err(|_| {
            PqRatchetError::config(format!(
                "master key environment variable {} is not set",
                self.var
            ))
        })?;
        let bytes = hex::decode(value.trim())
            .map_err(|_| PqRatchetError::config(format!("{} is not valid hex", self.var)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            PqRatchetError::config(format!("{} must decode to exactly 32 bytes", self.var))
        })?;
        Ok(key)
    }
}

/// Ratchet session counters for observability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RatchetStatistics {
    /// Next outgoing message number
    pub sending_message_number: u32,
    /// Next expected incoming message number
    pub receiving_message_number: u32,
    /// Completed sending ratchet steps
    pub sending_chain_length: u32,
    /// Completed receiving ratchet steps
    pub receiving_chain_length: u32,
    /// Retained, non-expired skipped keys
    pub skipped_keys_count: usize,
}

/// Framed skipped-key record: expiry metadata in the clear, key sealed.
#[derive(Serialize, Deserialize)]
struct StoredSkippedKey {
    chain_length: u32,
    message_number: u32,
    expires_at: u64,
    sealed: SealedRecord,
}

/// Framed ratchet-state record.
#[derive(Serialize, Deserialize)]
struct StoredState {
    updated_at: u64,
    sealed: SealedRecord,
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Persistence and at-rest encryption for ratchet key material.
pub struct KeyMaterialStore {
    backend: Box<dyn StoreBackend>,
    sealer: Sealer,
}

impl KeyMaterialStore {
    /// Creates a store over a backend, reading the master key immediately.
    pub fn new(backend: Box<dyn StoreBackend>, provider: &dyn MasterKeyProvider) -> Result<Self> {
        let key = provider.master_key()?;
        Ok(Self {
            backend,
            sealer: Sealer::new(key),
        })
    }

    fn state_key(conversation_id: &str, user_id: &str) -> Vec<u8> {
        format!("{}:{}", conversation_id, user_id).into_bytes()
    }

    fn skipped_prefix(conversation_id: &str, user_id: &str) -> Vec<u8> {
        format!("{}:{}:", conversation_id, user_id).into_bytes()
    }

    fn skipped_key(conversation_id: &str, user_id: &str, message_key_id: &str) -> Vec<u8> {
        format!("{}:{}:{}", conversation_id, user_id, message_key_id).into_bytes()
    }

    /// Upserts the ratchet state for a session.
    pub fn put_state(
        &self,
        conversation_id: &str,
        user_id: &str,
        state: &RatchetState,
    ) -> Result<()> {
        let record_key = Self::state_key(conversation_id, user_id);
        let plaintext = bincode::serialize(state)
            .map_err(|e| PqRatchetError::serialization(format!("state encoding failed: {}", e)))?;
        let sealed = self.sealer.seal(&plaintext, &record_key)?;
        let framed = bincode::serialize(&StoredState {
            updated_at: now_secs(),
            sealed,
        })
        .map_err(|e| PqRatchetError::serialization(format!("state framing failed: {}", e)))?;
        self.backend.put(Table::RatchetStates, &record_key, &framed)
    }

    /// Fetches and unseals the ratchet state for a session.
    pub fn get_state(&self, conversation_id: &str, user_id: &str) -> Result<Option<RatchetState>> {
        let record_key = Self::state_key(conversation_id, user_id);
        let Some(framed) = self.backend.get(Table::RatchetStates, &record_key)? else {
            return Ok(None);
        };
        let stored: StoredState = bincode::deserialize(&framed)
            .map_err(|_| PqRatchetError::corrupted("unreadable state frame"))?;
        let plaintext = self.sealer.open(&stored.sealed, &record_key)?;
        let state = bincode::deserialize(&plaintext)
            .map_err(|_| PqRatchetError::corrupted("unreadable state record"))?;
        Ok(Some(state))
    }

    /// Whether a ratchet state exists for a session.
    pub fn has_state(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let record_key = Self::state_key(conversation_id, user_id);
        Ok(self.backend.get(Table::RatchetStates, &record_key)?.is_some())
    }

    /// Deletes the ratchet state and all its skipped keys.
    pub fn delete_state(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let record_key = Self::state_key(conversation_id, user_id);
        let existed = self.backend.delete(Table::RatchetStates, &record_key)?;

        let prefix = Self::skipped_prefix(conversation_id, user_id);
        for (key, _) in self.backend.scan_prefix(Table::SkippedKeys, &prefix)? {
            self.backend.delete(Table::SkippedKeys, &key)?;
        }

        if existed {
            info!(
                conversation_id,
                user_id, "deleted ratchet state and skipped keys"
            );
        }
        Ok(existed)
    }

    /// Retains a skipped message key until it is consumed or expires.
    pub fn put_skipped_key(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_key_id: &str,
        key: &MessageKey,
        chain_length: u32,
        message_number: u32,
        expires_at: u64,
    ) -> Result<()> {
        let record_key = Self::skipped_key(conversation_id, user_id, message_key_id);
        let sealed = self.sealer.seal(key.as_bytes(), &record_key)?;
        let framed = bincode::serialize(&StoredSkippedKey {
            chain_length,
            message_number,
            expires_at,
            sealed,
        })
        .map_err(|e| {
            PqRatchetError::serialization(format!("skipped key framing failed: {}", e))
        })?;
        self.backend.put(Table::SkippedKeys, &record_key, &framed)
    }

    /// Fetches a retained skipped key, if present and not expired.
    pub fn get_skipped_key(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_key_id: &str,
    ) -> Result<Option<MessageKey>> {
        let record_key = Self::skipped_key(conversation_id, user_id, message_key_id);
        let Some(framed) = self.backend.get(Table::SkippedKeys, &record_key)? else {
            return Ok(None);
        };
        let stored: StoredSkippedKey = bincode::deserialize(&framed)
            .map_err(|_| PqRatchetError::corrupted("unreadable skipped key frame"))?;
        if stored.expires_at <= now_secs() {
            return Ok(None);
        }
        let plaintext = self.sealer.open(&stored.sealed, &record_key)?;
        let bytes: [u8; MESSAGE_KEY_SIZE] = plaintext
            .try_into()
            .map_err(|_| PqRatchetError::corrupted("skipped key has wrong length"))?;
        Ok(Some(MessageKey::from_bytes(bytes)))
    }

    /// Deletes a skipped key. Called immediately after successful consumption.
    pub fn delete_skipped_key(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_key_id: &str,
    ) -> Result<bool> {
        let record_key = Self::skipped_key(conversation_id, user_id, message_key_id);
        self.backend.delete(Table::SkippedKeys, &record_key)
    }

    /// Deletes all expired skipped keys, returning how many were removed.
    ///
    /// Safe to run concurrently with traffic: deletion is per-record by
    /// predicate, never by snapshot.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = now_secs();
        let mut removed = 0;
        for (key, value) in self.backend.scan_prefix(Table::SkippedKeys, b"")? {
            let Ok(stored) = bincode::deserialize::<StoredSkippedKey>(&value) else {
                debug!("removing unreadable skipped key frame");
                if self.backend.delete(Table::SkippedKeys, &key)? {
                    removed += 1;
                }
                continue;
            };
            if stored.expires_at <= now && self.backend.delete(Table::SkippedKeys, &key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up expired skipped keys");
        }
        Ok(removed)
    }

    /// Session counters for observability.
    pub fn statistics(&self, conversation_id: &str, user_id: &str) -> Result<RatchetStatistics> {
        let state = self.get_state(conversation_id, user_id)?.ok_or_else(|| {
            PqRatchetError::not_initialized(format!("{}:{}", conversation_id, user_id))
        })?;

        let now = now_secs();
        let prefix = Self::skipped_prefix(conversation_id, user_id);
        let skipped_keys_count = self
            .backend
            .scan_prefix(Table::SkippedKeys, &prefix)?
            .into_iter()
            .filter(|(_, value)| {
                bincode::deserialize::<StoredSkippedKey>(value)
                    .map(|s| s.expires_at > now)
                    .unwrap_or(false)
            })
            .count();

        Ok(RatchetStatistics {
            sending_message_number: state.sending_message_number(),
            receiving_message_number: state.receiving_message_number(),
            sending_chain_length: state.sending_chain_length(),
            receiving_chain_length: state.receiving_chain_length(),
            skipped_keys_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KeyMaterialStore {
        KeyMaterialStore::new(
            Box::new(MemoryBackend::new()),
            &StaticMasterKey::from_bytes([7u8; 32]),
        )
        .unwrap()
    }

    fn sample_state() -> RatchetState {
        RatchetState::initialize(&[42u8; 32], true).unwrap()
    }

    #[test]
    fn test_state_put_get_roundtrip() {
        let store = store();
        let state = sample_state();

        store.put_state("conv", "alice", &state).unwrap();
        let loaded = store.get_state("conv", "alice").unwrap().unwrap();

        assert_eq!(loaded.sending_chain_length(), state.sending_chain_length());
        assert!(store.has_state("conv", "alice").unwrap());
        assert!(!store.has_state("conv", "bob").unwrap());
    }

    #[test]
    fn test_wrong_master_key_is_corrupted_state() {
        let backend = Box::new(MemoryBackend::new());
        let writer =
            KeyMaterialStore::new(backend, &StaticMasterKey::from_bytes([7u8; 32])).unwrap();
        writer.put_state("conv", "alice", &sample_state()).unwrap();

        // Re-open the same backing map under a different key.
        let backend = writer.backend;
        let reader = KeyMaterialStore {
            backend,
            sealer: Sealer::new([8u8; 32]),
        };

        let err = reader.get_state("conv", "alice").unwrap_err();
        assert!(matches!(err, PqRatchetError::CorruptedState(_)));
    }

    #[test]
    fn test_skipped_key_single_use_and_expiry() {
        let store = store();
        let key = MessageKey::from_bytes([3u8; MESSAGE_KEY_SIZE]);
        let future = now_secs() + 3600;

        store
            .put_skipped_key("conv", "alice", "k1", &key, 1, 4, future)
            .unwrap();
        assert!(store.get_skipped_key("conv", "alice", "k1").unwrap().is_some());

        assert!(store.delete_skipped_key("conv", "alice", "k1").unwrap());
        assert!(store.get_skipped_key("conv", "alice", "k1").unwrap().is_none());

        // Already-expired keys are invisible on read and swept by cleanup.
        store
            .put_skipped_key("conv", "alice", "k2", &key, 1, 5, now_secs().saturating_sub(1))
            .unwrap();
        assert!(store.get_skipped_key("conv", "alice", "k2").unwrap().is_none());
        assert_eq!(store.cleanup_expired().unwrap(), 1);
        assert_eq!(store.cleanup_expired().unwrap(), 0);
    }

    #[test]
    fn test_delete_state_removes_skipped_keys() {
        let store = store();
        let key = MessageKey::from_bytes([3u8; MESSAGE_KEY_SIZE]);

        store.put_state("conv", "alice", &sample_state()).unwrap();
        store
            .put_skipped_key("conv", "alice", "k1", &key, 1, 4, now_secs() + 3600)
            .unwrap();

        assert!(store.delete_state("conv", "alice").unwrap());
        assert!(!store.has_state("conv", "alice").unwrap());
        assert!(store.get_skipped_key("conv", "alice", "k1").unwrap().is_none());
        assert!(!store.delete_state("conv", "alice").unwrap());
    }

    #[test]
    fn test_statistics_counts_live_skipped_keys() {
        let store = store();
        let key = MessageKey::from_bytes([3u8; MESSAGE_KEY_SIZE]);

        store.put_state("conv", "alice", &sample_state()).unwrap();
        store
            .put_skipped_key("conv", "alice", "k1", &key, 1, 4, now_secs() + 3600)
            .unwrap();
        store
            .put_skipped_key("conv", "alice", "k2", &key, 1, 5, now_secs().saturating_sub(1))
            .unwrap();

        let stats = store.statistics("conv", "alice").unwrap();
        assert_eq!(stats.skipped_keys_count, 1);
        assert_eq!(stats.sending_chain_length, 1);
    }

    #[test]
    fn test_statistics_without_state_fails() {
        let store = store();
        assert!(matches!(
            store.statistics("conv", "nobody").unwrap_err(),
            PqRatchetError::RatchetNotInitialized(_)
        ));
    }

    #[test]
    fn test_env_master_key_requires_configuration() {
        let provider = EnvMasterKey::new("PQRATCHET_TEST_KEY_DEFINITELY_UNSET");
        assert!(matches!(
            provider.master_key().unwrap_err(),
            PqRatchetError::Config(_)
        ));
    }
}
