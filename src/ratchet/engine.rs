//! The ratchet engine: state machine plus AEAD plus persistence.
//!
//! `RatchetEngine` is the only component that mutates ratchet state. Every
//! mutation follows read-state → derive-keys → write-state under a
//! per-(conversation, user) lock, so concurrent sends can never derive the
//! same message key from the same chain. Operations on different sessions
//! proceed concurrently.
//!
//! State is never persisted after a failed decrypt: an envelope that does not
//! authenticate leaves the session exactly where it was.

use crate::error::{PqRatchetError, Result};
use crate::ratchet::envelope::{binding_data, message_key_id, MessageEnvelope, AUTH_TAG_SIZE,
    NONCE_SIZE};
use crate::ratchet::keys::{MessageKey, DH_PUBLIC_KEY_SIZE};
use crate::ratchet::state::RatchetState;
use crate::ratchet::SKIPPED_KEY_TTL_SECS;
use crate::store::KeyMaterialStore;
use crate::validation::Validator;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub use crate::store::RatchetStatistics;

/// The forward-secret message ratchet engine.
pub struct RatchetEngine {
    store: Arc<KeyMaterialStore>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl RatchetEngine {
    /// Creates an engine over a key material store.
    pub fn new(store: Arc<KeyMaterialStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session lock for a (conversation, user) pair.
    fn session_lock(&self, conversation_id: &str, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((conversation_id.to_string(), user_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Initializes a ratchet session from an exchange secret.
    ///
    /// Fails with `AlreadyInitialized` when a state exists, unless `reset`
    /// is set, in which case the old state and its skipped keys are dropped.
    pub fn initialize(
        &self,
        conversation_id: &str,
        user_id: &str,
        shared_secret: &[u8],
        is_initiator: bool,
        reset: bool,
    ) -> Result<()> {
        Validator::validate_identifier("conversationId", conversation_id)?;
        Validator::validate_identifier("userId", user_id)?;
        Validator::validate_shared_secret(shared_secret)?;

        let lock = self.session_lock(conversation_id, user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.store.has_state(conversation_id, user_id)? {
            if !reset {
                return Err(PqRatchetError::already_initialized(format!(
                    "{}:{}",
                    conversation_id, user_id
                )));
            }
            self.store.delete_state(conversation_id, user_id)?;
        }

        let state = RatchetState::initialize(shared_secret, is_initiator)?;
        self.store.put_state(conversation_id, user_id, &state)?;

        info!(
            conversation_id,
            user_id, is_initiator, "initialized ratchet session"
        );
        Ok(())
    }

    /// Whether a ratchet state exists for the session.
    pub fn has_state(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.store.has_state(conversation_id, user_id)
    }

    /// Deletes the session state and its skipped keys.
    pub fn delete(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let lock = self.session_lock(conversation_id, user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.store.delete_state(conversation_id, user_id)
    }

    /// Encrypts a plaintext, advancing the sending chain.
    ///
    /// `associated_data` (typically the sender's identity) is bound into the
    /// authentication tag together with the counters and ephemeral key.
    pub fn encrypt(
        &self,
        conversation_id: &str,
        user_id: &str,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<MessageEnvelope> {
        Validator::validate_plaintext_size(plaintext)?;

        let lock = self.session_lock(conversation_id, user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut state = self
            .store
            .get_state(conversation_id, user_id)?
            .ok_or_else(|| {
                PqRatchetError::not_initialized(format!("{}:{}", conversation_id, user_id))
            })?;

        let (key, info) = state.next_sending_key()?;

        let aad = binding_data(
            associated_data,
            info.message_number,
            info.chain_length,
            &info.ephemeral_public_key,
        );
        let (ciphertext, nonce, auth_tag) = seal_message(&key, plaintext, &aad)?;

        self.store.put_state(conversation_id, user_id, &state)?;

        let (algorithm, security_level) = MessageEnvelope::suite();
        let envelope = MessageEnvelope {
            ciphertext,
            nonce: nonce.to_vec(),
            auth_tag,
            ephemeral_public_key: info.ephemeral_public_key.to_vec(),
            message_number: info.message_number,
            chain_length: info.chain_length,
            previous_chain_length: info.previous_chain_length,
            key_id: message_key_id(
                &info.ephemeral_public_key,
                info.chain_length,
                info.message_number,
            ),
            algorithm,
            security_level,
            pqc_ciphertext: info.pqc_ciphertext,
            signature: None,
        };

        debug!(
            conversation_id,
            user_id,
            message_number = envelope.message_number,
            chain_length = envelope.chain_length,
            "encrypted message"
        );
        Ok(envelope)
    }

    /// Decrypts an envelope, performing ratchet steps and skipped-key
    /// bookkeeping as needed.
    pub fn decrypt(
        &self,
        conversation_id: &str,
        user_id: &str,
        envelope: &MessageEnvelope,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let their_ephemeral: [u8; DH_PUBLIC_KEY_SIZE] = envelope
            .ephemeral_public_key
            .as_slice()
            .try_into()
            .map_err(|_| PqRatchetError::validation("malformed ephemeral public key"))?;
        if envelope.nonce.len() != NONCE_SIZE || envelope.auth_tag.len() != AUTH_TAG_SIZE {
            return Err(PqRatchetError::validation("malformed envelope"));
        }

        let lock = self.session_lock(conversation_id, user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.store.has_state(conversation_id, user_id)? {
            return Err(PqRatchetError::not_initialized(format!(
                "{}:{}",
                conversation_id, user_id
            )));
        }

        let aad = binding_data(
            associated_data,
            envelope.message_number,
            envelope.chain_length,
            &their_ephemeral,
        );

        // Retained skipped keys are single-use: consult them before touching
        // the live state, delete only after a successful open.
        let key_id = message_key_id(
            &their_ephemeral,
            envelope.chain_length,
            envelope.message_number,
        );
        if let Some(key) = self
            .store
            .get_skipped_key(conversation_id, user_id, &key_id)?
        {
            let plaintext = open_message(&key, envelope, &aad)?;
            self.store
                .delete_skipped_key(conversation_id, user_id, &key_id)?;
            debug!(
                conversation_id,
                user_id,
                message_number = envelope.message_number,
                "decrypted with retained skipped key"
            );
            return Ok(plaintext);
        }

        let mut state = self
            .store
            .get_state(conversation_id, user_id)?
            .ok_or_else(|| {
                PqRatchetError::not_initialized(format!("{}:{}", conversation_id, user_id))
            })?;

        let (key, skipped) = state.next_receiving_key(
            &their_ephemeral,
            envelope.message_number,
            envelope.chain_length,
            envelope.previous_chain_length,
            envelope.pqc_ciphertext.as_deref(),
        )?;

        // An envelope that fails authentication must leave the session
        // untouched, so nothing is persisted until the tag verifies.
        let plaintext = open_message(&key, envelope, &aad)?;

        let expires_at = chrono::Utc::now().timestamp().max(0) as u64 + SKIPPED_KEY_TTL_SECS;
        for s in &skipped {
            let id = message_key_id(&s.ephemeral_public_key, s.chain_length, s.message_number);
            self.store.put_skipped_key(
                conversation_id,
                user_id,
                &id,
                &s.key,
                s.chain_length,
                s.message_number,
                expires_at,
            )?;
        }
        self.store.put_state(conversation_id, user_id, &state)?;

        debug!(
            conversation_id,
            user_id,
            message_number = envelope.message_number,
            chain_length = envelope.chain_length,
            skipped = skipped.len(),
            "decrypted message"
        );
        Ok(plaintext)
    }

    /// Session counters for observability.
    pub fn statistics(&self, conversation_id: &str, user_id: &str) -> Result<RatchetStatistics> {
        self.store.statistics(conversation_id, user_id)
    }
}

/// Encrypts with a message key, returning (ciphertext, nonce, tag).
fn seal_message(
    key: &MessageKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE], Vec<u8>)> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| PqRatchetError::crypto("Message encryption failed"))?;

    // The Poly1305 tag travels in its own envelope field.
    let tag = sealed.split_off(sealed.len() - AUTH_TAG_SIZE);
    Ok((sealed, nonce_bytes, tag))
}

/// Decrypts an envelope with a message key.
fn open_message(key: &MessageKey, envelope: &MessageEnvelope, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&envelope.nonce);

    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + envelope.auth_tag.len());
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.auth_tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| PqRatchetError::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, StaticMasterKey};

    fn engine() -> RatchetEngine {
        let store = Arc::new(
            KeyMaterialStore::new(
                Box::new(MemoryBackend::new()),
                &StaticMasterKey::from_bytes([7u8; 32]),
            )
            .unwrap(),
        );
        RatchetEngine::new(store)
    }

    fn paired_engines(conversation: &str) -> (RatchetEngine, RatchetEngine) {
        let secret = [42u8; 32];
        let alice = engine();
        let bob = engine();
        alice
            .initialize(conversation, "alice", &secret, true, false)
            .unwrap();
        bob.initialize(conversation, "bob", &secret, false, false)
            .unwrap();
        (alice, bob)
    }

    #[test]
    fn test_initialize_twice_requires_reset() {
        let engine = engine();
        let secret = [42u8; 32];

        engine.initialize("c", "alice", &secret, true, false).unwrap();
        assert!(matches!(
            engine
                .initialize("c", "alice", &secret, true, false)
                .unwrap_err(),
            PqRatchetError::AlreadyInitialized(_)
        ));
        engine.initialize("c", "alice", &secret, true, true).unwrap();
    }

    #[test]
    fn test_has_state_and_delete() {
        let engine = engine();

        assert!(!engine.has_state("c", "alice").unwrap());
        engine
            .initialize("c", "alice", &[42u8; 32], true, false)
            .unwrap();
        assert!(engine.has_state("c", "alice").unwrap());
        assert!(engine.delete("c", "alice").unwrap());
        assert!(!engine.has_state("c", "alice").unwrap());
    }

    #[test]
    fn test_encrypt_requires_initialization() {
        let engine = engine();
        assert!(matches!(
            engine.encrypt("c", "alice", b"hi", b"alice").unwrap_err(),
            PqRatchetError::RatchetNotInitialized(_)
        ));
    }

    #[test]
    fn test_roundtrip() {
        let (alice, bob) = paired_engines("c");

        let envelope = alice.encrypt("c", "alice", b"hello bob", b"alice").unwrap();
        let plaintext = bob.decrypt("c", "bob", &envelope, b"alice").unwrap();

        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_concrete_alice_bob_scenario() {
        let (alice, bob) = paired_engines("c");

        let first = alice.encrypt("c", "alice", b"hello", b"alice").unwrap();
        assert_eq!(first.message_number, 0);
        assert_eq!(first.chain_length, 1);
        assert_eq!(bob.decrypt("c", "bob", &first, b"alice").unwrap(), b"hello");

        let second = alice.encrypt("c", "alice", b"again", b"alice").unwrap();
        assert_eq!(second.message_number, 1);
        assert_ne!(first.key_id, second.key_id);
        assert_ne!(first.ciphertext, second.ciphertext);

        // A corrupted copy is rejected; the pristine envelope still decrypts.
        let mut corrupted = second.clone();
        corrupted.ciphertext[0] ^= 0x01;
        assert!(matches!(
            bob.decrypt("c", "bob", &corrupted, b"alice").unwrap_err(),
            PqRatchetError::AuthenticationFailure
        ));
        assert_eq!(bob.decrypt("c", "bob", &second, b"alice").unwrap(), b"again");
    }

    #[test]
    fn test_tampered_tag_and_aad_fail() {
        let (alice, bob) = paired_engines("c");

        let envelope = alice.encrypt("c", "alice", b"payload", b"alice").unwrap();

        let mut bad_tag = envelope.clone();
        bad_tag.auth_tag[0] ^= 0x80;
        assert!(matches!(
            bob.decrypt("c", "bob", &bad_tag, b"alice").unwrap_err(),
            PqRatchetError::AuthenticationFailure
        ));

        // Wrong associated data (spoofed sender) also fails.
        assert!(matches!(
            bob.decrypt("c", "bob", &envelope, b"mallory").unwrap_err(),
            PqRatchetError::AuthenticationFailure
        ));

        // The failures left the session usable.
        assert_eq!(
            bob.decrypt("c", "bob", &envelope, b"alice").unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (alice, bob) = paired_engines("c");

        let e1 = alice.encrypt("c", "alice", b"one", b"alice").unwrap();
        let e2 = alice.encrypt("c", "alice", b"two", b"alice").unwrap();
        let e3 = alice.encrypt("c", "alice", b"three", b"alice").unwrap();

        // Delivered 1, 3, 2.
        assert_eq!(bob.decrypt("c", "bob", &e1, b"alice").unwrap(), b"one");
        assert_eq!(bob.decrypt("c", "bob", &e3, b"alice").unwrap(), b"three");
        assert_eq!(bob.decrypt("c", "bob", &e2, b"alice").unwrap(), b"two");

        // The retained key was single-use.
        assert!(bob.decrypt("c", "bob", &e2, b"alice").is_err());
    }

    #[test]
    fn test_skip_window_exceeded() {
        let (alice, bob) = paired_engines("c");

        let e1 = alice.encrypt("c", "alice", b"one", b"alice").unwrap();
        assert_eq!(bob.decrypt("c", "bob", &e1, b"alice").unwrap(), b"one");

        let e2 = alice.encrypt("c", "alice", b"two", b"alice").unwrap();
        let mut far_future = alice.encrypt("c", "alice", b"far", b"alice").unwrap();
        far_future.message_number = crate::ratchet::MAX_SKIP + 5;

        assert!(matches!(
            bob.decrypt("c", "bob", &far_future, b"alice").unwrap_err(),
            PqRatchetError::SkipWindowExceeded(_)
        ));

        // The failed attempt did not advance the chain.
        assert_eq!(bob.decrypt("c", "bob", &e2, b"alice").unwrap(), b"two");
    }

    #[test]
    fn test_bidirectional_conversation() {
        let (alice, bob) = paired_engines("c");

        let e1 = alice.encrypt("c", "alice", b"hi bob", b"alice").unwrap();
        assert_eq!(bob.decrypt("c", "bob", &e1, b"alice").unwrap(), b"hi bob");

        let r1 = bob.encrypt("c", "bob", b"hi alice", b"bob").unwrap();
        assert_eq!(r1.chain_length, 1);
        assert_eq!(alice.decrypt("c", "alice", &r1, b"bob").unwrap(), b"hi alice");

        let e2 = alice.encrypt("c", "alice", b"how are you", b"alice").unwrap();
        assert_eq!(e2.chain_length, 2);
        assert_ne!(e2.ephemeral_public_key, e1.ephemeral_public_key);
        assert_eq!(
            bob.decrypt("c", "bob", &e2, b"alice").unwrap(),
            b"how are you"
        );
    }

    #[test]
    fn test_responder_cannot_encrypt_before_first_receive() {
        let (_, bob) = paired_engines("c");
        assert!(bob.encrypt("c", "bob", b"too early", b"bob").is_err());
    }

    #[test]
    fn test_statistics_track_counters() {
        let (alice, bob) = paired_engines("c");

        let e1 = alice.encrypt("c", "alice", b"one", b"alice").unwrap();
        let _e2 = alice.encrypt("c", "alice", b"two", b"alice").unwrap();
        bob.decrypt("c", "bob", &e1, b"alice").unwrap();

        let alice_stats = alice.statistics("c", "alice").unwrap();
        assert_eq!(alice_stats.sending_message_number, 2);
        assert_eq!(alice_stats.sending_chain_length, 1);

        let bob_stats = bob.statistics("c", "bob").unwrap();
        assert_eq!(bob_stats.receiving_message_number, 1);
        assert_eq!(bob_stats.receiving_chain_length, 1);
    }
}
