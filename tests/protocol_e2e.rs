//! End-to-end protocol tests.
//!
//! Drives the public API the way a deployment does: a key exchange relayed
//! through the coordinator, ratchet sessions initialized from the resulting
//! shared secret, messages flowing both ways through engines backed by
//! separate stores, and the relay-side bookkeeping around them.

use pqratchet::error::PqRatchetError;
use pqratchet::exchange::{ExchangeStatus, ExchangeType, KeyExchangeCoordinator, PublicKeyBundle};
use pqratchet::negotiation::{AlgorithmNegotiationLedger, KeyExchangeAlgorithm};
use pqratchet::ratchet::{RatchetEngine, MAX_SKIP};
use pqratchet::store::{KeyMaterialStore, MemoryBackend, StaticMasterKey};
use pqratchet::sync::{DeviceDirectory, MultiDeviceSyncCoordinator, SyncKeyType, SyncMetadata,
    SyncPriority, SyncStatus};
use std::sync::Arc;

const CONVERSATION: &str = "conv-e2e";

fn engine(master_key: [u8; 32]) -> RatchetEngine {
    let store = Arc::new(
        KeyMaterialStore::new(
            Box::new(MemoryBackend::new()),
            &StaticMasterKey::from_bytes(master_key),
        )
        .unwrap(),
    );
    RatchetEngine::new(store)
}

fn bundle() -> PublicKeyBundle {
    PublicKeyBundle {
        classical_public_key: "Y2xhc3NpY2FsLWtleQ==".into(),
        pqc_public_key: "cHFjLWtleQ==".into(),
        signature: None,
        security_level: 5,
        quantum_resistant: true,
    }
}

/// The §-by-§ concrete scenario: exchange, init, hello/again, tamper.
#[test]
fn full_conversation_setup_and_messaging() {
    // 1. Alice and Bob run a hybrid key exchange through the relay.
    let ledger = Arc::new(AlgorithmNegotiationLedger::new());
    let coordinator = KeyExchangeCoordinator::new(ledger.clone());

    let exchange = coordinator
        .initiate(
            "alice",
            "bob",
            CONVERSATION,
            ExchangeType::InitialSetup,
            bundle(),
            "a2V5LWRhdGEtZm9yLWJvYg==".into(),
        )
        .unwrap();
    coordinator
        .respond(&exchange.id, "bob", "a2V5LWRhdGEtZm9yLWFsaWNl".into(), bundle())
        .unwrap();
    let completed = coordinator.complete(&exchange.id, "alice", None).unwrap();
    assert_eq!(completed.status, ExchangeStatus::Completed);

    // The completed setup left a negotiation record behind.
    let negotiation = ledger.get_active(CONVERSATION).unwrap();
    assert_eq!(
        negotiation.suite.key_exchange,
        KeyExchangeAlgorithm::X25519MlKem1024
    );
    assert!(negotiation.quantum_resistant);

    // 2. Both clients derived the same hybrid secret from the exchanged
    //    material (done client-side; opaque to this crate) and initialize.
    let shared_secret = [42u8; 32];
    let alice = engine([1u8; 32]);
    let bob = engine([2u8; 32]);
    alice
        .initialize(CONVERSATION, "alice", &shared_secret, true, false)
        .unwrap();
    bob.initialize(CONVERSATION, "bob", &shared_secret, false, false)
        .unwrap();
    assert!(alice.has_state(CONVERSATION, "alice").unwrap());
    assert!(bob.has_state(CONVERSATION, "bob").unwrap());

    // 3. First message: number 0, chain 1, distinct derived keys per send.
    let first = alice
        .encrypt(CONVERSATION, "alice", b"hello", b"alice")
        .unwrap();
    assert_eq!(first.message_number, 0);
    assert_eq!(first.chain_length, 1);
    assert!(first.pqc_ciphertext.is_some());
    assert_eq!(
        bob.decrypt(CONVERSATION, "bob", &first, b"alice").unwrap(),
        b"hello"
    );

    let second = alice
        .encrypt(CONVERSATION, "alice", b"again", b"alice")
        .unwrap();
    assert_eq!(second.message_number, 1);
    assert_ne!(second.key_id, first.key_id);

    // 4. A corrupted copy fails closed; the original still decrypts.
    let mut corrupted = second.clone();
    corrupted.ciphertext[0] ^= 0x01;
    assert!(matches!(
        bob.decrypt(CONVERSATION, "bob", &corrupted, b"alice")
            .unwrap_err(),
        PqRatchetError::AuthenticationFailure
    ));
    assert_eq!(
        bob.decrypt(CONVERSATION, "bob", &second, b"alice").unwrap(),
        b"again"
    );
}

#[test]
fn envelope_survives_wire_serialization() {
    let shared_secret = [7u8; 32];
    let alice = engine([1u8; 32]);
    let bob = engine([2u8; 32]);
    alice
        .initialize(CONVERSATION, "alice", &shared_secret, true, false)
        .unwrap();
    bob.initialize(CONVERSATION, "bob", &shared_secret, false, false)
        .unwrap();

    let envelope = alice
        .encrypt(CONVERSATION, "alice", b"over the wire", b"alice")
        .unwrap();

    // Relay and storage see only the JSON form; it must round-trip exactly.
    let json = serde_json::to_string(&envelope).unwrap();
    let parsed = serde_json::from_str(&json).unwrap();
    assert_eq!(envelope, parsed);

    assert_eq!(
        bob.decrypt(CONVERSATION, "bob", &parsed, b"alice").unwrap(),
        b"over the wire"
    );
}

#[test]
fn out_of_order_and_window_bounds() {
    let shared_secret = [9u8; 32];
    let alice = engine([1u8; 32]);
    let bob = engine([2u8; 32]);
    alice
        .initialize(CONVERSATION, "alice", &shared_secret, true, false)
        .unwrap();
    bob.initialize(CONVERSATION, "bob", &shared_secret, false, false)
        .unwrap();

    let e1 = alice.encrypt(CONVERSATION, "alice", b"m1", b"alice").unwrap();
    let e2 = alice.encrypt(CONVERSATION, "alice", b"m2", b"alice").unwrap();
    let e3 = alice.encrypt(CONVERSATION, "alice", b"m3", b"alice").unwrap();

    // 1, 3, 2 all decrypt within the window.
    assert_eq!(bob.decrypt(CONVERSATION, "bob", &e1, b"alice").unwrap(), b"m1");
    assert_eq!(bob.decrypt(CONVERSATION, "bob", &e3, b"alice").unwrap(), b"m3");
    assert_eq!(bob.decrypt(CONVERSATION, "bob", &e2, b"alice").unwrap(), b"m2");

    // A message numbered beyond the window is rejected without corrupting
    // the session.
    let e4 = alice.encrypt(CONVERSATION, "alice", b"m4", b"alice").unwrap();
    let mut beyond = e4.clone();
    beyond.message_number += MAX_SKIP + 1;
    assert!(matches!(
        bob.decrypt(CONVERSATION, "bob", &beyond, b"alice").unwrap_err(),
        PqRatchetError::SkipWindowExceeded(_)
    ));
    assert_eq!(bob.decrypt(CONVERSATION, "bob", &e4, b"alice").unwrap(), b"m4");

    let stats = bob.statistics(CONVERSATION, "bob").unwrap();
    assert_eq!(stats.receiving_message_number, 4);
    assert_eq!(stats.skipped_keys_count, 0);
}

#[test]
fn forward_secrecy_across_ratchet_steps() {
    let shared_secret = [11u8; 32];
    let alice = engine([1u8; 32]);
    let bob = engine([2u8; 32]);
    alice
        .initialize(CONVERSATION, "alice", &shared_secret, true, false)
        .unwrap();
    bob.initialize(CONVERSATION, "bob", &shared_secret, false, false)
        .unwrap();

    // Several round trips; each direction change rotates ephemerals.
    let a1 = alice.encrypt(CONVERSATION, "alice", b"ping", b"alice").unwrap();
    bob.decrypt(CONVERSATION, "bob", &a1, b"alice").unwrap();
    let b1 = bob.encrypt(CONVERSATION, "bob", b"pong", b"bob").unwrap();
    alice.decrypt(CONVERSATION, "alice", &b1, b"bob").unwrap();
    let a2 = alice.encrypt(CONVERSATION, "alice", b"ping2", b"alice").unwrap();
    bob.decrypt(CONVERSATION, "bob", &a2, b"alice").unwrap();

    assert_ne!(a1.ephemeral_public_key, a2.ephemeral_public_key);
    assert_ne!(a1.ephemeral_public_key, b1.ephemeral_public_key);
    assert_eq!(a2.chain_length, 2);

    // Fresh KEM ciphertexts accompany each new chain.
    assert_ne!(a1.pqc_ciphertext, a2.pqc_ciphertext);
}

#[test]
fn exchange_lifecycle_violations() {
    let coordinator = KeyExchangeCoordinator::new(Arc::new(AlgorithmNegotiationLedger::new()));

    let exchange = coordinator
        .initiate(
            "alice",
            "bob",
            CONVERSATION,
            ExchangeType::RatchetUpdate,
            bundle(),
            "ZGF0YQ==".into(),
        )
        .unwrap();

    // Completing before responding is a state-machine violation.
    assert!(matches!(
        coordinator.complete(&exchange.id, "alice", None).unwrap_err(),
        PqRatchetError::ExchangeInvalidState(_)
    ));

    coordinator
        .respond(&exchange.id, "bob", "cmVzcA==".into(), bundle())
        .unwrap();

    // Responding twice fails the second time.
    assert!(matches!(
        coordinator
            .respond(&exchange.id, "bob", "cmVzcA==".into(), bundle())
            .unwrap_err(),
        PqRatchetError::ExchangeInvalidState(_)
    ));

    coordinator.complete(&exchange.id, "bob", None).unwrap();
}

#[test]
fn device_ownership_is_enforced_end_to_end() {
    let devices = Arc::new(DeviceDirectory::new());
    devices.register_device("alice", "alice-phone").unwrap();
    devices.register_device("alice", "alice-laptop").unwrap();
    devices.register_device("eve", "eve-phone").unwrap();
    let sync = MultiDeviceSyncCoordinator::new(devices);

    let metadata = SyncMetadata {
        key_type: SyncKeyType::RatchetState,
        conversation_id: Some(CONVERSATION.into()),
        integrity_hash: "aGFzaA==".into(),
        signature: "c2ln".into(),
        sync_priority: SyncPriority::High,
    };

    // Cross-user transfer is rejected at creation.
    assert!(matches!(
        sync.create_package(
            "alice",
            "alice-phone",
            "eve-phone",
            "cGtn".into(),
            metadata.clone(),
        )
        .unwrap_err(),
        PqRatchetError::DeviceOwnershipMismatch(_)
    ));

    let package = sync
        .create_package(
            "alice",
            "alice-phone",
            "alice-laptop",
            "cGtn".into(),
            metadata,
        )
        .unwrap();

    // Eve cannot list Alice's pending packages.
    assert!(sync.list_pending("alice-laptop", "eve").is_err());

    let pending = sync.list_pending("alice-laptop", "alice").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].package_id, package.package_id);

    let processed = sync
        .mark_processed(&package.package_id, "alice", true, None)
        .unwrap();
    assert_eq!(processed.status, SyncStatus::Processed);
    assert!(sync.list_pending("alice-laptop", "alice").unwrap().is_empty());
}

#[test]
fn reset_reinitializes_a_conversation() {
    let shared_secret = [13u8; 32];
    let alice = engine([1u8; 32]);
    alice
        .initialize(CONVERSATION, "alice", &shared_secret, true, false)
        .unwrap();
    alice
        .encrypt(CONVERSATION, "alice", b"before reset", b"alice")
        .unwrap();

    assert!(matches!(
        alice
            .initialize(CONVERSATION, "alice", &shared_secret, true, false)
            .unwrap_err(),
        PqRatchetError::AlreadyInitialized(_)
    ));

    let new_secret = [14u8; 32];
    alice
        .initialize(CONVERSATION, "alice", &new_secret, true, true)
        .unwrap();

    let envelope = alice
        .encrypt(CONVERSATION, "alice", b"after reset", b"alice")
        .unwrap();
    assert_eq!(envelope.message_number, 0);
    assert_eq!(envelope.chain_length, 1);
}
