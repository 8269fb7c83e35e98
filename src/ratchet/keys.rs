//! Key types for the hybrid ratchet.
//!
//! All secret-bearing types redact their `Debug` output and zeroize on drop.
//! Public-key wrappers validate their bytes on construction so malformed
//! material is rejected at the boundary instead of deep inside a ratchet
//! step.

use crate::error::{PqRatchetError, Result};
use crate::ratchet::kdf_info;
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, DecapsulationKey, EncapsulationKey};
use ml_kem::{B32, Ciphertext, Encoded, EncapsulateDeterministic, EncodedSizeUser, KemCore,
    MlKem1024, MlKem1024Params};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::Sha3_512;
use std::fmt;
use zeroize::ZeroizeOnDrop;

/// Size of root keys in bytes.
pub const ROOT_KEY_SIZE: usize = 32;

/// Size of chain keys in bytes.
pub const CHAIN_KEY_SIZE: usize = 32;

/// Size of message keys in bytes.
pub const MESSAGE_KEY_SIZE: usize = 32;

/// Size of an X25519 public key in bytes.
pub const DH_PUBLIC_KEY_SIZE: usize = 32;

/// A root key for the hybrid ratchet.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct RootKey {
    key: [u8; ROOT_KEY_SIZE],
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl RootKey {
    /// Creates a root key from bytes.
    pub fn from_bytes(bytes: [u8; ROOT_KEY_SIZE]) -> Self {
        Self { key: bytes }
    }

    /// Derives the initial root key from an exchange secret.
    pub fn derive_initial(shared_secret: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha3_512>::new(None, shared_secret);
        let mut key = [0u8; ROOT_KEY_SIZE];
        hk.expand(kdf_info::ROOT_INIT, &mut key)
            .map_err(|_| PqRatchetError::crypto("Root key derivation failed"))?;
        Ok(Self { key })
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; ROOT_KEY_SIZE] {
        &self.key
    }

    /// Advances the root, returning the new root key and a fresh chain key.
    ///
    /// This is the hybrid ratchet step KDF:
    /// - `new_root = HKDF(salt=root, ikm=step_secret, "ratchet-root")`
    /// - `chain = HKDF(salt=root, ikm=step_secret, "ratchet-chain")`
    ///
    /// where `step_secret` is the X25519 output, optionally concatenated with
    /// the ML-KEM shared secret.
    pub fn advance(&self, step_secret: &[u8]) -> Result<(RootKey, ChainKey)> {
        let hk = Hkdf::<Sha3_512>::new(Some(&self.key), step_secret);

        let mut new_root = [0u8; ROOT_KEY_SIZE];
        let mut chain = [0u8; CHAIN_KEY_SIZE];

        hk.expand(kdf_info::RATCHET_ROOT, &mut new_root)
            .map_err(|_| PqRatchetError::crypto("Root key derivation failed"))?;
        hk.expand(kdf_info::RATCHET_CHAIN, &mut chain)
            .map_err(|_| PqRatchetError::crypto("Chain key derivation failed"))?;

        Ok((RootKey::from_bytes(new_root), ChainKey::new(chain, 0)))
    }
}

/// A chain key used in the symmetric ratchet.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; CHAIN_KEY_SIZE],
    index: u32,
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey")
            .field("index", &self.index)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ChainKey {
    /// Creates a chain key from bytes with an index.
    pub fn new(key: [u8; CHAIN_KEY_SIZE], index: u32) -> Self {
        Self { key, index }
    }

    /// Returns the chain index (next message number in this chain).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Advances the chain, returning the new chain key and a message key.
    ///
    /// This is the symmetric ratchet step:
    /// - `new_chain_key = HKDF(chain_key, "ratchet-chain")`
    /// - `message_key = HKDF(chain_key, "ratchet-message")`
    pub fn advance(&self) -> Result<(ChainKey, MessageKey)> {
        let hk = Hkdf::<Sha3_512>::new(None, &self.key);

        let mut new_chain_key = [0u8; CHAIN_KEY_SIZE];
        let mut message_key = [0u8; MESSAGE_KEY_SIZE];

        hk.expand(kdf_info::RATCHET_CHAIN, &mut new_chain_key)
            .map_err(|_| PqRatchetError::crypto("Chain key derivation failed"))?;
        hk.expand(kdf_info::RATCHET_MESSAGE, &mut message_key)
            .map_err(|_| PqRatchetError::crypto("Message key derivation failed"))?;

        Ok((
            ChainKey {
                key: new_chain_key,
                index: self.index + 1,
            },
            MessageKey::from_bytes(message_key),
        ))
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; CHAIN_KEY_SIZE] {
        &self.key
    }
}

/// A message key used to encrypt or decrypt exactly one message.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MessageKey {
    key: [u8; MESSAGE_KEY_SIZE],
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MessageKey {
    /// Creates a message key from bytes.
    pub fn from_bytes(bytes: [u8; MESSAGE_KEY_SIZE]) -> Self {
        Self { key: bytes }
    }

    /// Returns the key bytes for use in AEAD encryption.
    pub fn as_bytes(&self) -> &[u8; MESSAGE_KEY_SIZE] {
        &self.key
    }
}

/// An X25519 ephemeral keypair used in the ratchet.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    secret: [u8; 32],
    public: [u8; DH_PUBLIC_KEY_SIZE],
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl EphemeralKeyPair {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_seed(secret)
    }

    /// Builds a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let sk = x25519_dalek::StaticSecret::from(seed);
        let pk = x25519_dalek::PublicKey::from(&sk);
        Self {
            secret: sk.to_bytes(),
            public: pk.to_bytes(),
        }
    }

    /// Returns the public key bytes.
    pub fn public(&self) -> [u8; DH_PUBLIC_KEY_SIZE] {
        self.public
    }

    /// Computes the X25519 shared secret with a peer public key.
    pub fn dh(&self, their_public: &[u8; DH_PUBLIC_KEY_SIZE]) -> [u8; 32] {
        let sk = x25519_dalek::StaticSecret::from(self.secret);
        let pk = x25519_dalek::PublicKey::from(*their_public);
        sk.diffie_hellman(&pk).to_bytes()
    }
}

/// An ML-KEM-1024 encapsulation (public) key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KemPublicKey {
    key_bytes: Vec<u8>,
}

impl fmt::Debug for KemPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemPublicKey")
            .field("size", &self.key_bytes.len())
            .finish()
    }
}

impl KemPublicKey {
    /// Creates from raw bytes, validating by parse.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(&bytes)?;
        Ok(Self { key_bytes: bytes })
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    fn parse(bytes: &[u8]) -> Result<EncapsulationKey<MlKem1024Params>> {
        let enc = Encoded::<EncapsulationKey<MlKem1024Params>>::try_from(bytes)
            .map_err(|_| PqRatchetError::crypto("Invalid ML-KEM public key"))?;
        Ok(EncapsulationKey::from_bytes(&enc))
    }

    /// Encapsulates to this key, returning the shared secret and ciphertext.
    pub fn encapsulate(&self) -> Result<([u8; 32], Vec<u8>)> {
        let ek = Self::parse(&self.key_bytes)?;
        let mut m = [0u8; 32];
        OsRng.fill_bytes(&mut m);
        let m = B32::from(m);
        let (ct, ss) = ek
            .encapsulate_deterministic(&m)
            .map_err(|_| PqRatchetError::crypto("ML-KEM encapsulation failed"))?;
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&ss);
        Ok((secret, ct.to_vec()))
    }
}

/// An ML-KEM-1024 keypair held by one side of the ratchet.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct KemKeyPair {
    decaps_bytes: Vec<u8>,
    encaps_bytes: Vec<u8>,
}

impl fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public_size", &self.encaps_bytes.len())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KemKeyPair {
    /// Builds a keypair deterministically from two 32-byte seeds.
    pub fn from_seeds(d: [u8; 32], z: [u8; 32]) -> Self {
        let d = B32::from(d);
        let z = B32::from(z);
        let (dk, ek) = MlKem1024::generate_deterministic(&d, &z);
        Self {
            decaps_bytes: dk.as_bytes().to_vec(),
            encaps_bytes: ek.as_bytes().to_vec(),
        }
    }

    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let mut d = [0u8; 32];
        let mut z = [0u8; 32];
        OsRng.fill_bytes(&mut d);
        OsRng.fill_bytes(&mut z);
        Self::from_seeds(d, z)
    }

    /// Returns the encapsulation (public) half.
    pub fn public(&self) -> Result<KemPublicKey> {
        KemPublicKey::from_bytes(self.encaps_bytes.clone())
    }

    /// Decapsulates a ciphertext with the secret half.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<[u8; 32]> {
        let enc = Encoded::<DecapsulationKey<MlKem1024Params>>::try_from(&self.decaps_bytes[..])
            .map_err(|_| PqRatchetError::crypto("Invalid ML-KEM secret key"))?;
        let dk = DecapsulationKey::<MlKem1024Params>::from_bytes(&enc);
        let ct = Ciphertext::<MlKem1024>::try_from(ciphertext)
            .map_err(|_| PqRatchetError::crypto("Invalid ML-KEM ciphertext"))?;
        let ss = dk
            .decapsulate(&ct)
            .map_err(|_| PqRatchetError::crypto("ML-KEM decapsulation failed"))?;
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&ss);
        Ok(secret)
    }
}
