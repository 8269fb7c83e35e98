//! The hybrid ratchet state machine.
//!
//! `RatchetState` is a pure value: no I/O, no clocks. The engine persists it
//! through the key-material store and serializes access per session.
//!
//! ## Bootstrap
//!
//! Both sides derive the responder's base X25519 and ML-KEM keypairs from the
//! exchange secret, so the initiator performs its first sending ratchet step
//! during initialization and the responder can complete the matching
//! receiving step from the first envelope alone. The responder has no sending
//! chain until the initiator's ephemeral key arrives.
//!
//! ## Ratchet steps
//!
//! A step mixes `DH(our_ephemeral, their_ephemeral)` and, when a KEM
//! ciphertext is available, the ML-KEM shared secret into the root KDF.
//! Receiving a new peer ephemeral performs the receiving step and eagerly
//! rotates our own ephemeral for the reply chain, as in the classic Double
//! Ratchet.

use crate::error::{PqRatchetError, Result};
use crate::ratchet::keys::{
    ChainKey, EphemeralKeyPair, KemKeyPair, KemPublicKey, MessageKey, RootKey, DH_PUBLIC_KEY_SIZE,
};
use crate::ratchet::{kdf_info, MAX_SKIP};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha3::Sha3_512;
use std::fmt;
use zeroize::Zeroize;

/// Header material produced alongside a sending message key.
#[derive(Debug, Clone)]
pub struct SendInfo {
    /// Our current ephemeral public key
    pub ephemeral_public_key: [u8; DH_PUBLIC_KEY_SIZE],
    /// Message number within the sending chain
    pub message_number: u32,
    /// Completed sending ratchet steps
    pub chain_length: u32,
    /// Message count of the previous sending chain
    pub previous_chain_length: u32,
    /// KEM ciphertext of the step that opened this chain
    pub pqc_ciphertext: Option<Vec<u8>>,
}

/// A message key derived while skipping ahead, to be retained for later.
pub struct SkippedKeyMaterial {
    /// Ephemeral key of the chain the key belongs to
    pub ephemeral_public_key: [u8; DH_PUBLIC_KEY_SIZE],
    /// Receiving chain length the key belongs to
    pub chain_length: u32,
    /// Message number of the key
    pub message_number: u32,
    /// The derived message key
    pub key: MessageKey,
}

impl fmt::Debug for SkippedKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkippedKeyMaterial")
            .field("chain_length", &self.chain_length)
            .field("message_number", &self.message_number)
            .finish()
    }
}

/// Complete per-session ratchet state.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: RootKey,
    sending_chain: Option<ChainKey>,
    receiving_chain: Option<ChainKey>,
    sending_chain_length: u32,
    receiving_chain_length: u32,
    previous_chain_length: u32,
    our_ephemeral: EphemeralKeyPair,
    their_ephemeral: Option<[u8; DH_PUBLIC_KEY_SIZE]>,
    our_kem: KemKeyPair,
    their_kem: KemPublicKey,
    current_pqc_ciphertext: Option<Vec<u8>>,
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState")
            .field("sending_chain_length", &self.sending_chain_length)
            .field("receiving_chain_length", &self.receiving_chain_length)
            .field("sending_message_number", &self.sending_message_number())
            .field("receiving_message_number", &self.receiving_message_number())
            .field("has_their_ephemeral", &self.their_ephemeral.is_some())
            .finish()
    }
}

fn derive_seed(shared_secret: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha3_512>::new(None, shared_secret);
    let mut seed = [0u8; 32];
    hk.expand(info, &mut seed)
        .map_err(|_| PqRatchetError::crypto("Seed derivation failed"))?;
    Ok(seed)
}

impl RatchetState {
    /// Creates a ratchet state from an exchange secret.
    ///
    /// The initiator immediately performs its first sending ratchet step and
    /// can encrypt right away; the responder must receive one message before
    /// it can send.
    pub fn initialize(shared_secret: &[u8], is_initiator: bool) -> Result<Self> {
        let root = RootKey::derive_initial(shared_secret)?;

        let responder_dh = EphemeralKeyPair::from_seed(derive_seed(shared_secret, kdf_info::BASE_DH)?);
        let responder_kem = KemKeyPair::from_seeds(
            derive_seed(shared_secret, kdf_info::BASE_KEM_D)?,
            derive_seed(shared_secret, kdf_info::BASE_KEM_Z)?,
        );
        let initiator_kem = KemKeyPair::from_seeds(
            derive_seed(shared_secret, kdf_info::PEER_KEM_D)?,
            derive_seed(shared_secret, kdf_info::PEER_KEM_Z)?,
        );

        if is_initiator {
            let mut state = Self {
                root_key: root,
                sending_chain: None,
                receiving_chain: None,
                sending_chain_length: 0,
                receiving_chain_length: 0,
                previous_chain_length: 0,
                our_ephemeral: EphemeralKeyPair::generate(),
                their_ephemeral: Some(responder_dh.public()),
                our_kem: initiator_kem,
                their_kem: responder_kem.public()?,
                current_pqc_ciphertext: None,
            };
            state.sending_step()?;
            Ok(state)
        } else {
            Ok(Self {
                root_key: root,
                sending_chain: None,
                receiving_chain: None,
                sending_chain_length: 0,
                receiving_chain_length: 0,
                previous_chain_length: 0,
                our_ephemeral: responder_dh,
                their_ephemeral: None,
                our_kem: responder_kem,
                their_kem: initiator_kem.public()?,
                current_pqc_ciphertext: None,
            })
        }
    }

    /// Derives the next sending message key and its header material.
    pub fn next_sending_key(&mut self) -> Result<(MessageKey, SendInfo)> {
        let chain = self.sending_chain.as_ref().ok_or_else(|| {
            PqRatchetError::not_initialized(
                "sending chain not established until a message is received",
            )
        })?;

        let message_number = chain.index();
        let (new_chain, key) = chain.advance()?;
        self.sending_chain = Some(new_chain);

        Ok((
            key,
            SendInfo {
                ephemeral_public_key: self.our_ephemeral.public(),
                message_number,
                chain_length: self.sending_chain_length,
                previous_chain_length: self.previous_chain_length,
                pqc_ciphertext: self.current_pqc_ciphertext.clone(),
            },
        ))
    }

    /// Derives the message key for an incoming envelope.
    ///
    /// Performs the hybrid ratchet step when the peer's ephemeral key
    /// changed, and derives (bounded) skipped keys for every intervening
    /// message number. Skipped keys are returned to the caller for retention;
    /// keys from superseded positions are never re-derivable here, so the
    /// caller must have consulted its retained skipped keys first.
    pub fn next_receiving_key(
        &mut self,
        their_ephemeral: &[u8; DH_PUBLIC_KEY_SIZE],
        message_number: u32,
        chain_length: u32,
        previous_chain_length: u32,
        pqc_ciphertext: Option<&[u8]>,
    ) -> Result<(MessageKey, Vec<SkippedKeyMaterial>)> {
        let mut skipped = Vec::new();

        let key_changed = match self.their_ephemeral {
            Some(current) => &current != their_ephemeral,
            None => true,
        };

        if key_changed {
            if chain_length <= self.receiving_chain_length {
                return Err(PqRatchetError::skip_window(
                    "message belongs to a superseded chain and its key is no longer derivable",
                ));
            }
            if chain_length > self.receiving_chain_length + 1 {
                return Err(PqRatchetError::skip_window(
                    "ratchet step gap: an entire chain was missed",
                ));
            }

            // Retain the tail of the current receiving chain before stepping.
            let old_chain_tail = match (&self.receiving_chain, self.their_ephemeral) {
                (Some(chain), Some(old_ephemeral)) if previous_chain_length > chain.index() => {
                    Some(old_ephemeral)
                }
                _ => None,
            };
            if let Some(old_ephemeral) = old_chain_tail {
                let label = self.receiving_chain_length;
                self.skip_receiving_keys(
                    old_ephemeral,
                    label,
                    previous_chain_length,
                    &mut skipped,
                )?;
            }

            self.receiving_step(their_ephemeral, pqc_ciphertext)?;
            self.sending_step()?;
        }

        let next = self
            .receiving_chain
            .as_ref()
            .ok_or_else(|| PqRatchetError::crypto("No receiving chain"))?
            .index();

        if message_number < next {
            return Err(PqRatchetError::skip_window(
                "message key already consumed or no longer retained",
            ));
        }
        if message_number > next {
            let label = self.receiving_chain_length;
            self.skip_receiving_keys(*their_ephemeral, label, message_number, &mut skipped)?;
        }

        let (new_chain, key) = self
            .receiving_chain
            .as_ref()
            .ok_or_else(|| PqRatchetError::crypto("No receiving chain"))?
            .advance()?;
        self.receiving_chain = Some(new_chain);

        Ok((key, skipped))
    }

    /// Performs the receiving half of a hybrid ratchet step.
    fn receiving_step(
        &mut self,
        their_ephemeral: &[u8; DH_PUBLIC_KEY_SIZE],
        pqc_ciphertext: Option<&[u8]>,
    ) -> Result<()> {
        let mut step_secret = self.our_ephemeral.dh(their_ephemeral).to_vec();
        if let Some(ct) = pqc_ciphertext {
            let mut kem_secret = self.our_kem.decapsulate(ct)?;
            step_secret.extend_from_slice(&kem_secret);
            kem_secret.zeroize();
        }

        let (new_root, receiving_chain) = self.root_key.advance(&step_secret)?;
        step_secret.zeroize();

        self.root_key = new_root;
        self.receiving_chain = Some(receiving_chain);
        self.receiving_chain_length += 1;
        self.their_ephemeral = Some(*their_ephemeral);
        Ok(())
    }

    /// Performs the sending half of a hybrid ratchet step.
    ///
    /// Rotates our ephemeral keypair, encapsulates to the peer's KEM key, and
    /// opens a fresh sending chain. The old sending chain key is discarded.
    fn sending_step(&mut self) -> Result<()> {
        let their_ephemeral = self.their_ephemeral.ok_or_else(|| {
            PqRatchetError::crypto("Cannot perform sending step without a peer ephemeral key")
        })?;

        self.previous_chain_length = self
            .sending_chain
            .as_ref()
            .map(|c| c.index())
            .unwrap_or(0);

        self.our_ephemeral = EphemeralKeyPair::generate();
        let (kem_secret, kem_ciphertext) = self.their_kem.encapsulate()?;

        let mut step_secret = self.our_ephemeral.dh(&their_ephemeral).to_vec();
        step_secret.extend_from_slice(&kem_secret);

        let (new_root, sending_chain) = self.root_key.advance(&step_secret)?;
        step_secret.zeroize();

        self.root_key = new_root;
        self.sending_chain = Some(sending_chain);
        self.sending_chain_length += 1;
        self.current_pqc_ciphertext = Some(kem_ciphertext);
        Ok(())
    }

    /// Derives and collects receiving keys up to (excluding) `until`.
    fn skip_receiving_keys(
        &mut self,
        ephemeral: [u8; DH_PUBLIC_KEY_SIZE],
        chain_length: u32,
        until: u32,
        skipped: &mut Vec<SkippedKeyMaterial>,
    ) -> Result<()> {
        let chain = self
            .receiving_chain
            .take()
            .ok_or_else(|| PqRatchetError::crypto("No receiving chain to skip"))?;

        if until.saturating_sub(chain.index()) > MAX_SKIP {
            self.receiving_chain = Some(chain);
            return Err(PqRatchetError::skip_window(format!(
                "would skip more than {} message keys",
                MAX_SKIP
            )));
        }

        let mut chain = chain;
        while chain.index() < until {
            let message_number = chain.index();
            let (new_chain, key) = chain.advance()?;
            skipped.push(SkippedKeyMaterial {
                ephemeral_public_key: ephemeral,
                chain_length,
                message_number,
                key,
            });
            chain = new_chain;
        }

        self.receiving_chain = Some(chain);
        Ok(())
    }

    /// Message number the next sent message will carry.
    pub fn sending_message_number(&self) -> u32 {
        self.sending_chain.as_ref().map(|c| c.index()).unwrap_or(0)
    }

    /// Message number the next in-order received message should carry.
    pub fn receiving_message_number(&self) -> u32 {
        self.receiving_chain
            .as_ref()
            .map(|c| c.index())
            .unwrap_or(0)
    }

    /// Completed ratchet steps on the sending side.
    pub fn sending_chain_length(&self) -> u32 {
        self.sending_chain_length
    }

    /// Completed ratchet steps on the receiving side.
    pub fn receiving_chain_length(&self) -> u32 {
        self.receiving_chain_length
    }

    /// Whether this state can encrypt yet.
    pub fn can_send(&self) -> bool {
        self.sending_chain.is_some()
    }
}
