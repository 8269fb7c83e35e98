//! State machine and relay for two-party key exchanges.

use crate::error::{PqRatchetError, Result};
use crate::exchange::{
    ExchangeData, ExchangeStatus, ExchangeType, KeyExchange, PublicKeyBundle, EXCHANGE_TTL_SECS,
};
use crate::negotiation::{AlgorithmNegotiationLedger, AlgorithmSuite, CapabilitySet};
use crate::validation::Validator;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Aggregate exchange statistics over a timeframe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeStats {
    /// Exchanges created within the timeframe
    pub total: u64,
    /// Counts per status
    pub by_status: HashMap<String, u64>,
    /// Counts per exchange type
    pub by_type: HashMap<String, u64>,
    /// Completed / total, 0.0 when no exchanges were created
    pub success_rate: f64,
}

/// Generates a relay record id: `{timestamp}-{hex(random16)}`.
pub(crate) fn generate_id() -> String {
    let now = chrono::Utc::now().timestamp();
    let random_bytes: [u8; 16] = rand::thread_rng().gen();
    format!("{}-{}", now, hex::encode(random_bytes))
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Relay and state machine for hybrid key exchanges.
pub struct KeyExchangeCoordinator {
    exchanges: RwLock<HashMap<String, KeyExchange>>,
    ledger: Arc<AlgorithmNegotiationLedger>,
}

impl KeyExchangeCoordinator {
    /// Creates a coordinator that records completed setups in `ledger`.
    pub fn new(ledger: Arc<AlgorithmNegotiationLedger>) -> Self {
        Self {
            exchanges: RwLock::new(HashMap::new()),
            ledger,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, KeyExchange>> {
        self.exchanges.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, KeyExchange>> {
        self.exchanges.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks an exchange expired in place when its TTL has elapsed.
    fn settle_expiry(exchange: &mut KeyExchange, now: u64) {
        if exchange.status != ExchangeStatus::Expired && exchange.is_expired(now) {
            exchange.status = ExchangeStatus::Expired;
        }
    }

    /// Opens a new exchange addressed to `recipient_id`.
    pub fn initiate(
        &self,
        initiator_id: &str,
        recipient_id: &str,
        conversation_id: &str,
        exchange_type: ExchangeType,
        public_key_bundle: PublicKeyBundle,
        encrypted_key_data: String,
    ) -> Result<KeyExchange> {
        Validator::validate_identifier("initiatorId", initiator_id)?;
        Validator::validate_identifier("recipientId", recipient_id)?;
        Validator::validate_identifier("conversationId", conversation_id)?;
        Validator::validate_relay_payload("encryptedKeyData", encrypted_key_data.as_bytes())?;
        if initiator_id == recipient_id {
            return Err(PqRatchetError::validation(
                "initiator and recipient must differ",
            ));
        }

        let now = now_secs();
        let exchange = KeyExchange {
            id: generate_id(),
            initiator_id: initiator_id.to_string(),
            recipient_id: recipient_id.to_string(),
            conversation_id: conversation_id.to_string(),
            exchange_type,
            status: ExchangeStatus::Pending,
            public_key_bundle,
            recipient_bundle: None,
            encrypted_key_data,
            response_data: None,
            created_at: now,
            expires_at: now + EXCHANGE_TTL_SECS,
            completed_at: None,
        };

        self.write().insert(exchange.id.clone(), exchange.clone());
        info!(
            exchange_id = %exchange.id,
            exchange_type = %exchange.exchange_type,
            "initiated key exchange"
        );
        Ok(exchange)
    }

    /// Records the recipient's answer, moving pending -> responded.
    pub fn respond(
        &self,
        exchange_id: &str,
        recipient_id: &str,
        response_data: String,
        public_key_bundle: PublicKeyBundle,
    ) -> Result<KeyExchange> {
        Validator::validate_relay_payload("responseData", response_data.as_bytes())?;

        let mut exchanges = self.write();
        let exchange = exchanges
            .get_mut(exchange_id)
            .ok_or_else(|| PqRatchetError::ExchangeNotFound(exchange_id.to_string()))?;

        Self::settle_expiry(exchange, now_secs());
        if exchange.status == ExchangeStatus::Expired {
            return Err(PqRatchetError::ExchangeExpired(exchange_id.to_string()));
        }
        if exchange.recipient_id != recipient_id {
            return Err(PqRatchetError::ExchangeUnauthorized(
                "caller is not the designated recipient".to_string(),
            ));
        }
        if exchange.status != ExchangeStatus::Pending {
            return Err(PqRatchetError::ExchangeInvalidState(format!(
                "cannot respond while {}",
                exchange.status
            )));
        }

        exchange.status = ExchangeStatus::Responded;
        exchange.response_data = Some(response_data);
        exchange.recipient_bundle = Some(public_key_bundle);

        debug!(exchange_id, "exchange responded");
        Ok(exchange.clone())
    }

    /// Confirms a responded exchange, moving responded -> completed.
    ///
    /// Completing an `initial_setup` exchange records the negotiated
    /// algorithm suite for the conversation.
    pub fn complete(
        &self,
        exchange_id: &str,
        user_id: &str,
        _confirmation_signature: Option<String>,
    ) -> Result<KeyExchange> {
        let completed = {
            let mut exchanges = self.write();
            let exchange = exchanges
                .get_mut(exchange_id)
                .ok_or_else(|| PqRatchetError::ExchangeNotFound(exchange_id.to_string()))?;

            Self::settle_expiry(exchange, now_secs());
            if exchange.status == ExchangeStatus::Expired {
                return Err(PqRatchetError::ExchangeExpired(exchange_id.to_string()));
            }
            if !exchange.involves(user_id) {
                return Err(PqRatchetError::ExchangeUnauthorized(
                    "caller is not a party to this exchange".to_string(),
                ));
            }
            if exchange.status != ExchangeStatus::Responded {
                return Err(PqRatchetError::ExchangeInvalidState(format!(
                    "cannot complete while {}",
                    exchange.status
                )));
            }

            exchange.status = ExchangeStatus::Completed;
            exchange.completed_at = Some(now_secs());
            exchange.clone()
        };

        if completed.exchange_type == ExchangeType::InitialSetup {
            self.record_negotiation(&completed)?;
        }

        info!(exchange_id, "exchange completed");
        Ok(completed)
    }

    fn record_negotiation(&self, exchange: &KeyExchange) -> Result<()> {
        let initiator = &exchange.public_key_bundle;
        let Some(recipient) = exchange.recipient_bundle.as_ref() else {
            warn!(
                exchange_id = %exchange.id,
                "completed setup without a recipient bundle; skipping negotiation record"
            );
            return Ok(());
        };

        let quantum_resistant = initiator.quantum_resistant && recipient.quantum_resistant;
        let suite = AlgorithmSuite::select(quantum_resistant);
        let security_level = initiator.security_level.min(recipient.security_level);

        self.ledger.record(
            &exchange.conversation_id,
            &exchange.initiator_id,
            &exchange.recipient_id,
            suite,
            security_level,
            quantum_resistant,
            CapabilitySet::from_bundle(initiator),
            CapabilitySet::from_bundle(recipient),
        )?;
        Ok(())
    }

    /// Lists pending exchanges addressed to `user_id`, oldest first.
    pub fn list_pending(&self, user_id: &str, limit: usize) -> Vec<KeyExchange> {
        let now = now_secs();
        let exchanges = self.read();
        let mut pending: Vec<KeyExchange> = exchanges
            .values()
            .filter(|e| {
                e.recipient_id == user_id
                    && e.status == ExchangeStatus::Pending
                    && !e.is_expired(now)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        pending
    }

    /// Returns the payload half the caller is entitled to decrypt.
    pub fn get_data(&self, exchange_id: &str, user_id: &str) -> Result<ExchangeData> {
        let mut exchanges = self.write();
        let exchange = exchanges
            .get_mut(exchange_id)
            .ok_or_else(|| PqRatchetError::ExchangeNotFound(exchange_id.to_string()))?;

        Self::settle_expiry(exchange, now_secs());
        if !exchange.involves(user_id) {
            return Err(PqRatchetError::ExchangeUnauthorized(
                "caller is not a party to this exchange".to_string(),
            ));
        }

        let is_initiator = exchange.initiator_id == user_id;
        let (peer_bundle, encrypted_payload) = if is_initiator {
            (
                exchange.recipient_bundle.clone(),
                exchange.response_data.clone(),
            )
        } else {
            (
                Some(exchange.public_key_bundle.clone()),
                Some(exchange.encrypted_key_data.clone()),
            )
        };

        Ok(ExchangeData {
            exchange_id: exchange.id.clone(),
            status: exchange.status,
            exchange_type: exchange.exchange_type,
            peer_bundle,
            encrypted_payload,
        })
    }

    /// Removes expired exchanges, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = now_secs();
        let mut exchanges = self.write();
        let before = exchanges.len();
        exchanges.retain(|_, e| !e.is_expired(now));
        let removed = before - exchanges.len();
        if removed > 0 {
            info!(removed, "cleaned up expired key exchanges");
        }
        removed
    }

    /// Aggregates statistics over exchanges created in the last
    /// `timeframe_secs` seconds.
    pub fn stats(&self, timeframe_secs: u64) -> ExchangeStats {
        let now = now_secs();
        let since = now.saturating_sub(timeframe_secs);
        let exchanges = self.read();

        let mut total = 0u64;
        let mut completed = 0u64;
        let mut by_status: HashMap<String, u64> = HashMap::new();
        let mut by_type: HashMap<String, u64> = HashMap::new();

        for exchange in exchanges.values().filter(|e| e.created_at >= since) {
            total += 1;
            let status = if exchange.is_expired(now) {
                ExchangeStatus::Expired
            } else {
                exchange.status
            };
            if status == ExchangeStatus::Completed {
                completed += 1;
            }
            *by_status.entry(status.to_string()).or_default() += 1;
            *by_type.entry(exchange.exchange_type.to_string()).or_default() += 1;
        }

        ExchangeStats {
            total,
            by_status,
            by_type,
            success_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(quantum_resistant: bool) -> PublicKeyBundle {
        PublicKeyBundle {
            classical_public_key: "Y2xhc3NpY2Fs".into(),
            pqc_public_key: "cHFj".into(),
            signature: None,
            security_level: 5,
            quantum_resistant,
        }
    }

    fn coordinator() -> KeyExchangeCoordinator {
        KeyExchangeCoordinator::new(Arc::new(AlgorithmNegotiationLedger::new()))
    }

    fn initiate(coord: &KeyExchangeCoordinator, exchange_type: ExchangeType) -> KeyExchange {
        coord
            .initiate(
                "alice",
                "bob",
                "conv-1",
                exchange_type,
                bundle(true),
                "ZW5jcnlwdGVk".into(),
            )
            .unwrap()
    }

    #[test]
    fn test_full_lifecycle() {
        let coord = coordinator();

        let exchange = initiate(&coord, ExchangeType::InitialSetup);
        assert_eq!(exchange.status, ExchangeStatus::Pending);

        let responded = coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();
        assert_eq!(responded.status, ExchangeStatus::Responded);

        let completed = coord.complete(&exchange.id, "alice", None).unwrap();
        assert_eq!(completed.status, ExchangeStatus::Completed);
    }

    #[test]
    fn test_initial_setup_completion_records_negotiation() {
        let ledger = Arc::new(AlgorithmNegotiationLedger::new());
        let coord = KeyExchangeCoordinator::new(ledger.clone());

        let exchange = initiate(&coord, ExchangeType::InitialSetup);
        coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();
        coord.complete(&exchange.id, "bob", None).unwrap();

        let active = ledger.get_active("conv-1").unwrap();
        assert!(active.quantum_resistant);
        assert_eq!(active.achieved_security_level, 5);
    }

    #[test]
    fn test_ratchet_update_does_not_record_negotiation() {
        let ledger = Arc::new(AlgorithmNegotiationLedger::new());
        let coord = KeyExchangeCoordinator::new(ledger.clone());

        let exchange = initiate(&coord, ExchangeType::RatchetUpdate);
        coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();
        coord.complete(&exchange.id, "alice", None).unwrap();

        assert!(ledger.get_active("conv-1").is_none());
    }

    #[test]
    fn test_respond_twice_is_invalid_state() {
        let coord = coordinator();
        let exchange = initiate(&coord, ExchangeType::InitialSetup);

        coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();
        let err = coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap_err();
        assert!(matches!(err, PqRatchetError::ExchangeInvalidState(_)));
    }

    #[test]
    fn test_respond_requires_designated_recipient() {
        let coord = coordinator();
        let exchange = initiate(&coord, ExchangeType::InitialSetup);

        let err = coord
            .respond(&exchange.id, "mallory", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap_err();
        assert!(matches!(err, PqRatchetError::ExchangeUnauthorized(_)));
    }

    #[test]
    fn test_complete_requires_responded_state() {
        let coord = coordinator();
        let exchange = initiate(&coord, ExchangeType::InitialSetup);

        let err = coord.complete(&exchange.id, "alice", None).unwrap_err();
        assert!(matches!(err, PqRatchetError::ExchangeInvalidState(_)));
    }

    #[test]
    fn test_complete_rejects_outsiders() {
        let coord = coordinator();
        let exchange = initiate(&coord, ExchangeType::InitialSetup);
        coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();

        let err = coord.complete(&exchange.id, "mallory", None).unwrap_err();
        assert!(matches!(err, PqRatchetError::ExchangeUnauthorized(_)));
    }

    #[test]
    fn test_unknown_exchange_is_not_found() {
        let coord = coordinator();
        assert!(matches!(
            coord.complete("nope", "alice", None).unwrap_err(),
            PqRatchetError::ExchangeNotFound(_)
        ));
    }

    #[test]
    fn test_expired_exchange_is_reported_on_access() {
        let coord = coordinator();
        let exchange = initiate(&coord, ExchangeType::InitialSetup);

        // Force the TTL into the past.
        coord
            .write()
            .get_mut(&exchange.id)
            .unwrap()
            .expires_at = 1;

        let err = coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap_err();
        assert!(matches!(err, PqRatchetError::ExchangeExpired(_)));

        let data = coord.get_data(&exchange.id, "alice").unwrap();
        assert_eq!(data.status, ExchangeStatus::Expired);

        assert_eq!(coord.cleanup_expired(), 1);
        assert_eq!(coord.cleanup_expired(), 0);
    }

    #[test]
    fn test_payload_halving() {
        let coord = coordinator();
        let exchange = initiate(&coord, ExchangeType::InitialSetup);
        coord
            .respond(&exchange.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();

        // The recipient sees the initiator's payload.
        let bob_view = coord.get_data(&exchange.id, "bob").unwrap();
        assert_eq!(bob_view.encrypted_payload.as_deref(), Some("ZW5jcnlwdGVk"));

        // The initiator sees the response payload.
        let alice_view = coord.get_data(&exchange.id, "alice").unwrap();
        assert_eq!(alice_view.encrypted_payload.as_deref(), Some("cmVzcG9uc2U="));

        assert!(matches!(
            coord.get_data(&exchange.id, "mallory").unwrap_err(),
            PqRatchetError::ExchangeUnauthorized(_)
        ));
    }

    #[test]
    fn test_list_pending_filters_and_limits() {
        let coord = coordinator();
        let first = initiate(&coord, ExchangeType::InitialSetup);
        let _second = initiate(&coord, ExchangeType::RatchetUpdate);

        coord
            .respond(&first.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();

        let pending = coord.list_pending("bob", 10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].exchange_type, ExchangeType::RatchetUpdate);

        assert!(coord.list_pending("alice", 10).is_empty());
        assert!(coord.list_pending("bob", 0).is_empty());
    }

    #[test]
    fn test_stats_counts_and_success_rate() {
        let coord = coordinator();
        let first = initiate(&coord, ExchangeType::InitialSetup);
        let _second = initiate(&coord, ExchangeType::PqcUpgrade);

        coord
            .respond(&first.id, "bob", "cmVzcG9uc2U=".into(), bundle(true))
            .unwrap();
        coord.complete(&first.id, "alice", None).unwrap();

        let stats = coord.stats(3600);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&1));
        assert_eq!(stats.by_type.get("pqc_upgrade"), Some(&1));
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_initiate_rejects_self_exchange() {
        let coord = coordinator();
        let err = coord
            .initiate(
                "alice",
                "alice",
                "conv-1",
                ExchangeType::InitialSetup,
                bundle(true),
                "ZW5jcnlwdGVk".into(),
            )
            .unwrap_err();
        assert!(matches!(err, PqRatchetError::Validation(_)));
    }
}
