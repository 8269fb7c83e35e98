//! HTTP handlers for the relay API.
//!
//! Every mutating endpoint returns the record's resulting state plus a stable
//! error code on failure. Error payloads never carry key material; messages
//! come from the library's error kinds, which are constructed without any.

use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pqratchet::error::PqRatchetError;
use pqratchet::exchange::{ExchangeType, PublicKeyBundle};
use pqratchet::negotiation::{AlgorithmSuite, CapabilitySet};
use pqratchet::ratchet::keys::MESSAGE_KEY_SIZE;
use pqratchet::ratchet::{MessageKey, RatchetState, SKIPPED_KEY_TTL_SECS};
use pqratchet::sync::SyncMetadata;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

/// API error wrapper translating library errors to HTTP responses.
pub struct ApiError(PqRatchetError);

impl From<PqRatchetError> for ApiError {
    fn from(err: PqRatchetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PqRatchetError::RatchetNotInitialized(_) => StatusCode::NOT_FOUND,
            PqRatchetError::AlreadyInitialized(_) => StatusCode::CONFLICT,
            PqRatchetError::AuthenticationFailure => StatusCode::BAD_REQUEST,
            PqRatchetError::SkipWindowExceeded(_) => StatusCode::BAD_REQUEST,
            PqRatchetError::CorruptedState(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PqRatchetError::ExchangeNotFound(_) => StatusCode::NOT_FOUND,
            PqRatchetError::ExchangeUnauthorized(_) => StatusCode::FORBIDDEN,
            PqRatchetError::ExchangeInvalidState(_) => StatusCode::CONFLICT,
            PqRatchetError::ExchangeExpired(_) => StatusCode::GONE,
            PqRatchetError::DeviceOwnershipMismatch(_) => StatusCode::FORBIDDEN,
            PqRatchetError::PackageNotFound(_) => StatusCode::NOT_FOUND,
            PqRatchetError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PqRatchetError::Validation(_) => StatusCode::BAD_REQUEST,
            PqRatchetError::Config(_)
            | PqRatchetError::Crypto(_)
            | PqRatchetError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Ratchet state
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutStateRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub ratchet_state: RatchetState,
}

#[instrument(skip(state, request))]
pub async fn put_ratchet_state(
    State(state): State<AppState>,
    Json(request): Json<PutStateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.put_state(
        &request.conversation_id,
        &request.user_id,
        &request.ratchet_state,
    )?;
    Ok(Json(json!({
        "ratchetStateId": format!("{}:{}", request.conversation_id, request.user_id),
    })))
}

#[instrument(skip(state))]
pub async fn get_ratchet_state(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let ratchet_state = state
        .store
        .get_state(&conversation_id, &user_id)?
        .ok_or_else(|| {
            PqRatchetError::not_initialized(format!("{}:{}", conversation_id, user_id))
        })?;
    Ok(Json(json!({ "ratchetState": ratchet_state })))
}

#[instrument(skip(state))]
pub async fn delete_ratchet_state(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state.store.delete_state(&conversation_id, &user_id)?;
    if !deleted {
        return Err(PqRatchetError::not_initialized(format!(
            "{}:{}",
            conversation_id, user_id
        ))
        .into());
    }
    Ok(Json(json!({ "deleted": true })))
}

// ============================================================================
// Skipped keys
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutSkippedKeyRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub message_key_id: String,
    /// Base64-encoded 32-byte message key (sealed by the store at rest)
    pub message_key: String,
    pub chain_length: u32,
    pub message_number: u32,
}

#[instrument(skip(state, request))]
pub async fn put_skipped_key(
    State(state): State<AppState>,
    Json(request): Json<PutSkippedKeyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let key_bytes = BASE64
        .decode(&request.message_key)
        .map_err(|_| PqRatchetError::validation("messageKey is not valid base64"))?;
    let key_bytes: [u8; MESSAGE_KEY_SIZE] = key_bytes
        .try_into()
        .map_err(|_| PqRatchetError::validation("messageKey must be 32 bytes"))?;

    let expires_at = chrono::Utc::now().timestamp().max(0) as u64 + SKIPPED_KEY_TTL_SECS;
    state.store.put_skipped_key(
        &request.conversation_id,
        &request.user_id,
        &request.message_key_id,
        &MessageKey::from_bytes(key_bytes),
        request.chain_length,
        request.message_number,
        expires_at,
    )?;
    Ok(Json(json!({
        "messageKeyId": request.message_key_id,
        "expiresAt": expires_at,
    })))
}

#[instrument(skip(state))]
pub async fn get_skipped_key(
    State(state): State<AppState>,
    Path((conversation_id, user_id, message_key_id)): Path<(String, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let key = state
        .store
        .get_skipped_key(&conversation_id, &user_id, &message_key_id)?
        .ok_or_else(|| PqRatchetError::not_initialized(message_key_id.clone()))?;
    Ok(Json(json!({
        "messageKeyId": message_key_id,
        "messageKey": BASE64.encode(key.as_bytes()),
    })))
}

#[instrument(skip(state))]
pub async fn delete_skipped_key(
    State(state): State<AppState>,
    Path((conversation_id, user_id, message_key_id)): Path<(String, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state
        .store
        .delete_skipped_key(&conversation_id, &user_id, &message_key_id)?;
    Ok(Json(json!({ "deleted": deleted })))
}

// ============================================================================
// Stats, cleanup, health
// ============================================================================

#[instrument(skip(state))]
pub async fn ratchet_stats(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.store.statistics(&conversation_id, &user_id)?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| {
        PqRatchetError::serialization(e.to_string())
    })?))
}

#[instrument(skip(state))]
pub async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let removed_skipped_keys = state.store.cleanup_expired()?;
    let removed_exchanges = state.exchanges.cleanup_expired();
    let removed_packages = state.sync.cleanup_expired();
    Ok(Json(json!({
        "removedSkippedKeys": removed_skipped_keys,
        "removedExchanges": removed_exchanges,
        "removedPackages": removed_packages,
    })))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "pqratchet-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================================
// Key exchange
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub initiator_id: String,
    pub recipient_id: String,
    pub conversation_id: String,
    pub exchange_type: ExchangeType,
    pub public_key_bundle: PublicKeyBundle,
    pub encrypted_key_data: String,
}

#[instrument(skip(state, request))]
pub async fn initiate_exchange(
    State(state): State<AppState>,
    Json(request): Json<InitiateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let exchange = state.exchanges.initiate(
        &request.initiator_id,
        &request.recipient_id,
        &request.conversation_id,
        request.exchange_type,
        request.public_key_bundle,
        request.encrypted_key_data,
    )?;
    Ok(Json(json!({
        "exchangeId": exchange.id,
        "status": exchange.status,
        "expiresAt": exchange.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub exchange_id: String,
    pub recipient_id: String,
    pub response_data: String,
    pub public_key_bundle: PublicKeyBundle,
}

#[instrument(skip(state, request))]
pub async fn respond_exchange(
    State(state): State<AppState>,
    Json(request): Json<RespondRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let exchange = state.exchanges.respond(
        &request.exchange_id,
        &request.recipient_id,
        request.response_data,
        request.public_key_bundle,
    )?;
    Ok(Json(json!({
        "exchangeId": exchange.id,
        "status": exchange.status,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub exchange_id: String,
    pub user_id: String,
    #[serde(default)]
    pub confirmation_signature: Option<String>,
}

#[instrument(skip(state, request))]
pub async fn complete_exchange(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let exchange = state.exchanges.complete(
        &request.exchange_id,
        &request.user_id,
        request.confirmation_signature,
    )?;
    Ok(Json(json!({
        "exchangeId": exchange.id,
        "status": exchange.status,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuery {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[instrument(skip(state))]
pub async fn pending_exchanges(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Json<serde_json::Value> {
    let exchanges = state.exchanges.list_pending(&query.user_id, query.limit);
    Json(json!({ "exchanges": exchanges }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerQuery {
    pub user_id: String,
}

#[instrument(skip(state))]
pub async fn get_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
    Query(query): Query<CallerQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let data = state.exchanges.get_data(&exchange_id, &query.user_id)?;
    Ok(Json(serde_json::to_value(data).map_err(|e| {
        PqRatchetError::serialization(e.to_string())
    })?))
}

// ============================================================================
// Multi-device sync
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub user_id: String,
    pub device_id: String,
}

#[instrument(skip(state, request))]
pub async fn register_device(
    State(state): State<AppState>,
    Json(request): Json<RegisterDeviceRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .devices
        .register_device(&request.user_id, &request.device_id)?;
    Ok(Json(json!({ "deviceId": request.device_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSyncRequest {
    pub user_id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    pub encrypted_key_package: String,
    pub metadata: SyncMetadata,
}

#[instrument(skip(state, request))]
pub async fn create_sync_package(
    State(state): State<AppState>,
    Json(request): Json<CreateSyncRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let package = state.sync.create_package(
        &request.user_id,
        &request.from_device_id,
        &request.to_device_id,
        request.encrypted_key_package,
        request.metadata,
    )?;
    Ok(Json(json!({
        "packageId": package.package_id,
        "status": package.status,
    })))
}

#[instrument(skip(state))]
pub async fn pending_sync_packages(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<CallerQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let packages = state.sync.list_pending(&device_id, &query.user_id)?;
    Ok(Json(json!({ "packages": packages })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkProcessedRequest {
    pub user_id: String,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[instrument(skip(state, request))]
pub async fn mark_sync_processed(
    State(state): State<AppState>,
    Path(package_id): Path<String>,
    Json(request): Json<MarkProcessedRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let package = state.sync.mark_processed(
        &package_id,
        &request.user_id,
        request.success,
        request.error_message,
    )?;
    Ok(Json(json!({
        "packageId": package.package_id,
        "status": package.status,
    })))
}

// ============================================================================
// Algorithm negotiation
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordNegotiationRequest {
    pub conversation_id: String,
    pub initiator_id: String,
    pub responder_id: String,
    pub suite: AlgorithmSuite,
    pub security_level: u32,
    pub quantum_resistant: bool,
    pub initiator_capabilities: CapabilitySet,
    pub responder_capabilities: CapabilitySet,
}

#[instrument(skip(state, request))]
pub async fn record_negotiation(
    State(state): State<AppState>,
    Json(request): Json<RecordNegotiationRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let negotiation_id = state.ledger.record(
        &request.conversation_id,
        &request.initiator_id,
        &request.responder_id,
        request.suite,
        request.security_level,
        request.quantum_resistant,
        request.initiator_capabilities,
        request.responder_capabilities,
    )?;
    Ok(Json(json!({ "negotiationId": negotiation_id })))
}

#[instrument(skip(state))]
pub async fn encryption_status(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<serde_json::Value> {
    match state.ledger.get_active(&conversation_id) {
        Some(negotiation) => Json(json!({
            "conversationId": conversation_id,
            "encrypted": true,
            "negotiation": negotiation,
        })),
        None => Json(json!({
            "conversationId": conversation_id,
            "encrypted": false,
        })),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeframeQuery {
    #[serde(default = "default_timeframe")]
    pub timeframe_secs: u64,
}

fn default_timeframe() -> u64 {
    24 * 60 * 60
}

#[instrument(skip(state))]
pub async fn exchange_stats(
    State(state): State<AppState>,
    Query(query): Query<TimeframeQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let exchange_stats = state.exchanges.stats(query.timeframe_secs);
    let negotiation_stats = state.ledger.stats(query.timeframe_secs);
    Ok(Json(json!({
        "exchanges": exchange_stats,
        "negotiations": negotiation_stats,
    })))
}
