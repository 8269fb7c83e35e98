//! PQRatchet Relay Server
//!
//! Coordinates hybrid key exchanges between two parties, relays encrypted key
//! packages between a single user's devices, records algorithm negotiations,
//! and persists encrypted-at-rest ratchet state for roaming clients. The
//! relay is zero-knowledge for message plaintext: every payload it touches is
//! ciphertext or public key material.
//!
//! ## Usage
//!
//! ```bash
//! # Master key is mandatory (64 hex characters = 32 bytes)
//! PQRATCHET_MASTER_KEY=$(openssl rand -hex 32) pqratchet-relay
//!
//! # Run on a custom address
//! PQRATCHET_MASTER_KEY=... pqratchet-relay --bind 0.0.0.0:8080
//!
//! # Custom data directory
//! PQRATCHET_MASTER_KEY=... pqratchet-relay --data-dir /var/lib/pqratchet
//!
//! # Development only: random ephemeral master key (state is lost on restart)
//! pqratchet-relay --ephemeral-key
//!
//! # Enable debug logging
//! RUST_LOG=debug pqratchet-relay
//! ```

mod handlers;
mod state;

use axum::routing::{get, post, put};
use axum::Router;
use pqratchet::store::{EnvMasterKey, MasterKeyProvider, StaticMasterKey};
use rand::RngCore;
use state::AppState;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the at-rest master key (64 hex chars).
const MASTER_KEY_ENV: &str = "PQRATCHET_MASTER_KEY";

/// Default data directory name.
const DATA_DIR: &str = "pqratchet_relay_data";

/// Interval between expiry sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn arg_value(name: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == name {
            return args.next();
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().any(|arg| arg == name)
}

/// Runs the hourly expiry sweep across store and coordinators.
fn spawn_cleanup_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            match state.store.cleanup_expired() {
                Ok(removed) => {
                    let exchanges = state.exchanges.cleanup_expired();
                    let packages = state.sync.cleanup_expired();
                    info!(
                        skipped_keys = removed,
                        exchanges, packages, "expiry sweep complete"
                    );
                }
                Err(e) => error!("expiry sweep failed: {}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "pqratchet_relay=info".into()),
        )
        .init();

    let bind_addr = arg_value("--bind").unwrap_or_else(|| "127.0.0.1:3001".to_string());
    let data_dir = arg_value("--data-dir").unwrap_or_else(|| DATA_DIR.to_string());

    // No hardcoded fallback: a missing master key refuses to start unless the
    // operator explicitly opted into an ephemeral development key.
    let master_key: Box<dyn MasterKeyProvider> = if has_flag("--ephemeral-key") {
        warn!("using a RANDOM ephemeral master key; stored ratchet state will be unreadable after restart");
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Box::new(StaticMasterKey::from_bytes(key))
    } else {
        Box::new(EnvMasterKey::new(MASTER_KEY_ENV))
    };

    let app_state = match AppState::open(&data_dir, master_key.as_ref()) {
        Ok(state) => state,
        Err(e) => {
            error!("failed to start relay: {}", e);
            std::process::exit(1);
        }
    };

    spawn_cleanup_task(app_state.clone());

    let ratchet_router = Router::new()
        .route("/state", put(handlers::put_ratchet_state))
        .route(
            "/state/:conversation_id/:user_id",
            get(handlers::get_ratchet_state).delete(handlers::delete_ratchet_state),
        )
        .route("/skipped-keys", put(handlers::put_skipped_key))
        .route(
            "/skipped-keys/:conversation_id/:user_id/:message_key_id",
            get(handlers::get_skipped_key).delete(handlers::delete_skipped_key),
        )
        .route(
            "/stats/:conversation_id/:user_id",
            get(handlers::ratchet_stats),
        )
        .route("/cleanup", post(handlers::cleanup))
        .route("/health", get(handlers::health));

    let exchange_router = Router::new()
        .route("/initiate", post(handlers::initiate_exchange))
        .route("/respond", post(handlers::respond_exchange))
        .route("/complete", post(handlers::complete_exchange))
        .route("/pending", get(handlers::pending_exchanges))
        .route("/stats", get(handlers::exchange_stats))
        .route("/:exchange_id", get(handlers::get_exchange));

    let sync_router = Router::new()
        .route("/sync", post(handlers::create_sync_package))
        .route("/devices", post(handlers::register_device))
        .route("/pending/:device_id", get(handlers::pending_sync_packages))
        .route(
            "/processed/:package_id",
            post(handlers::mark_sync_processed),
        );

    let app = Router::new()
        .nest("/ratchet", ratchet_router)
        .nest("/key-exchange", exchange_router)
        .nest("/multi-device", sync_router)
        .route("/algorithm-negotiation", post(handlers::record_negotiation))
        .route(
            "/conversation/:conversation_id/encryption-status",
            get(handlers::encryption_status),
        )
        .with_state(app_state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("PQRatchet Relay Server running on http://{}", bind_addr);
    info!("");
    info!("Ratchet State Endpoints:");
    info!("  PUT    /ratchet/state                     - Store ratchet state");
    info!("  GET    /ratchet/state/:conv/:user         - Fetch ratchet state");
    info!("  DELETE /ratchet/state/:conv/:user         - Delete ratchet state");
    info!("  PUT    /ratchet/skipped-keys              - Retain a skipped key");
    info!("  GET    /ratchet/skipped-keys/:c/:u/:id    - Fetch a skipped key");
    info!("  DELETE /ratchet/skipped-keys/:c/:u/:id    - Drop a skipped key");
    info!("  GET    /ratchet/stats/:conv/:user         - Session counters");
    info!("  POST   /ratchet/cleanup                   - Run expiry sweep now");
    info!("  GET    /ratchet/health                    - Health check");
    info!("");
    info!("Key Exchange Endpoints:");
    info!("  POST   /key-exchange/initiate             - Open an exchange");
    info!("  POST   /key-exchange/respond              - Answer an exchange");
    info!("  POST   /key-exchange/complete             - Confirm an exchange");
    info!("  GET    /key-exchange/pending?userId=      - List pending exchanges");
    info!("  GET    /key-exchange/stats                - Exchange statistics");
    info!("  GET    /key-exchange/:id?userId=          - Entitled payload half");
    info!("");
    info!("Multi-Device Endpoints:");
    info!("  POST   /multi-device/devices              - Register a device");
    info!("  POST   /multi-device/sync                 - Create a sync package");
    info!("  GET    /multi-device/pending/:device      - List pending packages");
    info!("  POST   /multi-device/processed/:id        - Report processing outcome");
    info!("");
    info!("Negotiation Endpoints:");
    info!("  POST   /algorithm-negotiation             - Record a negotiation");
    info!("  GET    /conversation/:id/encryption-status - Active suite");

    axum::serve(listener, app).await?;

    Ok(())
}
