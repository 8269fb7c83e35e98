//! Shared relay application state.

use pqratchet::error::Result;
use pqratchet::exchange::KeyExchangeCoordinator;
use pqratchet::negotiation::AlgorithmNegotiationLedger;
use pqratchet::store::{KeyMaterialStore, MasterKeyProvider, RocksDbBackend};
use pqratchet::sync::{DeviceDirectory, MultiDeviceSyncCoordinator};
use std::path::Path;
use std::sync::Arc;

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<KeyMaterialStore>,
    pub exchanges: Arc<KeyExchangeCoordinator>,
    pub sync: Arc<MultiDeviceSyncCoordinator>,
    pub devices: Arc<DeviceDirectory>,
    pub ledger: Arc<AlgorithmNegotiationLedger>,
}

impl AppState {
    /// Builds the full state over a RocksDB keystore at `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>, master_key: &dyn MasterKeyProvider) -> Result<Self> {
        let backend = RocksDbBackend::open(data_dir.as_ref().join("keystore"))?;
        let store = Arc::new(KeyMaterialStore::new(Box::new(backend), master_key)?);

        let ledger = Arc::new(AlgorithmNegotiationLedger::new());
        let exchanges = Arc::new(KeyExchangeCoordinator::new(ledger.clone()));
        let devices = Arc::new(DeviceDirectory::new());
        let sync = Arc::new(MultiDeviceSyncCoordinator::new(devices.clone()));

        Ok(Self {
            store,
            exchanges,
            sync,
            devices,
            ledger,
        })
    }
}
