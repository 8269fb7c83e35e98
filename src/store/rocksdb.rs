//! RocksDB storage backend.
//!
//! Sealed key-material records are stored in two column families, one per
//! logical table. Composite `{conversation}:{user}` key prefixes enable
//! efficient per-session iteration via RocksDB prefix seeks.

use crate::error::{PqRatchetError, Result};
use crate::store::{StoreBackend, Table};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Column family for sealed ratchet states.
const CF_RATCHET_STATES: &str = "ratchet_states";

/// Column family for framed skipped keys.
const CF_SKIPPED_KEYS: &str = "skipped_keys";

/// Configuration for RocksDB storage.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Maximum number of open files.
    pub max_open_files: i32,
    /// Number of log files to keep.
    pub keep_log_file_num: usize,
    /// Maximum WAL size in bytes.
    pub max_wal_size: u64,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Maximum number of write buffers.
    pub max_write_buffer_number: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_open_files: 128,
            keep_log_file_num: 2,
            max_wal_size: 32 * 1024 * 1024,      // 32MB
            write_buffer_size: 32 * 1024 * 1024, // 32MB
            max_write_buffer_number: 2,
        }
    }
}

impl RocksDbConfig {
    fn build_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_keep_log_file_num(self.keep_log_file_num);
        opts.set_max_total_wal_size(self.max_wal_size);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_max_write_buffer_number(self.max_write_buffer_number);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }
}

/// RocksDB-backed store backend.
pub struct RocksDbBackend {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksDbBackend {
    /// Opens (or creates) the database at `db_path` with default tuning.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(db_path, &RocksDbConfig::default())
    }

    /// Opens the database with explicit tuning.
    pub fn open_with_config(db_path: impl AsRef<Path>, config: &RocksDbConfig) -> Result<Self> {
        let opts = config.build_options();
        let cf_opts = Options::default();

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RATCHET_STATES, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_SKIPPED_KEYS, cf_opts),
        ];

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &opts,
            db_path.as_ref(),
            cf_descriptors,
        )
        .map_err(|e| PqRatchetError::storage(format!("Failed to open RocksDB: {}", e)))?;

        info!("Opened key material RocksDB at {:?}", db_path.as_ref());

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, table: Table) -> Result<Arc<BoundColumnFamily<'_>>> {
        let name = match table {
            Table::RatchetStates => CF_RATCHET_STATES,
            Table::SkippedKeys => CF_SKIPPED_KEYS,
        };
        self.db
            .cf_handle(name)
            .ok_or_else(|| PqRatchetError::storage(format!("Column family '{}' not found", name)))
    }
}

impl StoreBackend for RocksDbBackend {
    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(table)?;
        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| PqRatchetError::storage(format!("Failed to write: {}", e)))
    }

    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(table)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| PqRatchetError::storage(format!("Failed to read: {}", e)))
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<bool> {
        let cf = self.cf(table)?;
        let existed = self
            .db
            .get_cf(&cf, key)
            .map_err(|e| PqRatchetError::storage(format!("Failed to read: {}", e)))?
            .is_some();
        if existed {
            self.db
                .delete_cf(&cf, key)
                .map_err(|e| PqRatchetError::storage(format!("Failed to delete: {}", e)))?;
        }
        Ok(existed)
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(table)?;
        let mut results = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf, prefix) {
            match item {
                Ok((key, value)) => {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    results.push((key.to_vec(), value.to_vec()));
                }
                Err(e) => {
                    warn!("Iterator error: {}", e);
                    return Err(PqRatchetError::storage(format!("Iterator failed: {}", e)));
                }
            }
        }
        Ok(results)
    }
}
