//! RocksDB-backed local store.
//!
//! Column families:
//! - `pending_deletions` — one entry per deletion inside its undo window,
//!   keyed by entity id (bincode + LZ4)
//! - `identity`          — the cached anonymous identity (single key)

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{decode_record, encode_record, PendingDeletionStore, StoreError};
use crate::model::{EntityId, Identity, PendingDeletion};

const CF_PENDING: &str = "pending_deletions";
const CF_IDENTITY: &str = "identity";

const COLUMN_FAMILIES: &[&str] = &[CF_PENDING, CF_IDENTITY];

const IDENTITY_KEY: &[u8] = b"local";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every write. Undo records are small and rare, so on by default.
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("retroboard_data"),
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl StoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 16,
            write_buffer_size: 1024 * 1024, // 1MB
        }
    }
}

pub struct LocalStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl LocalStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                opts.set_write_buffer_size(config.write_buffer_size);
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::debug!("Opened local store at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    // ─── Identity ─────────────────────────────────────────────────────

    pub fn load_identity(&self) -> Result<Option<Identity>, StoreError> {
        let cf = self.cf(CF_IDENTITY)?;
        match self.db.get_cf(&cf, IDENTITY_KEY)? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let cf = self.cf(CF_IDENTITY)?;
        self.db.put_cf_opt(&cf, IDENTITY_KEY, encode_record(identity)?, &self.write_options())?;
        Ok(())
    }

    /// The cached anonymous identity, minting and saving one on first use.
    pub fn load_or_create_identity(&self) -> Result<Identity, StoreError> {
        if let Some(identity) = self.load_identity()? {
            return Ok(identity);
        }
        let identity = Identity::anonymous();
        self.save_identity(&identity)?;
        log::info!("Created anonymous identity {}", identity.display_name);
        Ok(identity)
    }

    pub fn pending_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl PendingDeletionStore for LocalStore {
    fn save(&self, record: &PendingDeletion) -> Result<(), StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let value = encode_record(record)?;
        self.db.put_cf_opt(&cf, record.entity_id.as_str().as_bytes(), value, &self.write_options())?;
        Ok(())
    }

    fn remove(&self, entity_id: &EntityId) -> Result<(), StoreError> {
        let cf = self.cf(CF_PENDING)?;
        self.db.delete_cf_opt(&cf, entity_id.as_str().as_bytes(), &self.write_options())?;
        Ok(())
    }

    /// Corrupt entries are skipped with a warning rather than failing the load.
    fn load_all(&self) -> Result<Vec<PendingDeletion>, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            match decode_record::<PendingDeletion>(&value) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!(
                    "Skipping unreadable pending deletion {}: {e}",
                    String::from_utf8_lossy(&key)
                ),
            }
        }
        Ok(records)
    }
}
