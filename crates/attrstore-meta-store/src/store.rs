//! Persistent snapshot store backed by redb.
//!
//! Holds the applied state of both attribute overlays in a single ordered
//! table, plus the index of the last applied log entry. Every apply is one
//! write transaction covering the entry and the applied index, so the
//! snapshot never runs ahead of (or behind) the index it records.

use crate::tables;
use redb::{Database, ReadableTable};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Error type for snapshot store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for attrstore_common::Error {
    fn from(e: MetaStoreError) -> Self {
        Self::internal(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Raw key/value pairs returned by prefix scans, in key order
pub type ScanResult = BTreeMap<Vec<u8>, Vec<u8>>;

/// Persistent snapshot store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::SNAPSHOT)?;
            let _t = write_txn.open_table(tables::APPLY_STATE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Last log index reflected in the snapshot (0 when nothing was applied).
    pub fn applied_index(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::APPLY_STATE)?;
        Ok(table
            .get(tables::APPLIED_INDEX_KEY)?
            .map_or(0, |v| v.value()))
    }

    /// Write `key = value` and advance the applied index.
    pub fn apply_put(&self, index: u64, key: &[u8], value: &[u8]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::SNAPSHOT)?;
            table.insert(key, value)?;
            let mut state = write_txn.open_table(tables::APPLY_STATE)?;
            state.insert(tables::APPLIED_INDEX_KEY, index)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove `key` and advance the applied index.
    pub fn apply_delete(&self, index: u64, key: &[u8]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::SNAPSHOT)?;
            table.remove(key)?;
            let mut state = write_txn.open_table(tables::APPLY_STATE)?;
            state.insert(tables::APPLIED_INDEX_KEY, index)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> MetaStoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::SNAPSHOT)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// All entries whose key starts with `prefix`.
    pub fn seek_by_prefix(&self, prefix: &[u8]) -> MetaStoreResult<ScanResult> {
        self.scan(prefix, |_, _| true)
    }

    /// Entries under `prefix` whose key contains `key_filter` and whose value
    /// contains `value_filter`. Empty filters match everything. The first
    /// `namespace_len` bytes of each key are ignored when matching the key
    /// filter.
    pub fn seek_by_prefix_with_filter(
        &self,
        prefix: &[u8],
        namespace_len: usize,
        key_filter: &str,
        value_filter: &str,
    ) -> MetaStoreResult<ScanResult> {
        self.scan(prefix, |key, value| {
            let key = key.get(namespace_len..).unwrap_or_default();
            (key_filter.is_empty() || String::from_utf8_lossy(key).contains(key_filter))
                && (value_filter.is_empty()
                    || String::from_utf8_lossy(value).contains(value_filter))
        })
    }

    fn scan(
        &self,
        prefix: &[u8],
        matches: impl Fn(&[u8], &[u8]) -> bool,
    ) -> MetaStoreResult<ScanResult> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::SNAPSHOT)?;
        let mut result = BTreeMap::new();
        for entry in table.range::<&[u8]>(prefix..)? {
            let (key, value) = entry?;
            let (key, value) = (key.value(), value.value());
            // Keys are ordered, so the first miss ends the prefix
            if !key.starts_with(prefix) {
                break;
            }
            if matches(key, value) {
                result.insert(key.to_vec(), value.to_vec());
            }
        }
        debug!("Scanned prefix {:?}: {} entries", String::from_utf8_lossy(prefix), result.len());
        Ok(result)
    }
}
