//! Flat namespace key-value store.
//!
//! Operational parameters and counters. Every mutation runs under one
//! store-wide guard: validate, read the current value, compute the merge,
//! submit the computed value, then publish it to the index. The log only
//! ever carries final values, so replicas overwrite instead of re-merging.

use crate::codec::{FlatUpdate, MergeError};
use crate::command::RaftCmd;
use crate::partition::ReplicationPartition;
use crate::store::MetaStore;
use attrstore_common::{
    Error, KV_PREFIX, OP_SYNC_ADD_KV, OP_SYNC_DEL_KV, OP_SYNC_UPDATE_KV, Result, flat_key,
    parse_flat_key,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// In-memory index of the flat namespace.
///
/// Written by the apply path (on every replica) and by the proposing store
/// after a successful submit; both writes carry the same committed value.
#[derive(Default)]
pub struct KvIndex {
    entries: RwLock<HashMap<String, String>>,
}

impl KvIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn apply_put(&self, key: String, value: String) {
        self.entries.write().insert(key, value);
    }

    pub fn apply_delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Ordered copy of every entry
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn replace_all(&self, entries: HashMap<String, String>) {
        *self.entries.write() = entries;
    }
}

/// Replicated flat key-value store
pub struct FlatKvStore {
    index: Arc<KvIndex>,
    partition: Arc<dyn ReplicationPartition>,
    snapshot: Arc<MetaStore>,
    op_lock: tokio::sync::Mutex<()>,
}

impl FlatKvStore {
    pub fn new(
        index: Arc<KvIndex>,
        partition: Arc<dyn ReplicationPartition>,
        snapshot: Arc<MetaStore>,
    ) -> Self {
        Self {
            index,
            partition,
            snapshot,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild the index from every `#kv#` entry in the snapshot.
    pub fn load_from_snapshot(&self) -> Result<usize> {
        let raw = self.snapshot.seek_by_prefix(KV_PREFIX.as_bytes())?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (raw_key, raw_value) in raw {
            let Some(key) = parse_flat_key(&raw_key) else {
                warn!("Skipping non UTF-8 kv key {:?}", String::from_utf8_lossy(&raw_key));
                continue;
            };
            let value = String::from_utf8(raw_value).map_err(|e| {
                Error::internal(format!("kv value for '{key}' is not UTF-8: {e}"))
            })?;
            debug!("Loaded kv key '{}'", key);
            entries.insert(key, value);
        }
        let count = entries.len();
        self.index.replace_all(entries);
        info!("Loaded {} kv entries from snapshot", count);
        Ok(count)
    }

    /// Insert a new key. Fails if the key already exists.
    pub async fn add(&self, key: &str, value: &str) -> Result<String> {
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }

        let _guard = self.op_lock.lock().await;
        if self.index.contains(key) {
            return Err(Error::DuplicateKey(key.to_string()));
        }

        self.submit(OP_SYNC_ADD_KV, key, value).await?;
        self.index.apply_put(key.to_string(), value.to_string());
        info!("Added kv key '{}'", key);
        Ok(value.to_string())
    }

    /// Apply an update request (`%+N`, `%-N`, `%1X`, `%2Y` or a plain value)
    /// and return the value now stored.
    pub async fn update(&self, key: &str, value: &str) -> Result<String> {
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        let update = FlatUpdate::parse(value).map_err(|e| merge_error(key, e))?;

        let _guard = self.op_lock.lock().await;
        let old = self.index.get(key);
        let merged = update
            .apply(old.as_deref())
            .map_err(|e| merge_error(key, e))?;

        self.submit(OP_SYNC_UPDATE_KV, key, &merged).await?;
        self.index.apply_put(key.to_string(), merged.clone());
        info!("Updated kv key '{}'", key);
        Ok(merged)
    }

    /// Add `delta` to an integer-valued key (absent counts as zero) and
    /// return the new value.
    pub async fn update_int(&self, key: &str, delta: i64) -> Result<i64> {
        let request = if delta < 0 {
            format!("%{delta}")
        } else {
            format!("%+{delta}")
        };
        let merged = self.update(key, &request).await?;
        merged
            .parse::<i64>()
            .map_err(|e| Error::internal(format!("merged value for '{key}' is not an integer: {e}")))
    }

    /// Remove a key. Fails if the key does not exist.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if !self.index.contains(key) {
            return Err(Error::key_not_found(key));
        }

        self.submit(OP_SYNC_DEL_KV, key, "").await?;
        self.index.apply_delete(key);
        info!("Deleted kv key '{}'", key);
        Ok(())
    }

    /// Read a key from the local index.
    pub fn get(&self, key: &str) -> Result<String> {
        self.index.get(key).ok_or_else(|| Error::key_not_found(key))
    }

    /// Read an integer-valued key. Absent keys read as zero.
    pub fn get_int(&self, key: &str) -> Result<i64> {
        match self.index.get(key) {
            Some(value) => value.parse::<i64>().map_err(|_| {
                Error::invalid_argument(format!("value of '{key}' is not an integer: {value:?}"))
            }),
            None => Ok(0),
        }
    }

    /// Entries whose key starts with `prefix`, read from the snapshot.
    ///
    /// `key_filter` and `value_filter` further require the key (or value) to
    /// contain the given substring.
    pub fn prefix_scan(
        &self,
        prefix: &str,
        key_filter: Option<&str>,
        value_filter: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        let scan_prefix = flat_key(prefix);
        let raw = match (key_filter, value_filter) {
            (None, None) => self.snapshot.seek_by_prefix(&scan_prefix)?,
            (kf, vf) => self.snapshot.seek_by_prefix_with_filter(
                &scan_prefix,
                KV_PREFIX.len(),
                kf.unwrap_or_default(),
                vf.unwrap_or_default(),
            )?,
        };

        raw.into_iter()
            .map(|(raw_key, raw_value)| {
                let key = parse_flat_key(&raw_key).ok_or_else(|| {
                    Error::internal(format!(
                        "kv key is not UTF-8: {:?}",
                        String::from_utf8_lossy(&raw_key)
                    ))
                })?;
                Ok((key, String::from_utf8_lossy(&raw_value).into_owned()))
            })
            .collect()
    }

    /// Number of keys in the local index
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    async fn submit(&self, op: u32, key: &str, value: &str) -> Result<u64> {
        let cmd = RaftCmd::new(op, flat_key(key), value);
        self.partition.submit(&cmd).await
    }
}

fn merge_error(key: &str, e: MergeError) -> Error {
    match e {
        MergeError::MissingValue => Error::key_not_found(key),
        other => Error::invalid_argument(format!("{key}: {other}")),
    }
}
