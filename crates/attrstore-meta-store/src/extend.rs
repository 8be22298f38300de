//! Per-inode extended attribute store.
//!
//! Records are kept in an inode-ordered index. Each mutation takes the
//! inode's own guard for the whole read -> compute -> submit -> publish
//! sequence, so updates to one inode never lose each other while unrelated
//! inodes proceed in parallel. The committed payload is always the full
//! record image, which replicas install as-is.

use crate::codec::{ParentLinks, SizeCounters};
use crate::command::RaftCmd;
use crate::partition::ReplicationPartition;
use crate::store::MetaStore;
use crate::types::{AttrMap, XAttrInfo, decode_attr_map, encode_attr_map};
use attrstore_common::{
    EXTEND_PREFIX, Error, InodeId, OP_FSM_REMOVE_XATTR, OP_FSM_SET_PARENT_LINK, OP_FSM_SET_XATTR,
    OP_FSM_UPDATE_XATTR, PARENT_KEY, Result, extend_key, op_name, parse_extend_key,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Attribute map of a single inode
#[derive(Default)]
pub struct ExtendRecord {
    attrs: RwLock<AttrMap>,
}

impl ExtendRecord {
    fn with_attrs(attrs: AttrMap) -> Self {
        Self {
            attrs: RwLock::new(attrs),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.attrs.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.attrs.read().keys().cloned().collect()
    }

    /// Copy of the whole attribute map
    pub fn to_map(&self) -> AttrMap {
        self.attrs.read().clone()
    }

    fn replace(&self, attrs: AttrMap) {
        *self.attrs.write() = attrs;
    }
}

/// Inode-ordered index of extend records
#[derive(Default)]
pub struct ExtendIndex {
    records: RwLock<BTreeMap<InodeId, Arc<ExtendRecord>>>,
}

impl ExtendIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, inode: InodeId) -> Option<Arc<ExtendRecord>> {
        self.records.read().get(&inode).cloned()
    }

    /// Install a committed record image, creating the record if needed.
    pub fn apply_image(&self, inode: InodeId, image: AttrMap) {
        if let Some(record) = self.get(inode) {
            record.replace(image);
            return;
        }
        let mut records = self.records.write();
        match records.get(&inode) {
            Some(record) => record.replace(image),
            None => {
                records.insert(inode, Arc::new(ExtendRecord::with_attrs(image)));
            }
        }
    }

    /// Inodes with a record inside `range`, in order, at most `limit`
    pub fn inodes(&self, range: impl RangeBounds<InodeId>, limit: usize) -> Vec<InodeId> {
        self.records
            .read()
            .range(range)
            .take(limit)
            .map(|(inode, _)| *inode)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Ordered copy of every record, for comparisons between replicas
    pub fn images(&self) -> BTreeMap<InodeId, AttrMap> {
        self.records
            .read()
            .iter()
            .map(|(inode, record)| (*inode, record.to_map()))
            .collect()
    }

    fn replace_all(&self, records: BTreeMap<InodeId, Arc<ExtendRecord>>) {
        *self.records.write() = records;
    }
}

/// Replicated extended attribute store
pub struct ExtendStore {
    index: Arc<ExtendIndex>,
    partition: Arc<dyn ReplicationPartition>,
    snapshot: Arc<MetaStore>,
    /// Per-inode write guards, independent of record existence. Entries
    /// only live while some mutation holds the guard.
    guards: DashMap<InodeId, Weak<tokio::sync::Mutex<()>>>,
}

impl ExtendStore {
    pub fn new(
        index: Arc<ExtendIndex>,
        partition: Arc<dyn ReplicationPartition>,
        snapshot: Arc<MetaStore>,
    ) -> Self {
        Self {
            index,
            partition,
            snapshot,
            guards: DashMap::new(),
        }
    }

    /// Rebuild the index from every extend record in the snapshot.
    pub fn load_from_snapshot(&self) -> Result<usize> {
        let raw = self.snapshot.seek_by_prefix(EXTEND_PREFIX)?;
        let mut records = BTreeMap::new();
        for (raw_key, raw_value) in raw {
            let inode = parse_extend_key(&raw_key).ok_or_else(|| {
                Error::internal(format!("malformed extend key {raw_key:?}"))
            })?;
            let attrs = decode_attr_map(&raw_value)
                .map_err(|e| Error::internal(format!("extend record {inode}: {e}")))?;
            debug!("Loaded extend record {} ({} attrs)", inode, attrs.len());
            records.insert(inode, Arc::new(ExtendRecord::with_attrs(attrs)));
        }
        let count = records.len();
        self.index.replace_all(records);
        info!("Loaded {} extend records from snapshot", count);
        Ok(count)
    }

    // ---- Reads ----

    /// Value of `key` on `inode`, if any.
    pub fn get(&self, inode: InodeId, key: &str) -> Option<Vec<u8>> {
        self.index.get(inode)?.get(key)
    }

    /// Attribute names of `inode`, including removed ones (empty values).
    pub fn list_keys(&self, inode: InodeId) -> Vec<String> {
        self.index
            .get(inode)
            .map(|record| record.keys())
            .unwrap_or_default()
    }

    pub fn get_all(&self, inode: InodeId) -> AttrMap {
        self.index
            .get(inode)
            .map(|record| record.to_map())
            .unwrap_or_default()
    }

    /// Requested `keys` for each inode that has a record. Inodes without a
    /// record are left out; keys an inode lacks are left out of its map.
    pub fn batch_get(&self, inodes: &[InodeId], keys: &[&str]) -> Vec<XAttrInfo> {
        inodes
            .iter()
            .filter_map(|inode| {
                let record = self.index.get(*inode)?;
                let attrs = keys
                    .iter()
                    .filter_map(|key| Some(((*key).to_string(), record.get(key)?)))
                    .collect();
                Some(XAttrInfo {
                    inode: *inode,
                    attrs,
                })
            })
            .collect()
    }

    /// Inodes with a record, starting at `from`, at most `limit`.
    pub fn list_inodes(&self, from: InodeId, limit: usize) -> Vec<InodeId> {
        self.index.inodes(from.., limit)
    }

    /// Current parent-link map of `inode`
    pub fn parent_links(&self, inode: InodeId) -> ParentLinks {
        ParentLinks::decode_lenient(self.get(inode, PARENT_KEY).as_deref())
    }

    /// Current size counters stored under `key`
    pub fn size_counters(&self, inode: InodeId, key: &str) -> SizeCounters {
        SizeCounters::decode_lenient(self.get(inode, key).as_deref())
    }

    // ---- Mutations ----

    /// Set `key` to `value`, creating the record if needed.
    pub async fn set(&self, inode: InodeId, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let guard = self.guard(inode);
        let _held = guard.lock().await;

        let mut image = self.current_image(inode);
        image.insert(key.to_string(), value.to_vec());
        self.commit(OP_FSM_SET_XATTR, inode, image).await?;
        info!("Set xattr '{}' on inode {}", key, inode);
        Ok(())
    }

    /// Set every attribute in `attrs` as one committed record update.
    pub async fn batch_set(&self, inode: InodeId, attrs: AttrMap) -> Result<()> {
        for key in attrs.keys() {
            validate_key(key)?;
        }
        let guard = self.guard(inode);
        let _held = guard.lock().await;

        let count = attrs.len();
        let mut image = self.current_image(inode);
        image.extend(attrs);
        self.commit(OP_FSM_SET_XATTR, inode, image).await?;
        info!("Set {} xattrs on inode {}", count, inode);
        Ok(())
    }

    /// Append each value to its key's current bytes (or insert it fresh).
    ///
    /// Every key is committed on its own: if a submission fails, the keys
    /// before it stay applied. Returns the resulting value of each key.
    pub async fn append(
        &self,
        inode: InodeId,
        keys: &[&str],
        values: &[&[u8]],
    ) -> Result<AttrMap> {
        if keys.len() != values.len() {
            return Err(Error::invalid_argument(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        for key in keys {
            validate_key(key)?;
        }
        let guard = self.guard(inode);
        let _held = guard.lock().await;

        let mut image = self.current_image(inode);
        let mut appended = AttrMap::new();
        for (key, value) in keys.iter().zip(values) {
            let entry = image.entry((*key).to_string()).or_default();
            entry.extend_from_slice(value);
            appended.insert((*key).to_string(), entry.clone());
            self.commit(OP_FSM_UPDATE_XATTR, inode, image.clone()).await?;
        }
        info!("Appended {} xattrs on inode {}", keys.len(), inode);
        Ok(appended)
    }

    /// Mark `key` removed. The key stays listed with an empty value.
    pub async fn remove(&self, inode: InodeId, key: &str) -> Result<()> {
        validate_key(key)?;
        let guard = self.guard(inode);
        let _held = guard.lock().await;

        let mut image = self.current_image(inode);
        image.insert(key.to_string(), Vec::new());
        self.commit(OP_FSM_REMOVE_XATTR, inode, image).await?;
        info!("Removed xattr '{}' on inode {}", key, inode);
        Ok(())
    }

    /// Add `delta` to the `files,dirs,bytes` counters stored under `key`
    /// and return the new totals.
    pub async fn merge_size_counters(
        &self,
        inode: InodeId,
        key: &str,
        delta: SizeCounters,
    ) -> Result<SizeCounters> {
        validate_key(key)?;
        let guard = self.guard(inode);
        let _held = guard.lock().await;

        let mut image = self.current_image(inode);
        let merged = SizeCounters::decode_lenient(image.get(key).map(Vec::as_slice)).merge(delta);
        image.insert(key.to_string(), merged.encode());
        self.commit(OP_FSM_UPDATE_XATTR, inode, image).await?;
        debug!("Merged size counters '{}' on inode {}: {}", key, inode, merged);
        Ok(merged)
    }

    /// Record one more link from `parent` to `inode`.
    pub async fn increment_parent_link(&self, inode: InodeId, parent: InodeId) -> Result<()> {
        if parent.is_none() {
            warn!("Ignoring parent link increment on inode {} with parent 0", inode);
            return Ok(());
        }
        let guard = self.guard(inode);
        let _held = guard.lock().await;

        let mut image = self.current_image(inode);
        let mut links = ParentLinks::decode_lenient(image.get(PARENT_KEY).map(Vec::as_slice));
        links.increment(parent.get());
        image.insert(PARENT_KEY.to_string(), links.encode()?);
        self.commit(OP_FSM_SET_PARENT_LINK, inode, image).await?;
        info!("Added parent {} to inode {}", parent, inode);
        Ok(())
    }

    /// Drop one link from `parent` to `inode`; the parent entry disappears
    /// when its count reaches zero.
    pub async fn decrement_parent_link(&self, inode: InodeId, parent: InodeId) -> Result<()> {
        if parent.is_none() {
            warn!("Ignoring parent link decrement on inode {} with parent 0", inode);
            return Ok(());
        }
        let guard = self.guard(inode);
        let _held = guard.lock().await;

        let Some(record) = self.index.get(inode) else {
            return Err(Error::key_not_found(format!("extend record of inode {inode}")));
        };
        let mut image = record.to_map();
        let mut links = ParentLinks::decode_lenient(image.get(PARENT_KEY).map(Vec::as_slice));
        if !links.decrement(parent.get()) {
            debug!("Inode {} has no link from parent {}", inode, parent);
            return Ok(());
        }
        image.insert(PARENT_KEY.to_string(), links.encode()?);
        self.commit(OP_FSM_SET_PARENT_LINK, inode, image).await?;
        info!("Removed parent {} from inode {}", parent, inode);
        Ok(())
    }

    fn guard(&self, inode: InodeId) -> Arc<tokio::sync::Mutex<()>> {
        let lock = {
            // The entry holds the shard lock, so racing callers share one guard
            let mut entry = self.guards.entry(inode).or_default();
            if let Some(lock) = entry.upgrade() {
                return lock;
            }
            let lock = Arc::new(tokio::sync::Mutex::new(()));
            *entry = Arc::downgrade(&lock);
            lock
        };

        if self.guards.len() > GUARD_CLEANUP_THRESHOLD {
            self.guards.retain(|_, v| v.strong_count() > 0);
        }
        lock
    }

    #[cfg(test)]
    fn guard_count(&self) -> usize {
        self.guards.len()
    }

    fn current_image(&self, inode: InodeId) -> AttrMap {
        self.index
            .get(inode)
            .map(|record| record.to_map())
            .unwrap_or_default()
    }

    /// Submit the record image and publish it once committed.
    async fn commit(&self, op: u32, inode: InodeId, image: AttrMap) -> Result<()> {
        let cmd = RaftCmd::new(op, extend_key(inode), encode_attr_map(&image)?);
        self.partition.submit(&cmd).await?;
        self.index.apply_image(inode, image);
        debug!("Committed {} for inode {}", op_name(op), inode);
        Ok(())
    }
}

/// Guard table size above which released guards are swept
const GUARD_CLEANUP_THRESHOLD: usize = 4096;

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("attribute name must not be empty"));
    }
    Ok(())
}
