//! A metadata node: snapshot, indexes, apply path and both stores wired to
//! one replication partition.

use crate::extend::{ExtendIndex, ExtendStore};
use crate::fsm::MetaFsm;
use crate::kv::{FlatKvStore, KvIndex};
use crate::partition::{LocalPartition, ReplicationPartition};
use crate::store::MetaStore;
use crate::types::AttrMap;
use attrstore_common::{Config, InodeId, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct MetaNode {
    pub kv: FlatKvStore,
    pub extend: ExtendStore,
    partition: Arc<LocalPartition>,
    fsm: Arc<MetaFsm>,
    kv_index: Arc<KvIndex>,
    extend_index: Arc<ExtendIndex>,
}

impl MetaNode {
    /// Open the node described by `config`, loading both indexes from the
    /// snapshot and starting a log that continues after its applied index.
    pub fn open(config: &Config) -> Result<Self> {
        let snapshot = Arc::new(MetaStore::open(config.snapshot_path())?);
        let applied = snapshot.applied_index()?;
        let partition = Arc::new(LocalPartition::new(applied, config.store.log_retention));

        let node = Self::build(snapshot, partition)?;
        node.partition.register(node.fsm.clone());
        info!(
            "Opened metadata node '{}' at applied index {}",
            config.node.name, applied
        );
        Ok(node)
    }

    /// Open a replica with its own snapshot at `path` that follows
    /// `partition`, catching up on the retained entries it has not applied.
    pub fn join(path: impl AsRef<Path>, partition: Arc<LocalPartition>) -> Result<Self> {
        let snapshot = Arc::new(MetaStore::open(path)?);
        let node = Self::build(snapshot, partition)?;
        let replayed = node
            .partition
            .attach(node.fsm.clone(), node.fsm.applied_index())?;
        info!(
            "Replica joined at index {} ({} entries replayed)",
            node.fsm.applied_index(),
            replayed
        );
        Ok(node)
    }

    fn build(snapshot: Arc<MetaStore>, partition: Arc<LocalPartition>) -> Result<Self> {
        let kv_index = Arc::new(KvIndex::new());
        let extend_index = Arc::new(ExtendIndex::new());
        let fsm = Arc::new(MetaFsm::new(
            snapshot.clone(),
            kv_index.clone(),
            extend_index.clone(),
        )?);

        let shared: Arc<dyn ReplicationPartition> = partition.clone();
        let kv = FlatKvStore::new(kv_index.clone(), shared.clone(), snapshot.clone());
        let extend = ExtendStore::new(extend_index.clone(), shared, snapshot);
        kv.load_from_snapshot()?;
        extend.load_from_snapshot()?;

        Ok(Self {
            kv,
            extend,
            partition,
            fsm,
            kv_index,
            extend_index,
        })
    }

    pub fn partition(&self) -> &Arc<LocalPartition> {
        &self.partition
    }

    /// Index of the last entry applied to this node's snapshot
    pub fn applied_index(&self) -> u64 {
        self.fsm.applied_index()
    }

    /// Ordered copy of the flat namespace
    pub fn kv_entries(&self) -> BTreeMap<String, String> {
        self.kv_index.entries()
    }

    /// Ordered copy of every extend record
    pub fn extend_images(&self) -> BTreeMap<InodeId, AttrMap> {
        self.extend_index.images()
    }
}
