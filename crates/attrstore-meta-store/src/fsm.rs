//! Apply path shared by every replica.
//!
//! [`MetaFsm`] turns committed commands into snapshot writes and index
//! updates. Each entry lands in the snapshot together with its log index in
//! one transaction, and entries at or below the last applied index are
//! skipped, so replaying a log tail after a restart is harmless.

use crate::command::RaftCmd;
use crate::extend::ExtendIndex;
use crate::kv::KvIndex;
use crate::partition::ApplyHandler;
use crate::store::MetaStore;
use crate::types::decode_attr_map;
use attrstore_common::{
    Error, OP_FSM_REMOVE_XATTR, OP_FSM_SET_PARENT_LINK, OP_FSM_SET_XATTR, OP_FSM_UPDATE_XATTR,
    OP_SYNC_ADD_KV, OP_SYNC_DEL_KV, OP_SYNC_UPDATE_KV, Result, op_name, parse_extend_key,
    parse_flat_key,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

pub struct MetaFsm {
    snapshot: Arc<MetaStore>,
    kv: Arc<KvIndex>,
    extend: Arc<ExtendIndex>,
    applied: AtomicU64,
}

impl MetaFsm {
    pub fn new(
        snapshot: Arc<MetaStore>,
        kv: Arc<KvIndex>,
        extend: Arc<ExtendIndex>,
    ) -> Result<Self> {
        let applied = snapshot.applied_index()?;
        Ok(Self {
            snapshot,
            kv,
            extend,
            applied: AtomicU64::new(applied),
        })
    }

    /// Index of the last entry this replica has applied
    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    fn apply_kv(&self, index: u64, cmd: &RaftCmd) -> Result<()> {
        let key = parse_flat_key(&cmd.key)
            .ok_or_else(|| Error::internal(format!("{} with malformed key", op_name(cmd.op))))?;

        if cmd.op == OP_SYNC_DEL_KV {
            self.snapshot.apply_delete(index, &cmd.key)?;
            self.kv.apply_delete(&key);
            return Ok(());
        }

        let value = String::from_utf8(cmd.value.clone())
            .map_err(|e| Error::internal(format!("kv value for '{key}' is not UTF-8: {e}")))?;
        self.snapshot.apply_put(index, &cmd.key, &cmd.value)?;
        self.kv.apply_put(key, value);
        Ok(())
    }

    fn apply_extend(&self, index: u64, cmd: &RaftCmd) -> Result<()> {
        let inode = parse_extend_key(&cmd.key)
            .ok_or_else(|| Error::internal(format!("{} with malformed key", op_name(cmd.op))))?;
        let image = decode_attr_map(&cmd.value)?;
        self.snapshot.apply_put(index, &cmd.key, &cmd.value)?;
        self.extend.apply_image(inode, image);
        Ok(())
    }
}

impl ApplyHandler for MetaFsm {
    fn apply(&self, index: u64, cmd: &RaftCmd) -> Result<()> {
        if index <= self.applied_index() {
            trace!("Skipping already applied index {}", index);
            return Ok(());
        }

        match cmd.op {
            OP_SYNC_ADD_KV | OP_SYNC_UPDATE_KV | OP_SYNC_DEL_KV => self.apply_kv(index, cmd)?,
            OP_FSM_SET_XATTR | OP_FSM_UPDATE_XATTR | OP_FSM_REMOVE_XATTR
            | OP_FSM_SET_PARENT_LINK => self.apply_extend(index, cmd)?,
            op => return Err(Error::internal(format!("unknown opcode {op:#x} at index {index}"))),
        }

        self.applied.store(index, Ordering::SeqCst);
        debug!("Applied {:?} at index {}", cmd, index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttrMap, encode_attr_map};
    use attrstore_common::{InodeId, extend_key, flat_key};
    use tempfile::tempdir;

    struct Replica {
        fsm: MetaFsm,
        snapshot: Arc<MetaStore>,
        kv: Arc<KvIndex>,
        extend: Arc<ExtendIndex>,
    }

    fn replica(path: &std::path::Path) -> Replica {
        let snapshot = Arc::new(MetaStore::open(path).unwrap());
        let kv = Arc::new(KvIndex::new());
        let extend = Arc::new(ExtendIndex::new());
        let fsm = MetaFsm::new(snapshot.clone(), kv.clone(), extend.clone()).unwrap();
        Replica {
            fsm,
            snapshot,
            kv,
            extend,
        }
    }

    fn attrs(pairs: &[(&str, &[u8])]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_apply_kv_commands() {
        let dir = tempdir().unwrap();
        let r = replica(&dir.path().join("snap.redb"));

        r.fsm
            .apply(1, &RaftCmd::new(OP_SYNC_ADD_KV, flat_key("a"), "1"))
            .unwrap();
        r.fsm
            .apply(2, &RaftCmd::new(OP_SYNC_UPDATE_KV, flat_key("a"), "5"))
            .unwrap();
        assert_eq!(r.kv.get("a").as_deref(), Some("5"));
        assert_eq!(r.snapshot.get(&flat_key("a")).unwrap(), Some(b"5".to_vec()));

        r.fsm
            .apply(3, &RaftCmd::new(OP_SYNC_DEL_KV, flat_key("a"), ""))
            .unwrap();
        assert!(!r.kv.contains("a"));
        assert_eq!(r.snapshot.get(&flat_key("a")).unwrap(), None);
        assert_eq!(r.snapshot.applied_index().unwrap(), 3);
        assert_eq!(r.fsm.applied_index(), 3);
    }

    #[test]
    fn test_apply_installs_extend_image() {
        let dir = tempdir().unwrap();
        let r = replica(&dir.path().join("snap.redb"));
        let inode = InodeId::new(42);

        let image = attrs(&[("user.a", b"1".as_slice()), ("user.b", b"".as_slice())]);
        let cmd = RaftCmd::new(
            OP_FSM_SET_XATTR,
            extend_key(inode),
            encode_attr_map(&image).unwrap(),
        );
        r.fsm.apply(1, &cmd).unwrap();

        let record = r.extend.get(inode).unwrap();
        assert_eq!(record.to_map(), image);
        let stored = r.snapshot.get(&extend_key(inode)).unwrap().unwrap();
        assert_eq!(decode_attr_map(&stored).unwrap(), image);
    }

    #[test]
    fn test_already_applied_entries_are_skipped() {
        let dir = tempdir().unwrap();
        let r = replica(&dir.path().join("snap.redb"));

        r.fsm
            .apply(5, &RaftCmd::new(OP_SYNC_ADD_KV, flat_key("a"), "new"))
            .unwrap();
        r.fsm
            .apply(4, &RaftCmd::new(OP_SYNC_ADD_KV, flat_key("a"), "stale"))
            .unwrap();
        r.fsm
            .apply(5, &RaftCmd::new(OP_SYNC_ADD_KV, flat_key("a"), "dup"))
            .unwrap();
        assert_eq!(r.kv.get("a").as_deref(), Some("new"));
        assert_eq!(r.fsm.applied_index(), 5);
    }

    #[test]
    fn test_applied_index_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.redb");
        {
            let r = replica(&path);
            r.fsm
                .apply(7, &RaftCmd::new(OP_SYNC_ADD_KV, flat_key("a"), "1"))
                .unwrap();
        }
        let r = replica(&path);
        assert_eq!(r.fsm.applied_index(), 7);
        r.fsm
            .apply(7, &RaftCmd::new(OP_SYNC_ADD_KV, flat_key("b"), "1"))
            .unwrap();
        assert!(!r.kv.contains("b"));
    }

    #[test]
    fn test_rejects_unknown_opcode_and_bad_payloads() {
        let dir = tempdir().unwrap();
        let r = replica(&dir.path().join("snap.redb"));

        let err = r
            .fsm
            .apply(1, &RaftCmd::new(0xff, flat_key("a"), "1"))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        let err = r
            .fsm
            .apply(1, &RaftCmd::new(OP_FSM_SET_XATTR, b"#xa#short".to_vec(), ""))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        let err = r
            .fsm
            .apply(
                1,
                &RaftCmd::new(OP_FSM_SET_XATTR, extend_key(InodeId::new(1)), vec![0xff]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));

        // Nothing was applied
        assert_eq!(r.fsm.applied_index(), 0);
        assert!(r.extend.is_empty());
    }
}
