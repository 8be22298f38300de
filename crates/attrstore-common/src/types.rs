//! Core type definitions for attrstore
//!
//! Identifiers, the reserved key-space layout shared by both attribute
//! overlays, and the opcodes carried by replicated commands.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Inode identifier
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display, From, Into,
)]
#[display("{_0}")]
pub struct InodeId(u64);

impl InodeId {
    /// Sentinel used by callers for "no parent"
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

// ---- Key space ----

/// Prefix of every flat key-value entry in the snapshot store
pub const KV_PREFIX: &str = "#kv#";

/// Prefix of every extend record in the snapshot store
pub const EXTEND_PREFIX: &[u8] = b"#xa#";

/// Reserved attribute holding the parent-link count map
pub const PARENT_KEY: &str = "parent";

/// Snapshot key for a flat user key: `#kv#{key}`
#[must_use]
pub fn flat_key(key: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(KV_PREFIX.len() + key.len());
    data.extend_from_slice(KV_PREFIX.as_bytes());
    data.extend_from_slice(key.as_bytes());
    data
}

/// Recover the user key from a flat snapshot key
#[must_use]
pub fn parse_flat_key(raw: &[u8]) -> Option<String> {
    let rest = raw.strip_prefix(KV_PREFIX.as_bytes())?;
    String::from_utf8(rest.to_vec()).ok()
}

/// Snapshot key for an extend record: `#xa#{inode:be64}`
///
/// Big-endian so that snapshot order matches inode order.
#[must_use]
pub fn extend_key(inode: InodeId) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXTEND_PREFIX.len() + 8);
    data.extend_from_slice(EXTEND_PREFIX);
    data.extend_from_slice(&inode.get().to_be_bytes());
    data
}

/// Recover the inode from an extend snapshot key
#[must_use]
pub fn parse_extend_key(raw: &[u8]) -> Option<InodeId> {
    let rest = raw.strip_prefix(EXTEND_PREFIX)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(InodeId(u64::from_be_bytes(bytes)))
}

// ---- Opcodes ----

pub const OP_SYNC_ADD_KV: u32 = 0x01;
pub const OP_SYNC_DEL_KV: u32 = 0x02;
pub const OP_SYNC_UPDATE_KV: u32 = 0x03;
pub const OP_FSM_SET_XATTR: u32 = 0x11;
pub const OP_FSM_UPDATE_XATTR: u32 = 0x12;
pub const OP_FSM_REMOVE_XATTR: u32 = 0x13;
pub const OP_FSM_SET_PARENT_LINK: u32 = 0x14;

/// Human-readable opcode name for logs
#[must_use]
pub const fn op_name(op: u32) -> &'static str {
    match op {
        OP_SYNC_ADD_KV => "add_kv",
        OP_SYNC_DEL_KV => "del_kv",
        OP_SYNC_UPDATE_KV => "update_kv",
        OP_FSM_SET_XATTR => "set_xattr",
        OP_FSM_UPDATE_XATTR => "update_xattr",
        OP_FSM_REMOVE_XATTR => "remove_xattr",
        OP_FSM_SET_PARENT_LINK => "set_parent_link",
        _ => "unknown",
    }
}
