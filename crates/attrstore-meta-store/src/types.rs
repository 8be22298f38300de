//! Stored types for snapshot persistence.
//!
//! Extend records are persisted as their full attribute map, serialized with
//! bincode. `BTreeMap` keeps the encoding identical on every replica for the
//! same logical content.

use attrstore_common::{Error, InodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute name -> raw value for one inode
pub type AttrMap = BTreeMap<String, Vec<u8>>;

/// Encode a record image for the log and the snapshot
pub fn encode_attr_map(attrs: &AttrMap) -> Result<Vec<u8>> {
    bincode::serialize(attrs).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a record image
pub fn decode_attr_map(data: &[u8]) -> Result<AttrMap> {
    bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Requested attributes of one inode, as returned by batch reads
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XAttrInfo {
    pub inode: InodeId,
    pub attrs: AttrMap,
}
