//! Replicated command envelope.
//!
//! A [`RaftCmd`] is what travels through the replicated log: an opcode, the
//! snapshot key it targets and the value to store. Values are always the
//! final, already-merged bytes so that applying a command is a plain
//! overwrite on every replica.

use attrstore_common::{Error, Result, op_name};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftCmd {
    pub op: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RaftCmd {
    pub fn new(op: u32, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serialize for submission to the log
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a committed log entry
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

impl fmt::Debug for RaftCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftCmd")
            .field("op", &op_name(self.op))
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("value_len", &self.value.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrstore_common::{OP_SYNC_UPDATE_KV, flat_key};

    #[test]
    fn test_encode_decode() {
        let cmd = RaftCmd::new(OP_SYNC_UPDATE_KV, flat_key("quota"), "15");
        let decoded = RaftCmd::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_decode_garbage() {
        let err = RaftCmd::decode(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }

    #[test]
    fn test_debug_hides_value() {
        let cmd = RaftCmd::new(OP_SYNC_UPDATE_KV, flat_key("k"), "secret");
        let shown = format!("{cmd:?}");
        assert!(shown.contains("update_kv"));
        assert!(!shown.contains("secret"));
    }
}
