//! Redb table definitions for the snapshot store.

use redb::TableDefinition;

// Key: `#kv#{key}` or `#xa#{inode:be64}`, Value: UTF-8 string or bincode attribute map
pub const SNAPSHOT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("snapshot");

// Key: "applied_index", Value: last applied log index
pub const APPLY_STATE: TableDefinition<&str, u64> = TableDefinition::new("apply_state");

pub const APPLIED_INDEX_KEY: &str = "applied_index";
