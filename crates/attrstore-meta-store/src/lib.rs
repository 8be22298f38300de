//! attrstore metadata store
//!
//! Two attribute overlays replicated through one ordered command log:
//! a flat key-value namespace with a small merge grammar for counters and
//! composite values, and per-inode extended attributes with parent-link and
//! size-counter helpers. Both share a redb snapshot.

pub mod codec;
pub mod command;
pub mod extend;
pub mod fsm;
pub mod kv;
pub mod node;
pub mod partition;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use codec::{FlatUpdate, MergeError, ParentLinks, SizeCounters};
pub use command::RaftCmd;
pub use extend::{ExtendIndex, ExtendStore};
pub use fsm::MetaFsm;
pub use kv::{FlatKvStore, KvIndex};
pub use node::MetaNode;
pub use partition::{ApplyHandler, LocalPartition, ReplicationPartition};
pub use store::MetaStore;
pub use types::{AttrMap, XAttrInfo};
