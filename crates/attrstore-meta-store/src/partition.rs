//! Replication partition contract and the in-process log.
//!
//! Stores never mutate their indexes directly in response to a request; they
//! [`ReplicationPartition::submit`] a command and the partition calls every
//! registered [`ApplyHandler`] once per committed entry, in log order. On the
//! submitting replica the apply has run before `submit` returns.

use crate::command::RaftCmd;
use async_trait::async_trait;
use attrstore_common::{Error, Result, op_name};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Ordered, replicated command log.
#[async_trait]
pub trait ReplicationPartition: Send + Sync {
    /// Propose `cmd` and wait until it is committed and applied locally.
    /// Returns the log index assigned to the command.
    async fn submit(&self, cmd: &RaftCmd) -> Result<u64>;

    /// Whether this replica currently accepts proposals
    fn is_leader(&self) -> bool;
}

/// Apply callback invoked once per committed command on every replica.
pub trait ApplyHandler: Send + Sync {
    fn apply(&self, index: u64, cmd: &RaftCmd) -> Result<()>;
}

/// A committed log entry as retained by [`LocalPartition`]
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub index: u64,
    pub data: Vec<u8>,
}

struct LogState {
    last_index: u64,
    entries: VecDeque<LogEntry>,
    handlers: Vec<Arc<dyn ApplyHandler>>,
}

/// Single-log partition living in this process.
///
/// Submissions are serialized through one lock, so the log has exactly one
/// order and every handler sees it. The first registered handler is the
/// local replica; further handlers act as followers fed from the same log.
pub struct LocalPartition {
    state: Mutex<LogState>,
    leader: AtomicBool,
    retention: usize,
}

impl LocalPartition {
    /// Create a partition whose next entry gets index `start_index + 1`.
    #[must_use]
    pub fn new(start_index: u64, retention: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                last_index: start_index,
                entries: VecDeque::new(),
                handlers: Vec::new(),
            }),
            leader: AtomicBool::new(true),
            retention,
        }
    }

    /// Register an apply handler that has seen every entry so far.
    pub fn register(&self, handler: Arc<dyn ApplyHandler>) {
        self.state.lock().handlers.push(handler);
    }

    /// Register a replica that has applied the log up to `applied`, replaying
    /// the retained entries it missed first. Returns the number replayed.
    pub fn attach(&self, handler: Arc<dyn ApplyHandler>, applied: u64) -> Result<usize> {
        let mut state = self.state.lock();
        if applied < state.last_index {
            let first_retained = state.entries.front().map_or(state.last_index + 1, |e| e.index);
            if first_retained > applied + 1 {
                return Err(Error::replication(format!(
                    "replica at index {applied} is behind the retained log (first retained {first_retained})"
                )));
            }
        }

        let mut replayed = 0;
        for entry in state.entries.iter().filter(|e| e.index > applied) {
            let cmd = RaftCmd::decode(&entry.data)?;
            handler.apply(entry.index, &cmd)?;
            replayed += 1;
        }
        state.handlers.push(handler);
        info!("Attached replica at index {} ({} entries replayed)", applied, replayed);
        Ok(replayed)
    }

    /// Step up or down. A partition that is not leader rejects proposals.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Index of the last committed entry
    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index
    }

    /// Retained committed commands with index greater than `after`, in order.
    pub fn committed_since(&self, after: u64) -> Result<Vec<(u64, RaftCmd)>> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| e.index > after)
            .map(|e| Ok((e.index, RaftCmd::decode(&e.data)?)))
            .collect()
    }

    /// Number of registered replicas, the local one included
    pub fn replicas(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Commit `cmd` at the next index.
    ///
    /// The local replica applies first; if it fails, nothing is appended and
    /// the error is returned. Once appended the entry is committed, and a
    /// follower that fails to apply it is detached instead of failing the
    /// proposal. It can `attach` again from its own applied index.
    fn commit(&self, cmd: &RaftCmd) -> Result<u64> {
        let data = cmd.encode()?;
        // Handlers see the command as decoded from the log, like a follower would
        let committed = RaftCmd::decode(&data)?;

        let mut state = self.state.lock();
        let index = state.last_index + 1;
        if let Some(local) = state.handlers.first()
            && let Err(e) = local.apply(index, &committed)
        {
            error!("Failed to apply {} at index {}: {}", op_name(cmd.op), index, e);
            return Err(e);
        }

        state.last_index = index;
        state.entries.push_back(LogEntry { index, data });
        while state.entries.len() > self.retention {
            state.entries.pop_front();
        }

        let failed: Vec<usize> = state
            .handlers
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(pos, handler)| match handler.apply(index, &committed) {
                Ok(()) => None,
                Err(e) => {
                    error!(
                        "Replica {} failed to apply {} at index {}, detaching: {}",
                        pos,
                        op_name(cmd.op),
                        index,
                        e
                    );
                    Some(pos)
                }
            })
            .collect();
        for pos in failed.into_iter().rev() {
            state.handlers.remove(pos);
        }

        debug!("Committed {} at index {}", op_name(cmd.op), index);
        Ok(index)
    }
}

#[async_trait]
impl ReplicationPartition for LocalPartition {
    async fn submit(&self, cmd: &RaftCmd) -> Result<u64> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        self.commit(cmd)
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrstore_common::{OP_SYNC_ADD_KV, flat_key};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, RaftCmd)>>,
    }

    impl ApplyHandler for Recorder {
        fn apply(&self, index: u64, cmd: &RaftCmd) -> Result<()> {
            self.seen.lock().push((index, cmd.clone()));
            Ok(())
        }
    }

    /// Handler whose apply always fails
    #[derive(Default)]
    struct Broken {
        calls: AtomicUsize,
    }

    impl ApplyHandler for Broken {
        fn apply(&self, _index: u64, _cmd: &RaftCmd) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::internal("disk full"))
        }
    }

    fn add_cmd(key: &str) -> RaftCmd {
        RaftCmd::new(OP_SYNC_ADD_KV, flat_key(key), "v")
    }

    #[tokio::test]
    async fn test_submit_applies_in_order_on_every_handler() {
        let partition = LocalPartition::new(0, 16);
        let local = Arc::new(Recorder::default());
        let follower = Arc::new(Recorder::default());
        partition.register(local.clone());
        partition.register(follower.clone());

        assert_eq!(partition.submit(&add_cmd("a")).await.unwrap(), 1);
        assert_eq!(partition.submit(&add_cmd("b")).await.unwrap(), 2);

        let local_seen = local.seen.lock().clone();
        assert_eq!(local_seen.len(), 2);
        assert_eq!(local_seen[0], (1, add_cmd("a")));
        assert_eq!(local_seen[1], (2, add_cmd("b")));
        assert_eq!(*follower.seen.lock(), local_seen);
    }

    #[tokio::test]
    async fn test_not_leader_rejects_without_apply() {
        let partition = LocalPartition::new(0, 16);
        let local = Arc::new(Recorder::default());
        partition.register(local.clone());
        partition.set_leader(false);

        let err = partition.submit(&add_cmd("a")).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader));
        assert!(local.seen.lock().is_empty());
        assert_eq!(partition.last_index(), 0);
    }

    #[tokio::test]
    async fn test_retention_and_committed_since() {
        let partition = LocalPartition::new(10, 2);
        for key in ["a", "b", "c"] {
            partition.submit(&add_cmd(key)).await.unwrap();
        }
        assert_eq!(partition.last_index(), 13);

        let retained = partition.committed_since(0).unwrap();
        let indexes: Vec<u64> = retained.iter().map(|(i, _)| *i).collect();
        assert_eq!(indexes, vec![12, 13]);
        assert_eq!(partition.committed_since(12).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_replays_missed_entries() {
        let partition = LocalPartition::new(0, 8);
        for key in ["a", "b", "c"] {
            partition.submit(&add_cmd(key)).await.unwrap();
        }

        let late = Arc::new(Recorder::default());
        assert_eq!(partition.attach(late.clone(), 1).unwrap(), 2);
        partition.submit(&add_cmd("d")).await.unwrap();

        let indexes: Vec<u64> = late.seen.lock().iter().map(|(i, _)| *i).collect();
        assert_eq!(indexes, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_attach_rejects_replica_behind_retention() {
        let partition = LocalPartition::new(0, 1);
        for key in ["a", "b", "c"] {
            partition.submit(&add_cmd(key)).await.unwrap();
        }
        let late = Arc::new(Recorder::default());
        assert!(partition.attach(late, 0).is_err());
    }

    #[tokio::test]
    async fn test_local_apply_failure_appends_nothing() {
        let partition = LocalPartition::new(0, 16);
        let local = Arc::new(Broken::default());
        let follower = Arc::new(Recorder::default());
        partition.register(local.clone());
        partition.register(follower.clone());

        let err = partition.submit(&add_cmd("a")).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(partition.last_index(), 0);
        assert!(partition.committed_since(0).unwrap().is_empty());
        assert!(follower.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_follower_is_detached() {
        let partition = LocalPartition::new(0, 16);
        let local = Arc::new(Recorder::default());
        let follower = Arc::new(Broken::default());
        partition.register(local.clone());
        partition.register(follower.clone());

        assert_eq!(partition.submit(&add_cmd("a")).await.unwrap(), 1);
        assert_eq!(partition.submit(&add_cmd("b")).await.unwrap(), 2);

        assert_eq!(local.seen.lock().len(), 2);
        assert_eq!(follower.calls.load(Ordering::SeqCst), 1);
        assert_eq!(partition.replicas(), 1);

        // A healthy replica can rejoin from where it left off
        let rejoined = Arc::new(Recorder::default());
        assert_eq!(partition.attach(rejoined.clone(), 0).unwrap(), 2);
        assert_eq!(partition.replicas(), 2);
    }
}
