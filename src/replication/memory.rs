//! In-memory replication collaborator
//!
//! A single shared, ordered log inside one process. Leadership is assigned
//! explicitly and a commit is an append to the shared log; there is no
//! election or quorum. Each member gets its own delivery task that feeds
//! committed entries, in order, to its state machine.
//!
//! With `Durability` attached, an entry is written to the `LogStore` before
//! it counts as committed, and compaction persists the snapshot before the
//! covered log entries are dropped. `recover` rebuilds the cluster from both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::sequencer::CommitSequencer;
use super::traits::{CommittedEntry, EntryKind, NodeId, ReplicationPort, SubmitError};
use crate::core::snapshot::{RestoreError, Snapshot, SnapshotMetadata};
use crate::state_machine::Snapshotable;
use crate::storage::{LogStore, SnapshotStore, StorageError};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("node {0} is not a cluster member")]
    UnknownNode(NodeId),
    #[error("node {0} is already a cluster member")]
    AlreadyJoined(NodeId),
    #[error("snapshot install failed: {0}")]
    Restore(#[from] RestoreError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Where a cluster keeps its log and snapshots across restarts
pub struct Durability {
    pub log: Box<dyn LogStore>,
    pub snapshots: Box<dyn SnapshotStore>,
}

struct Member {
    state_machine: Arc<dyn Snapshotable>,
    tx: mpsc::UnboundedSender<CommittedEntry>,
}

/// Accepted while commits are paused, committed on resume
struct PendingCommand {
    data: Vec<u8>,
    reply: oneshot::Sender<Result<u64, SubmitError>>,
}

enum Proposal {
    Committed(u64),
    Queued(oneshot::Receiver<Result<u64, SubmitError>>),
}

#[derive(Default)]
struct ClusterState {
    leader: Option<NodeId>,
    /// Entries not covered by `snapshot`
    log: Vec<CommittedEntry>,
    snapshot: Option<Snapshot>,
    commit_index: u64,
    members: HashMap<NodeId, Member>,
    paused: bool,
    pending: Vec<PendingCommand>,
    durable: Option<Durability>,
}

impl ClusterState {
    /// Persist (if durable), then publish to every member
    fn commit(&mut self, kind: EntryKind, data: Vec<u8>) -> Result<u64, StorageError> {
        let entry = CommittedEntry {
            index: self.commit_index + 1,
            kind,
            data,
        };
        if let Some(durable) = self.durable.as_mut() {
            durable.log.append(&entry)?;
        }

        self.commit_index = entry.index;
        for member in self.members.values() {
            // A closed channel means the member is leaving
            let _ = member.tx.send(entry.clone());
        }
        self.log.push(entry);
        Ok(self.commit_index)
    }
}

/// Shared log and membership; cheap to clone
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from durable storage: the latest snapshot plus every logged
    /// entry after it. Later commits are persisted to the same stores.
    pub fn recover(durability: Durability) -> Result<Self, ReplicationError> {
        let snapshot = durability.snapshots.load()?;
        let base = snapshot.as_ref().map_or(0, Snapshot::last_applied_index);

        // Entries at or below the snapshot may remain after a crash mid-compaction
        let log: Vec<CommittedEntry> = durability
            .log
            .load()?
            .into_iter()
            .filter(|e| e.index > base)
            .collect();
        let mut commit_index = base;
        for entry in &log {
            if entry.index != commit_index + 1 {
                return Err(StorageError::Corruption(format!(
                    "log gap: expected index {}, found {}",
                    commit_index + 1,
                    entry.index
                ))
                .into());
            }
            commit_index = entry.index;
        }
        info!(
            snapshot_index = base,
            log_entries = log.len(),
            commit_index,
            "recovered cluster state"
        );

        let state = ClusterState {
            log,
            snapshot,
            commit_index,
            durable: Some(durability),
            ..ClusterState::default()
        };
        Ok(InMemoryCluster {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Add a replica. It first receives the retained snapshot (if any), then
    /// every retained log entry, then live commits.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn join(
        &self,
        id: NodeId,
        state_machine: Arc<dyn Snapshotable>,
    ) -> Result<InMemoryReplicator, ReplicationError> {
        let mut state = self.state.lock();
        if state.members.contains_key(&id) {
            return Err(ReplicationError::AlreadyJoined(id));
        }

        let mut start = 0;
        if let Some(snapshot) = &state.snapshot {
            start = snapshot.last_applied_index();
            state_machine.restore(snapshot.clone())?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for entry in state.log.iter().filter(|e| e.index > start) {
            let _ = tx.send(entry.clone());
        }

        let (applied_tx, applied_rx) = watch::channel(start);
        tokio::spawn(deliver(id, state_machine.clone(), rx, start, applied_tx));
        state.members.insert(id, Member { state_machine, tx });
        info!(node_id = id, start, "replica joined");

        Ok(InMemoryReplicator {
            id,
            cluster: self.clone(),
            applied: applied_rx,
        })
    }

    /// Remove a replica; its delivery task stops after draining
    pub fn leave(&self, id: NodeId) -> Result<(), ReplicationError> {
        let mut state = self.state.lock();
        state
            .members
            .remove(&id)
            .ok_or(ReplicationError::UnknownNode(id))?;
        if state.leader == Some(id) {
            state.leader = None;
            fail_pending(&mut state, None);
        }
        info!(node_id = id, "replica left");
        Ok(())
    }

    /// Assign leadership. Uncommitted submissions fail with `NotLeader`;
    /// a new leader commits a no-op entry, which fails only on storage errors.
    pub fn set_leader(&self, leader: Option<NodeId>) -> Result<(), ReplicationError> {
        let mut state = self.state.lock();
        if let Some(id) = leader {
            if !state.members.contains_key(&id) {
                return Err(ReplicationError::UnknownNode(id));
            }
        }
        if state.leader == leader {
            return Ok(());
        }

        let previous = state.leader;
        state.leader = leader;
        fail_pending(&mut state, leader);
        info!(?previous, ?leader, "leadership changed");

        if leader.is_some() {
            state.commit(EntryKind::Noop, Vec::new())?;
        }
        Ok(())
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().leader
    }

    /// Stop committing; submissions are accepted and held
    pub fn pause_commits(&self) {
        self.state.lock().paused = true;
        debug!("commits paused");
    }

    /// Commit everything held while paused, in submission order
    pub fn resume_commits(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        let pending = std::mem::take(&mut state.pending);
        let count = pending.len();
        for command in pending {
            let result = state.commit(EntryKind::Command, command.data).map_err(|err| {
                warn!(error = %err, "failed to persist held command");
                SubmitError::Aborted(err.to_string())
            });
            // The submitter may have given up already; a committed entry stays committed
            let _ = command.reply.send(result);
        }
        debug!(count, "commits resumed");
    }

    /// Snapshot `source` and drop the log entries it covers. When durable,
    /// the snapshot is saved before the log file is trimmed.
    pub fn compact(&self, source: NodeId) -> Result<SnapshotMetadata, ReplicationError> {
        let state_machine = {
            let state = self.state.lock();
            let member = state
                .members
                .get(&source)
                .ok_or(ReplicationError::UnknownNode(source))?;
            member.state_machine.clone()
        };

        // Captured without holding the cluster lock
        let snapshot = state_machine.snapshot();
        let metadata = snapshot.metadata;

        let mut state = self.state.lock();
        if let Some(existing) = &state.snapshot {
            if existing.last_applied_index() >= metadata.last_applied_index {
                return Ok(existing.metadata);
            }
        }
        let covered = metadata.last_applied_index;
        if let Some(durable) = state.durable.as_mut() {
            durable.snapshots.save(&snapshot)?;
            durable.log.compact_through(covered)?;
        }
        state.log.retain(|e| e.index > covered);
        state.snapshot = Some(snapshot);
        info!(
            node_id = source,
            last_applied = covered,
            retained = state.log.len(),
            "compacted log"
        );
        Ok(metadata)
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.state.lock().snapshot.clone()
    }

    /// Log entries not yet covered by a snapshot
    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    fn propose(&self, id: NodeId, data: Vec<u8>) -> Result<Proposal, SubmitError> {
        let mut state = self.state.lock();
        if state.leader != Some(id) {
            return Err(SubmitError::NotLeader {
                leader_hint: state.leader,
            });
        }
        if state.paused {
            let (reply, rx) = oneshot::channel();
            state.pending.push(PendingCommand { data, reply });
            return Ok(Proposal::Queued(rx));
        }
        match state.commit(EntryKind::Command, data) {
            Ok(index) => Ok(Proposal::Committed(index)),
            Err(err) => {
                warn!(error = %err, "failed to persist command");
                Err(SubmitError::Aborted(err.to_string()))
            }
        }
    }
}

fn fail_pending(state: &mut ClusterState, leader_hint: Option<NodeId>) {
    for command in state.pending.drain(..) {
        let _ = command.reply.send(Err(SubmitError::NotLeader { leader_hint }));
    }
}

async fn deliver(
    id: NodeId,
    state_machine: Arc<dyn Snapshotable>,
    mut rx: mpsc::UnboundedReceiver<CommittedEntry>,
    start: u64,
    applied: watch::Sender<u64>,
) {
    let mut sequencer = CommitSequencer::new(start);
    while let Some(entry) = rx.recv().await {
        match sequencer.offer(entry) {
            Ok(ready) => {
                for entry in ready {
                    state_machine.apply(&entry);
                    applied.send_replace(entry.index);
                }
            }
            Err(err) => warn!(node_id = id, error = %err, "dropping out-of-sequence entry"),
        }
    }
    debug!(node_id = id, "delivery stopped");
}

/// One member's handle on the cluster
#[derive(Clone)]
pub struct InMemoryReplicator {
    id: NodeId,
    cluster: InMemoryCluster,
    applied: watch::Receiver<u64>,
}

impl InMemoryReplicator {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }

    /// Highest index applied by this member's state machine
    pub fn applied_index(&self) -> u64 {
        *self.applied.borrow()
    }

    /// Wait until this member has applied `index`; false if delivery stopped
    pub async fn wait_applied(&self, index: u64) -> bool {
        let mut applied = self.applied.clone();
        let reached = applied.wait_for(|&a| a >= index).await.is_ok();
        reached
    }
}

#[async_trait]
impl ReplicationPort for InMemoryReplicator {
    fn is_leader(&self) -> bool {
        self.cluster.leader() == Some(self.id)
    }

    fn leader_hint(&self) -> Option<NodeId> {
        self.cluster.leader()
    }

    async fn submit(&self, command: Vec<u8>, timeout: Duration) -> Result<u64, SubmitError> {
        let commit_and_apply = async {
            let index = match self.cluster.propose(self.id, command)? {
                Proposal::Committed(index) => index,
                Proposal::Queued(reply) => reply.await.map_err(|_| SubmitError::Shutdown)??,
            };
            if !self.wait_applied(index).await {
                return Err(SubmitError::Shutdown);
            }
            Ok::<u64, SubmitError>(index)
        };

        tokio::time::timeout(timeout, commit_and_apply)
            .await
            .map_err(|_| SubmitError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Replica;
    use crate::state_machine::Command;
    use crate::storage::{FileLogStore, FileSnapshotStore, MemoryLogStore, MemorySnapshotStore};

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn put(key: &str, value: &str) -> Vec<u8> {
        Command::put(key, value).encode().unwrap()
    }

    fn join(cluster: &InMemoryCluster, id: NodeId) -> (Arc<Replica>, InMemoryReplicator) {
        let replica = Arc::new(Replica::new());
        let port = cluster.join(id, replica.clone()).unwrap();
        (replica, port)
    }

    #[tokio::test]
    async fn test_submit_on_follower_fails() {
        let cluster = InMemoryCluster::new();
        let (_r1, _p1) = join(&cluster, 1);
        let (_r2, p2) = join(&cluster, 2);
        cluster.set_leader(Some(1)).unwrap();

        let result = p2.submit(put("a", "1"), TIMEOUT).await;

        assert_eq!(result, Err(SubmitError::NotLeader { leader_hint: Some(1) }));
        assert!(!p2.is_leader());
        assert_eq!(p2.leader_hint(), Some(1));
    }

    #[tokio::test]
    async fn test_commit_reaches_every_replica() {
        let cluster = InMemoryCluster::new();
        let (r1, p1) = join(&cluster, 1);
        let (r2, p2) = join(&cluster, 2);
        let (r3, p3) = join(&cluster, 3);
        cluster.set_leader(Some(1)).unwrap();

        let index = p1.submit(put("a", "1"), TIMEOUT).await.unwrap();

        // Index 1 is the leader's no-op
        assert_eq!(index, 2);
        assert_eq!(r1.store().read("a"), Some("1".to_string()));
        assert!(p2.wait_applied(index).await);
        assert!(p3.wait_applied(index).await);
        assert_eq!(r2.store().read("a"), Some("1".to_string()));
        assert_eq!(r3.store().read("a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_new_leader_commits_noop() {
        let cluster = InMemoryCluster::new();
        let (r1, p1) = join(&cluster, 1);
        cluster.set_leader(Some(1)).unwrap();
        assert_eq!(cluster.commit_index(), 1);

        assert!(p1.wait_applied(1).await);
        assert!(r1.store().is_empty());
        assert_eq!(r1.store().last_applied(), 1);

        // Same leader again is not a change
        cluster.set_leader(Some(1)).unwrap();
        assert_eq!(cluster.commit_index(), 1);
    }

    #[tokio::test]
    async fn test_set_unknown_leader_rejected() {
        let cluster = InMemoryCluster::new();
        let result = cluster.set_leader(Some(9));
        assert!(matches!(result, Err(ReplicationError::UnknownNode(9))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_submission_still_commits() {
        let cluster = InMemoryCluster::new();
        let (r1, p1) = join(&cluster, 1);
        cluster.set_leader(Some(1)).unwrap();
        cluster.pause_commits();

        let result = p1.submit(put("late", "yes"), TIMEOUT).await;
        assert_eq!(result, Err(SubmitError::Timeout));
        assert_eq!(r1.store().read("late"), None);

        cluster.resume_commits();
        assert!(p1.wait_applied(2).await);
        assert_eq!(r1.store().read("late"), Some("yes".to_string()));
    }

    #[tokio::test]
    async fn test_leadership_lost_fails_pending() {
        let cluster = InMemoryCluster::new();
        let (_r1, p1) = join(&cluster, 1);
        let (_r2, _p2) = join(&cluster, 2);
        cluster.set_leader(Some(1)).unwrap();
        cluster.pause_commits();

        let submit = tokio::spawn({
            let p1 = p1.clone();
            async move { p1.submit(put("a", "1"), Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;
        // Give the submission a chance to queue
        while cluster.state.lock().pending.is_empty() {
            tokio::task::yield_now().await;
        }

        cluster.set_leader(Some(2)).unwrap();

        let result = submit.await.unwrap();
        assert_eq!(result, Err(SubmitError::NotLeader { leader_hint: Some(2) }));
    }

    #[tokio::test]
    async fn test_compaction_and_late_joiner_catch_up() {
        let cluster = InMemoryCluster::new();
        let (_r1, p1) = join(&cluster, 1);
        cluster.set_leader(Some(1)).unwrap();

        for i in 0..5 {
            p1.submit(put(&format!("k{i}"), "v"), TIMEOUT).await.unwrap();
        }
        let metadata = cluster.compact(1).unwrap();
        assert_eq!(metadata.last_applied_index, 6);
        assert_eq!(metadata.entry_count, 5);
        assert_eq!(cluster.log_len(), 0);

        let last = p1.submit(put("after", "snapshot"), TIMEOUT).await.unwrap();
        assert_eq!(cluster.log_len(), 1);

        let (r2, p2) = join(&cluster, 2);
        assert!(p2.wait_applied(last).await);
        assert_eq!(r2.store().read("k0"), Some("v".to_string()));
        assert_eq!(r2.store().read("after"), Some("snapshot".to_string()));
        assert_eq!(r2.store().len(), 6);
    }

    #[tokio::test]
    async fn test_compaction_never_moves_backwards() {
        let cluster = InMemoryCluster::new();
        let (_r1, p1) = join(&cluster, 1);
        cluster.set_leader(Some(1)).unwrap();
        let index = p1.submit(put("a", "1"), TIMEOUT).await.unwrap();

        let first = cluster.compact(1).unwrap();
        let second = cluster.compact(1).unwrap();

        assert_eq!(first.last_applied_index, index);
        assert_eq!(second, first);
    }

    fn file_durability(dir: &std::path::Path) -> Durability {
        Durability {
            log: Box::new(FileLogStore::new(dir).unwrap()),
            snapshots: Box::new(FileSnapshotStore::new(dir).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_recover_from_snapshot_seeds_joiners() {
        let source = InMemoryCluster::new();
        let (_r1, p1) = join(&source, 1);
        source.set_leader(Some(1)).unwrap();
        p1.submit(put("a", "1"), TIMEOUT).await.unwrap();
        source.compact(1).unwrap();

        let mut snapshots = MemorySnapshotStore::new();
        snapshots.save(&source.latest_snapshot().unwrap()).unwrap();
        let restored = InMemoryCluster::recover(Durability {
            log: Box::new(MemoryLogStore::new()),
            snapshots: Box::new(snapshots),
        })
        .unwrap();
        let (r, p) = join(&restored, 1);
        restored.set_leader(Some(1)).unwrap();
        let index = p.submit(put("b", "2"), TIMEOUT).await.unwrap();

        assert_eq!(index, 4);
        assert_eq!(r.store().read("a"), Some("1".to_string()));
        assert_eq!(r.store().read("b"), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_acknowledged_writes_survive_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let cluster = InMemoryCluster::recover(file_durability(dir.path())).unwrap();
            let (_r, p) = join(&cluster, 1);
            cluster.set_leader(Some(1)).unwrap();
            assert_eq!(p.submit(put("a", "1"), TIMEOUT).await, Ok(2));
        }

        let cluster = InMemoryCluster::recover(file_durability(dir.path())).unwrap();
        assert_eq!(cluster.commit_index(), 2);
        let (r, p) = join(&cluster, 1);
        assert!(p.wait_applied(2).await);
        assert_eq!(r.store().read("a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_restart_after_compaction_replays_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let cluster = InMemoryCluster::recover(file_durability(dir.path())).unwrap();
            let (_r, p) = join(&cluster, 1);
            cluster.set_leader(Some(1)).unwrap();
            p.submit(put("a", "1"), TIMEOUT).await.unwrap();
            p.submit(put("b", "2"), TIMEOUT).await.unwrap();
            cluster.compact(1).unwrap();
            p.submit(put("a", "3"), TIMEOUT).await.unwrap();
        }

        let log = FileLogStore::new(dir.path()).unwrap();
        let retained: Vec<u64> = log.load().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(retained, vec![4]);

        let cluster = InMemoryCluster::recover(file_durability(dir.path())).unwrap();
        let (r, p) = join(&cluster, 1);
        assert!(p.wait_applied(4).await);
        assert_eq!(r.store().read("a"), Some("3".to_string()));
        assert_eq!(r.store().read("b"), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_recover_rejects_log_gap() {
        let mut log = MemoryLogStore::new();
        log.append(&CommittedEntry::noop(1)).unwrap();
        log.append(&CommittedEntry::noop(3)).unwrap();

        let result = InMemoryCluster::recover(Durability {
            log: Box::new(log),
            snapshots: Box::new(MemorySnapshotStore::new()),
        });

        assert!(matches!(
            result,
            Err(ReplicationError::Storage(StorageError::Corruption(_)))
        ));
    }

    #[tokio::test]
    async fn test_leave_stops_delivery() {
        let cluster = InMemoryCluster::new();
        let (_r1, _p1) = join(&cluster, 1);
        let (_r2, p2) = join(&cluster, 2);
        cluster.set_leader(Some(1)).unwrap();

        cluster.leave(2).unwrap();

        assert!(!p2.wait_applied(100).await);
        assert!(matches!(cluster.leave(2), Err(ReplicationError::UnknownNode(2))));
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let cluster = InMemoryCluster::new();
        let (_r1, _p1) = join(&cluster, 1);
        let result = cluster.join(1, Arc::new(Replica::new()));
        assert!(matches!(result, Err(ReplicationError::AlreadyJoined(1))));
    }
}
