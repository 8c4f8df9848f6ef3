//! Raft consensus node (single voter)
//!
//! Commits every proposal through an ordered, persisted log and applies it
//! from one apply task, so all readers observe mutations in commit order.
//! Multi-voter replication is out of scope; leadership is held by this node
//! once it campaigns and is published on a watch channel.

use crate::common::raft::{LogEntry, Snapshot};
use crate::common::storage::LogStore;
use crate::common::{Error, Result};
use crate::coordinator::cluster::ClusterState;
use crate::coordinator::consensus::ConsensusGateway;
use crate::coordinator::state::{MembershipState, Proposal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Raft role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Command carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Propose(Proposal),
    RemovePeer(u64),
}

/// Applies committed commands.
pub trait StateMachine: Send + Sync {
    fn apply(&self, index: u64, command: &Command) -> Result<()>;

    fn snapshot(&self) -> Result<Vec<u8>>;

    fn restore(&self, index: u64, data: &[u8]) -> Result<()>;
}

impl StateMachine for ClusterState {
    fn apply(&self, index: u64, command: &Command) -> Result<()> {
        match command {
            Command::Propose(proposal) => ClusterState::apply(self, index, proposal),
            Command::RemovePeer(node_id) => {
                self.remove_zero(*node_id);
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.marshal()
    }

    fn restore(&self, index: u64, data: &[u8]) -> Result<()> {
        let mut state = MembershipState::from_bytes(data)?;
        state.counter = state.counter.max(index);
        self.set_membership_state(state);
        Ok(())
    }
}

struct Pending {
    entry: LogEntry,
    command: Command,
    done: oneshot::Sender<Result<()>>,
}

/// Raft node state
pub struct RaftNode {
    node_id: u64,
    role: Mutex<RaftRole>,
    term: AtomicU64,
    leader_id: watch::Sender<Option<u64>>,
    /// Index of the last entry accepted into the log; the sender lives
    /// behind the same lock so indexes reach the apply task in order.
    proposer: Mutex<(u64, mpsc::UnboundedSender<Pending>)>,
    applied: watch::Receiver<u64>,
}

impl RaftNode {
    /// Restore the state machine from `store` and start the apply task.
    pub fn open(
        node_id: u64,
        state_machine: Arc<dyn StateMachine>,
        store: Arc<dyn LogStore>,
        snapshot_threshold: u64,
    ) -> Result<Arc<Self>> {
        let mut last_index = 0;
        let mut term = 0;
        if let Some(snapshot) = store.load_snapshot()? {
            state_machine.restore(snapshot.index, &snapshot.data)?;
            last_index = snapshot.index;
            term = snapshot.term;
        }
        let snapshot_index = last_index;
        for entry in store.entries_after(last_index)? {
            let command: Command = bincode::deserialize(&entry.data)?;
            // Rejections replay identically; only successes change state.
            if let Err(e) = state_machine.apply(entry.index, &command) {
                tracing::debug!(index = entry.index, "Replayed rejected entry: {}", e);
            }
            last_index = entry.index;
            term = term.max(entry.term);
        }
        if last_index > 0 {
            tracing::info!(
                node_id,
                last_index,
                snapshot_index,
                "Recovered consensus log"
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = watch::channel(last_index);
        let applier = Applier {
            store,
            state_machine,
            applied: applied_tx,
            snapshot_index,
            snapshot_threshold,
        };
        tokio::spawn(applier.run(rx));

        Ok(Arc::new(Self {
            node_id,
            role: Mutex::new(RaftRole::Follower),
            term: AtomicU64::new(term),
            leader_id: watch::channel(None).0,
            proposer: Mutex::new((last_index, tx)),
            applied: applied_rx,
        }))
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn get_role(&self) -> RaftRole {
        *self.role.lock()
    }

    pub fn get_term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    pub fn get_leader(&self) -> Option<u64> {
        *self.leader_id.borrow()
    }

    /// Index of the last entry accepted into the log.
    pub fn last_index(&self) -> u64 {
        self.proposer.lock().0
    }

    pub fn applied_index(&self) -> u64 {
        *self.applied.borrow()
    }

    /// Leadership changes as seen by this node.
    pub fn leadership(&self) -> watch::Receiver<Option<u64>> {
        self.leader_id.subscribe()
    }

    /// Start an election. A single voter always wins it.
    pub fn campaign(&self) -> u64 {
        *self.role.lock() = RaftRole::Candidate;
        let term = self.term.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(node_id = self.node_id, term, "Starting election");
        self.become_leader();
        term
    }

    pub fn become_leader(&self) {
        *self.role.lock() = RaftRole::Leader;
        self.leader_id.send_replace(Some(self.node_id));
        tracing::info!(node_id = self.node_id, term = self.get_term(), "Became leader");
    }

    /// Step down to follower
    pub fn step_down(&self, new_term: u64, leader_id: Option<u64>) {
        *self.role.lock() = RaftRole::Follower;
        self.term.fetch_max(new_term, Ordering::AcqRel);
        self.leader_id.send_replace(leader_id);
        tracing::info!(node_id = self.node_id, ?leader_id, "Stepped down");
    }

    async fn submit(&self, command: Command) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader(
                self.get_leader()
                    .map_or_else(|| "unknown".to_string(), |id| id.to_string()),
            ));
        }
        let data = bincode::serialize(&command)?;
        let (done, wait) = oneshot::channel();
        {
            let mut proposer = self.proposer.lock();
            let entry = LogEntry {
                term: self.get_term(),
                index: proposer.0 + 1,
                data,
            };
            proposer
                .1
                .send(Pending {
                    entry,
                    command,
                    done,
                })
                .map_err(|_| Error::Raft("apply loop stopped".into()))?;
            proposer.0 += 1;
        }
        wait.await
            .map_err(|_| Error::Raft("proposal dropped before apply".into()))?
    }
}

#[async_trait::async_trait]
impl ConsensusGateway for RaftNode {
    async fn propose_and_wait(&self, proposal: Proposal) -> Result<()> {
        self.submit(Command::Propose(proposal)).await
    }

    async fn remove_peer(&self, node_id: u64) -> Result<()> {
        if node_id == self.node_id {
            return Err(Error::Raft(format!(
                "node {} cannot remove itself",
                node_id
            )));
        }
        self.submit(Command::RemovePeer(node_id)).await
    }

    fn leader_id(&self) -> Option<u64> {
        self.get_leader()
    }

    fn is_leader(&self) -> bool {
        matches!(*self.role.lock(), RaftRole::Leader)
    }

    async fn wait_linearizable_read(&self) -> Result<()> {
        let target = self.last_index();
        let mut applied = self.applied.clone();
        applied
            .wait_for(|index| *index >= target)
            .await
            .map_err(|_| Error::Raft("apply loop stopped".into()))?;
        Ok(())
    }
}

/// Owns the log store and applies entries in index order.
struct Applier {
    store: Arc<dyn LogStore>,
    state_machine: Arc<dyn StateMachine>,
    applied: watch::Sender<u64>,
    snapshot_index: u64,
    snapshot_threshold: u64,
}

impl Applier {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Pending>) {
        while let Some(pending) = rx.recv().await {
            let index = pending.entry.index;
            let result = match self.store.append(&pending.entry) {
                Ok(()) => self.state_machine.apply(index, &pending.command),
                Err(e) => {
                    tracing::error!(index, "Failed to persist entry: {}", e);
                    Err(e)
                }
            };
            self.applied.send_replace(index);
            if index - self.snapshot_index >= self.snapshot_threshold {
                self.take_snapshot(index, pending.entry.term);
            }
            // The proposer may have stopped waiting.
            let _ = pending.done.send(result);
        }
        tracing::debug!("Apply loop stopped");
    }

    fn take_snapshot(&mut self, index: u64, term: u64) {
        let snapshot = match self.state_machine.snapshot() {
            Ok(data) => Snapshot { index, term, data },
            Err(e) => {
                tracing::error!(index, "Failed to capture snapshot: {}", e);
                return;
            }
        };
        match self.store.save_snapshot(&snapshot) {
            Ok(()) => {
                tracing::info!(index, bytes = snapshot.data.len(), "Wrote snapshot");
                self.snapshot_index = index;
            }
            Err(e) => tracing::error!(index, "Failed to write snapshot: {}", e),
        }
    }
}
