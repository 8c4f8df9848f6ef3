//! Shared harness: a single-voter coordinator over in-memory storage.

#![allow(dead_code)]

use minizero::common::storage::{LogStore, MemStore};
use minizero::common::CoordinatorConfig;
use minizero::coordinator::{
    ClusterState, ConsensusGateway, Member, Proposal, RaftNode, StaticRegistry, Zero,
};
use minizero::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub zero: Arc<Zero>,
    pub raft: Arc<RaftNode>,
    pub cluster: Arc<ClusterState>,
    pub registry: Arc<StaticRegistry>,
    pub store: Arc<dyn LogStore>,
}

pub fn config(replicas: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        replicas,
        stream_interval_ms: 20,
        update_backoff_ms: 10,
        ..Default::default()
    }
}

pub async fn harness(replicas: usize) -> Harness {
    harness_with_store(replicas, Arc::new(MemStore::new())).await
}

pub async fn harness_with_store(replicas: usize, store: Arc<dyn LogStore>) -> Harness {
    let registry = Arc::new(StaticRegistry::default());
    let cluster = Arc::new(ClusterState::new(replicas, registry.clone()));
    let raft = RaftNode::open(1, cluster.clone(), store.clone(), 1_000).unwrap();
    let zero = Arc::new(Zero::new(
        cluster.clone(),
        raft.clone(),
        Arc::new(AtomicU64::new(42)),
        &config(replicas),
    ));
    zero.spawn_leadership_watcher(raft.leadership());
    cluster.store_zero(Member::new(1, 0, "zero1:5080"));
    raft.campaign();
    Harness {
        zero,
        raft,
        cluster,
        registry,
        store,
    }
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Connect a fresh node at `addr`, returning its registered descriptor.
pub async fn join(h: &Harness, addr: &str, group: u32) -> Member {
    h.zero
        .connect(Member::new(0, group, addr), &token())
        .await
        .unwrap()
        .member
        .unwrap()
}

/// Wait for the leadership watcher to flag the local zero as leader.
pub async fn settle_leadership(h: &Harness) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.zero.membership_state().zeros[&1].leader {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

/// Wait (on the real clock) until `cond` holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

/// A second service front end over the harness state, talking to `gateway`.
pub fn zero_over(
    h: &Harness,
    gateway: Arc<dyn ConsensusGateway>,
    config: &CoordinatorConfig,
) -> Arc<Zero> {
    Arc::new(Zero::new(
        h.cluster.clone(),
        gateway,
        Arc::new(AtomicU64::new(42)),
        config,
    ))
}

/// Rejections are delayed by this much so that, under a paused clock, the
/// rest of a batch settles first.
pub const REJECT_DELAY: Duration = Duration::from_secs(1);

/// Forwards to the local Raft node with injectable faults: proposals can be
/// held until released, rejected by a predicate, and read barriers failed.
pub struct FaultyGateway {
    inner: Arc<RaftNode>,
    release: watch::Sender<bool>,
    submitted: AtomicUsize,
    reject: fn(&Proposal) -> bool,
    fail_reads: AtomicBool,
}

impl FaultyGateway {
    pub fn new(inner: Arc<RaftNode>) -> Self {
        Self {
            inner,
            release: watch::channel(true).0,
            submitted: AtomicUsize::new(0),
            reject: |_| false,
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Proposals are accepted but do not commit until `release`.
    pub fn held(inner: Arc<RaftNode>) -> Self {
        let gateway = Self::new(inner);
        gateway.release.send_replace(false);
        gateway
    }

    pub fn rejecting(mut self, reject: fn(&Proposal) -> bool) -> Self {
        self.reject = reject;
        self
    }

    pub fn release(&self) {
        self.release.send_replace(true);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConsensusGateway for FaultyGateway {
    async fn propose_and_wait(&self, proposal: Proposal) -> Result<()> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if (self.reject)(&proposal) {
            tokio::time::sleep(REJECT_DELAY).await;
            return Err(Error::Raft("proposal rejected".into()));
        }
        let mut released = self.release.subscribe();
        let inner = self.inner.clone();
        // Accepted entries commit whether or not the caller keeps waiting.
        let commit = tokio::spawn(async move {
            let _ = released.wait_for(|released| *released).await;
            inner.propose_and_wait(proposal).await
        });
        commit
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn remove_peer(&self, node_id: u64) -> Result<()> {
        self.inner.remove_peer(node_id).await
    }

    fn leader_id(&self) -> Option<u64> {
        self.inner.leader_id()
    }

    fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    async fn wait_linearizable_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Raft("lost quorum".into()));
        }
        self.inner.wait_linearizable_read().await
    }
}
