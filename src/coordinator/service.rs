//! Coordinator request handling
//!
//! - Connect: admit a node and assign it a Raft id and a group
//! - UpdateMembership: reconcile a group leader's report with authoritative state
//! - ShouldServe: answer (and claim) tablet ownership
//! - StreamMembership: push read-consistent snapshots to a subscriber
//!
//! Every mutation is a `Proposal` pushed through the consensus gateway; the
//! in-memory snapshot only changes when a committed proposal is applied.

use crate::common::{timestamp_now, CoordinatorConfig, Error, Result, METRICS};
use crate::coordinator::cluster::ClusterState;
use crate::coordinator::conn::ConnHandle;
use crate::coordinator::consensus::{ConsensusGateway, PendingTxnSource};
use crate::coordinator::state::{
    ConnectionState, Group, Member, MembershipState, Proposal, Tablet,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run `fut` unless `cancel` fires first. Dropping `fut` only abandons the
/// wait; a proposal it already submitted still commits.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// The membership authority.
pub struct Zero {
    cluster: Arc<ClusterState>,
    gateway: Arc<dyn ConsensusGateway>,
    oracle: Arc<dyn PendingTxnSource>,
    /// Serializes Connect decisions together with their consensus round trip.
    connect_lock: Arc<Mutex<()>>,
    leader_generation: watch::Sender<u64>,
    shutdown: CancellationToken,
    stream_interval: Duration,
    update_backoff: Duration,
}

impl Zero {
    pub fn new(
        cluster: Arc<ClusterState>,
        gateway: Arc<dyn ConsensusGateway>,
        oracle: Arc<dyn PendingTxnSource>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            cluster,
            gateway,
            oracle,
            connect_lock: Arc::new(Mutex::new(())),
            leader_generation: watch::channel(0).0,
            shutdown: CancellationToken::new(),
            stream_interval: config.stream_interval(),
            update_backoff: config.update_backoff(),
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn gateway(&self) -> &Arc<dyn ConsensusGateway> {
        &self.gateway
    }

    pub fn membership_state(&self) -> MembershipState {
        self.cluster.membership_state()
    }

    pub fn marshal_membership_state(&self) -> Result<Vec<u8>> {
        self.cluster.marshal()
    }

    pub fn known_groups(&self) -> Vec<u32> {
        self.cluster.known_groups()
    }

    pub fn serving_tablet(&self, predicate: &str) -> Option<Tablet> {
        self.cluster.serving_tablet(predicate)
    }

    // === Leadership & shutdown ===

    /// Bump the leader-change generation; every receiver observes the edge.
    pub fn trigger_leader_change(&self) {
        self.leader_generation.send_modify(|generation| *generation += 1);
    }

    pub fn leader_changes(&self) -> watch::Receiver<u64> {
        self.leader_generation.subscribe()
    }

    pub fn shutdown(&self) {
        info!("Shutting down membership streams");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Track consensus leadership: refresh zero leader flags and bump the
    /// leader-change generation on every change.
    pub fn spawn_leadership_watcher(
        self: &Arc<Self>,
        mut leadership: watch::Receiver<Option<u64>>,
    ) -> JoinHandle<()> {
        let zero = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = zero.shutdown.cancelled() => break,
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let leader = *leadership.borrow_and_update();
                info!(?leader, "Leadership changed");
                if let Some(id) = leader {
                    zero.cluster.update_zero_leader(id);
                }
                zero.trigger_leader_change();
            }
        })
    }

    /// Handle to the leader of `group_id` (0 = zeros), or to any reachable
    /// member if the leader is not reachable.
    pub fn leader(&self, group_id: u32) -> Option<ConnHandle> {
        let registry = self.cluster.registry();
        self.cluster.inspect(|state| {
            let members = state.members_of(group_id)?;
            let mut healthy = None;
            for member in members.values() {
                if let Some(handle) = registry.resolve(&member.addr) {
                    if member.leader {
                        return Some(handle);
                    }
                    healthy = Some(handle);
                }
            }
            healthy
        })
    }

    // === Reads ===

    async fn read_barrier(&self) -> Result<MembershipState> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::ShutDown),
            res = self.gateway.wait_linearizable_read() => {
                res?;
                Ok(self.cluster.membership_state())
            }
        }
    }

    /// Snapshot no older than the consensus position at call time.
    pub async fn latest_membership_state(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MembershipState> {
        cancellable(cancel, self.read_barrier()).await
    }

    pub(crate) async fn propose(&self, proposal: Proposal, cancel: &CancellationToken) -> Result<()> {
        METRICS.proposals_total.inc();
        let res = cancellable(cancel, self.gateway.propose_and_wait(proposal)).await;
        if res.is_err() {
            METRICS.proposals_failed.inc();
        }
        res
    }

    // === Connect ===

    /// Admit a new or rejoining node.
    pub async fn connect(
        &self,
        member: Member,
        cancel: &CancellationToken,
    ) -> Result<ConnectionState> {
        let gate = cancellable(cancel, async {
            Ok(self.connect_lock.clone().lock_owned().await)
        })
        .await?;
        METRICS.connects_total.inc();
        info!(
            id = member.id,
            group = member.group_id,
            addr = %member.addr,
            info_only = member.cluster_info_only,
            "Got connection request"
        );

        if member.cluster_info_only {
            let state = self.latest_membership_state(cancel).await?;
            return Ok(ConnectionState {
                state,
                member: None,
                max_pending: self.oracle.max_pending(),
            });
        }
        if member.addr.is_empty() {
            return Err(Error::EmptyAddress(member.id));
        }

        let registry = self.cluster.registry().clone();
        self.cluster.inspect(|state| {
            if member.id == 0 {
                return Ok(());
            }
            if state.is_removed(member.id) {
                return Err(Error::ReusedId(member.id));
            }
            match state.find_member(member.id) {
                Some(existing)
                    if existing.addr != member.addr
                        && registry.resolve(&existing.addr).is_some() =>
                {
                    Err(Error::DuplicateRaftId {
                        id: member.id,
                        addr: existing.addr.clone(),
                    })
                }
                _ => Ok(()),
            }
        })?;

        // Fail-open: reachability surfaces later through health probes.
        registry.connect(&member.addr);

        let replicas = self.cluster.replicas();
        let (proposal, assigned) = self
            .cluster
            .inspect_exclusive(|state, next_group| plan_connect(state, next_group, replicas, member));

        if let Some(proposal) = proposal {
            debug!(?proposal, "Proposing membership change");
            self.propose_gated(proposal, gate, cancel).await?;
        }

        let state = self.cluster.membership_state();
        let member = state.find_member(assigned.id).cloned().unwrap_or(assigned);
        info!(id = member.id, group = member.group_id, addr = %member.addr, "Connected");
        Ok(ConnectionState {
            state,
            member: Some(member),
            max_pending: 0,
        })
    }

    /// Commit a Connect proposal, holding the gate until the commit resolves
    /// even if the caller stops waiting.
    async fn propose_gated(
        &self,
        proposal: Proposal,
        gate: OwnedMutexGuard<()>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let gateway = self.gateway.clone();
        METRICS.proposals_total.inc();
        let commit = tokio::spawn(async move {
            let res = gateway.propose_and_wait(proposal).await;
            if let Err(e) = &res {
                METRICS.proposals_failed.inc();
                warn!("Connect proposal failed: {}", e);
            }
            drop(gate);
            res
        });
        cancellable(cancel, async move {
            commit
                .await
                .map_err(|e| Error::Internal(format!("connect proposal task failed: {}", e)))?
        })
        .await
    }

    // === UpdateMembership ===

    /// Diff a group leader's report against authoritative state.
    pub fn create_proposals(&self, report: &Group) -> Result<Vec<Proposal>> {
        if report.members.len() > 1 {
            return Err(Error::InvalidReport(format!(
                "expected at most one reporting member, got {}",
                report.members.len()
            )));
        }

        self.cluster.inspect(|state| {
            let mut res = Vec::new();
            for (id, dst) in &report.members {
                let group = state
                    .groups
                    .get(&dst.group_id)
                    .ok_or(Error::UnknownGroup(dst.group_id))?;
                let src = group.members.get(id).ok_or(Error::UnknownMember {
                    id: *id,
                    group: dst.group_id,
                })?;
                if src.addr != dst.addr || src.leader != dst.leader {
                    res.push(Proposal::member(dst.clone()));
                }
                // Only the leader's view of tablets and snapshots is trusted.
                if !dst.leader {
                    return Ok(res);
                }
                if report.snapshot_ts > group.snapshot_ts {
                    res.push(Proposal::snapshot(dst.group_id, report.snapshot_ts));
                }
            }
            if report.members.is_empty() {
                return Ok(res);
            }

            for (key, dst) in &report.tablets {
                let group = state
                    .groups
                    .get(&dst.group_id)
                    .ok_or(Error::UnknownGroup(dst.group_id))?;
                // Unknown here: the tablet is moving to another group.
                let Some(src) = group.tablets.get(key) else {
                    continue;
                };
                if dst.remove || space_changed(src.space, dst.space) {
                    let mut tablet = dst.clone();
                    tablet.force = false;
                    if tablet.predicate.is_empty() {
                        tablet.predicate = key.clone();
                    }
                    res.push(Proposal::tablet(tablet));
                }
            }
            Ok(res)
        })
    }

    /// Reconcile a group report, submitting independent proposals
    /// concurrently. Committed siblings of a failed proposal stay committed.
    pub async fn update_membership(&self, report: Group, cancel: &CancellationToken) -> Result<()> {
        let proposals = match self.create_proposals(&report) {
            Ok(proposals) => proposals,
            Err(e) => {
                error!("Error while creating proposals in update: {}", e);
                // Keep failing reporters from retrying in a busy loop.
                tokio::time::sleep(self.update_backoff).await;
                return Err(e);
            }
        };
        if proposals.is_empty() {
            return Ok(());
        }
        debug!(count = proposals.len(), "Reconciling membership report");

        let mut tasks = JoinSet::new();
        for proposal in proposals {
            let gateway = self.gateway.clone();
            METRICS.proposals_total.inc();
            tasks.spawn(async move { gateway.propose_and_wait(proposal).await });
        }

        cancellable(cancel, async move {
            while let Some(joined) = tasks.join_next().await {
                let res = joined
                    .map_err(|e| Error::Internal(format!("proposal task failed: {}", e)))
                    .and_then(|res| res);
                if let Err(e) = res {
                    METRICS.proposals_failed.inc();
                    error!("Error while applying proposal in update: {}", e);
                    return Err(e);
                }
            }
            Ok(())
        })
        .await
    }

    // === ShouldServe ===

    /// Owner of `tablet.predicate`, claiming it for the caller's group when
    /// nobody owns it yet.
    pub async fn should_serve(&self, mut tablet: Tablet, cancel: &CancellationToken) -> Result<Tablet> {
        if tablet.predicate.is_empty() {
            return Err(Error::EmptyPredicate(tablet.group_id));
        }
        if tablet.group_id == 0 {
            return Err(Error::ZeroGroup(tablet.predicate));
        }

        // The caller compares the owner's group against its own.
        if let Some(owner) = self.cluster.serving_tablet(&tablet.predicate) {
            return Ok(owner);
        }

        tablet.force = false;
        tablet.remove = false;
        let predicate = tablet.predicate.clone();
        match self.propose(Proposal::tablet(tablet), cancel).await {
            Ok(()) => METRICS.tablets_claimed.inc(),
            Err(e) if e.is_benign_race() => {
                debug!(%predicate, "Lost tablet claim race: {}", e);
            }
            Err(e) => {
                warn!(%predicate, "While proposing tablet: {}", e);
                return Err(e);
            }
        }

        match self.cluster.serving_tablet(&predicate) {
            Some(owner) => {
                debug!(%predicate, group = owner.group_id, "Now serving tablet");
                Ok(owner)
            }
            None => panic!("tablet {} has no owner after a committed claim", predicate),
        }
    }

    // === StreamMembership ===

    /// Push a read-consistent snapshot now and then once per stream interval
    /// until cancelled, shut down, or the subscriber goes away.
    pub async fn stream_membership(
        &self,
        sink: mpsc::Sender<MembershipState>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _active = METRICS.active_streams.track();
        let state = self.read_barrier().await?;
        sink.send(state).await.map_err(|_| Error::StreamClosed)?;

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.stream_interval,
            self.stream_interval,
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.shutdown.cancelled() => return Err(Error::ShutDown),
                _ = ticker.tick() => {
                    let state = self.latest_membership_state(cancel).await?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = self.shutdown.cancelled() => return Err(Error::ShutDown),
                        sent = sink.send(state) => sent.map_err(|_| Error::StreamClosed)?,
                    }
                }
            }
        }
    }

    // === RemoveNode ===

    /// Remove a node for good. The caller must make sure it does not come
    /// back; its id is never reused for data groups.
    pub async fn remove_node(
        &self,
        node_id: u64,
        group_id: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(node_id, group_id, "Removing node");
        if group_id == 0 {
            return cancellable(cancel, self.gateway.remove_peer(node_id)).await;
        }
        self.cluster.inspect(|state| {
            let group = state
                .groups
                .get(&group_id)
                .ok_or(Error::UnknownGroup(group_id))?;
            if !group.members.contains_key(&node_id) {
                return Err(Error::UnknownMember {
                    id: node_id,
                    group: group_id,
                });
            }
            Ok(())
        })?;

        let mut member = Member::new(node_id, group_id, "");
        member.am_dead = true;
        self.propose(Proposal::member(member), cancel).await
    }
}

/// Space changes worth a proposal: first nonzero report, or a move of more
/// than 10% relative to the recorded size.
pub fn space_changed(old: i64, new: i64) -> bool {
    let (s, d) = (old as f64, new as f64);
    (s == 0.0 && d > 0.0) || (s > 0.0 && (d / s - 1.0).abs() > 0.1)
}

/// Decide where a connecting node goes. Returns the proposal to commit (if
/// any) and the member as it will be registered.
pub fn plan_connect(
    state: &MembershipState,
    next_group: u32,
    replicas: usize,
    mut member: Member,
) -> (Option<Proposal>, Member) {
    member.cluster_info_only = false;
    member.am_dead = false;
    member.last_update = timestamp_now();

    if member.id != 0 {
        if let Some(existing) = state.find_member(member.id) {
            if existing.addr == member.addr {
                return (None, existing.clone());
            }
            let mut updated = existing.clone();
            updated.addr = member.addr;
            updated.last_update = member.last_update;
            return (Some(Proposal::member(updated.clone())), updated);
        }
    }

    let mut proposal = Proposal::default();
    if member.id == 0 {
        member.id = state.max_raft_id + 1;
        proposal.max_raft_id = member.id;
    } else if member.id > state.max_raft_id {
        // Keep later assignments clear of self-chosen ids.
        proposal.max_raft_id = member.id;
    }

    if member.group_id > 0 {
        let fits = state.groups.get(&member.group_id).map_or(true, |group| {
            group.members.contains_key(&member.id) || group.members.len() < replicas
        });
        if fits {
            proposal.member = Some(member.clone());
            return (Some(proposal), member);
        }
    }

    member.group_id = state
        .groups
        .iter()
        .find(|(_, group)| group.members.len() < replicas)
        .map(|(gid, _)| *gid)
        // Only advanced once the proposal creating this group commits.
        .unwrap_or(next_group);
    proposal.member = Some(member.clone());
    (Some(proposal), member)
}
