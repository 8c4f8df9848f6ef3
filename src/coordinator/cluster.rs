//! Authoritative membership snapshot and the state machine applying
//! committed proposals to it.
//!
//! All reads and writes go through one reader/writer lock. Lookups on the
//! borrowed `MembershipState` are only reachable from inside `inspect` /
//! `inspect_exclusive`, so they always run with the lock held.

use crate::common::{Error, Result};
use crate::coordinator::conn::ConnectionRegistry;
use crate::coordinator::state::{Group, Member, MembershipState, Proposal, Tablet};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

struct Inner {
    state: MembershipState,
    /// Group id handed to the next node that needs a brand-new group.
    next_group: u32,
}

/// Lock-guarded owner of the membership snapshot.
pub struct ClusterState {
    inner: RwLock<Inner>,
    replicas: usize,
    registry: Arc<dyn ConnectionRegistry>,
}

impl ClusterState {
    pub fn new(replicas: usize, registry: Arc<dyn ConnectionRegistry>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: MembershipState::default(),
                next_group: 1,
            }),
            replicas,
            registry,
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    /// Deep copy of the current snapshot.
    pub fn membership_state(&self) -> MembershipState {
        self.inner.read().state.clone()
    }

    /// Wire form of the current snapshot.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        self.inner.read().state.to_bytes()
    }

    pub fn next_group(&self) -> u32 {
        self.inner.read().next_group
    }

    /// Run `f` against the snapshot under the read lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&MembershipState) -> R) -> R {
        f(&self.inner.read().state)
    }

    /// Run `f` under the write lock, so no proposal is applied while it
    /// decides. Receives the current `next_group`.
    pub fn inspect_exclusive<R>(&self, f: impl FnOnce(&MembershipState, u32) -> R) -> R {
        let inner = self.inner.write();
        f(&inner.state, inner.next_group)
    }

    pub fn serving_tablet(&self, predicate: &str) -> Option<Tablet> {
        self.inner.read().state.serving_tablet(predicate).cloned()
    }

    pub fn known_groups(&self) -> Vec<u32> {
        self.inner.read().state.groups.keys().copied().collect()
    }

    /// Replace the whole snapshot, e.g. when a snapshot is installed.
    pub fn set_membership_state(&self, state: MembershipState) {
        let mut inner = self.inner.write();
        for member in state.groups.values().flat_map(|g| g.members.values()) {
            self.registry.connect(&member.addr);
        }
        inner.next_group = state.groups.len() as u32 + 1;
        info!(
            groups = state.groups.len(),
            zeros = state.zeros.len(),
            counter = state.counter,
            "Installed membership state"
        );
        inner.state = state;
    }

    pub fn store_zero(&self, member: Member) {
        let mut inner = self.inner.write();
        inner.state.zeros.insert(member.id, member);
    }

    /// Move a zero into removed history.
    pub fn remove_zero(&self, node_id: u64) {
        let mut inner = self.inner.write();
        if let Some(member) = inner.state.zeros.remove(&node_id) {
            self.registry.remove(&member.addr);
            inner.state.removed.push(member);
        }
    }

    /// Flag exactly the given zero as leader.
    pub fn update_zero_leader(&self, leader_id: u64) {
        let mut inner = self.inner.write();
        for member in inner.state.zeros.values_mut() {
            member.leader = member.id == leader_id;
        }
    }

    /// Apply one committed proposal. The proposal is validated as a whole
    /// first, so a rejected proposal leaves the snapshot untouched.
    pub fn apply(&self, index: u64, proposal: &Proposal) -> Result<()> {
        let mut inner = self.inner.write();
        self.validate(&inner, proposal)?;

        if proposal.max_raft_id > 0 {
            inner.state.max_raft_id = proposal.max_raft_id;
        }
        for (gid, ts) in &proposal.snapshot_ts {
            if let Some(group) = inner.state.groups.get_mut(gid) {
                group.snapshot_ts = group.snapshot_ts.max(*ts);
            }
        }
        if let Some(member) = &proposal.member {
            self.apply_member(&mut inner, member.clone());
        }
        if let Some(tablet) = &proposal.tablet {
            Self::apply_tablet(&mut inner, tablet.clone());
        }
        if index > 0 {
            inner.state.counter = index;
        }
        Ok(())
    }

    fn validate(&self, inner: &Inner, proposal: &Proposal) -> Result<()> {
        let state = &inner.state;
        if proposal.max_raft_id > 0 && proposal.max_raft_id <= state.max_raft_id {
            return Err(Error::InvalidProposal(format!(
                "max raft id {} does not exceed {}",
                proposal.max_raft_id, state.max_raft_id
            )));
        }
        if let Some(member) = &proposal.member {
            if member.group_id != 0 && !member.am_dead {
                if let Some(group) = state.groups.get(&member.group_id) {
                    if !group.members.contains_key(&member.id)
                        && group.members.len() >= self.replicas
                    {
                        return Err(Error::InvalidProposal(format!(
                            "group {} already has {} replicas",
                            member.group_id, self.replicas
                        )));
                    }
                }
            }
        }
        if let Some(tablet) = &proposal.tablet {
            if tablet.group_id == 0 {
                return Err(Error::InvalidProposal(format!(
                    "tablet {} has group id zero",
                    tablet.predicate
                )));
            }
            if !tablet.remove && !tablet.force {
                if let Some(prev) = state.serving_tablet(&tablet.predicate) {
                    if prev.group_id != tablet.group_id {
                        return Err(Error::TabletAlreadyServed {
                            predicate: tablet.predicate.clone(),
                            group: prev.group_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_member(&self, inner: &mut Inner, member: Member) {
        if member.group_id == 0 {
            if member.am_dead {
                if let Some(old) = inner.state.zeros.remove(&member.id) {
                    self.registry.remove(&old.addr);
                    inner.state.removed.push(old);
                }
                return;
            }
            if member.leader {
                for other in inner.state.zeros.values_mut() {
                    other.leader = false;
                }
            }
            inner.state.zeros.insert(member.id, member);
            return;
        }

        let gid = member.group_id;
        let group = inner.state.groups.entry(gid).or_insert_with(Group::default);
        if member.am_dead {
            if let Some(old) = group.members.remove(&member.id) {
                info!(id = old.id, group = gid, addr = %old.addr, "Removed member");
                self.registry.remove(&old.addr);
                inner.state.removed.push(old);
            }
            return;
        }

        self.registry.connect(&member.addr);
        if member.leader {
            for other in group.members.values_mut() {
                other.leader = false;
            }
        }
        debug!(id = member.id, group = gid, addr = %member.addr, "Applied member");
        group.members.insert(member.id, member);
        let filled = group.members.len() >= self.replicas;

        if gid == inner.next_group && filled {
            inner.next_group += 1;
        }
        // Replayed logs may reference groups beyond the counter.
        if inner.next_group <= gid {
            inner.next_group = gid + 1;
        }
    }

    fn apply_tablet(inner: &mut Inner, mut tablet: Tablet) {
        let gid = tablet.group_id;
        if tablet.remove {
            info!(predicate = %tablet.predicate, group = gid, "Removing tablet");
            if let Some(group) = inner.state.groups.get_mut(&gid) {
                group.tablets.remove(&tablet.predicate);
            }
            return;
        }

        if tablet.force {
            let owner = inner
                .state
                .serving_tablet(&tablet.predicate)
                .map(|t| t.group_id);
            if let Some(owner) = owner.filter(|owner| *owner != gid) {
                info!(predicate = %tablet.predicate, from = owner, to = gid, "Moving tablet");
                if let Some(group) = inner.state.groups.get_mut(&owner) {
                    group.tablets.remove(&tablet.predicate);
                }
            }
        }

        tablet.force = false;
        inner
            .state
            .groups
            .entry(gid)
            .or_insert_with(Group::default)
            .tablets
            .insert(tablet.predicate.clone(), tablet);
        if inner.next_group <= gid {
            inner.next_group = gid + 1;
        }
    }
}
