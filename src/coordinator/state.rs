//! Membership data model
//!
//! Stores:
//! - Members (node id → address, group, leader flag)
//! - Groups (replica set, tablet ownership, snapshot timestamp)
//! - Removed-member history and the highest Raft id ever issued
//!
//! Maps are ordered so the bincode wire form is deterministic and a snapshot
//! round-trips byte for byte.

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One physical node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    pub id: u64,
    pub group_id: u32,
    pub addr: String,
    pub leader: bool,
    pub am_dead: bool,
    pub last_update: u64,
    /// Request flag: the caller only wants the current topology.
    pub cluster_info_only: bool,
}

impl Member {
    pub fn new(id: u64, group_id: u32, addr: impl Into<String>) -> Self {
        Self {
            id,
            group_id,
            addr: addr.into(),
            ..Default::default()
        }
    }
}

/// One data partition, keyed by predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tablet {
    pub group_id: u32,
    pub predicate: String,
    pub space: i64,
    pub remove: bool,
    /// One-shot reassignment hint, never persisted as set.
    pub force: bool,
}

impl Tablet {
    pub fn new(predicate: impl Into<String>, group_id: u32) -> Self {
        Self {
            group_id,
            predicate: predicate.into(),
            ..Default::default()
        }
    }

    pub fn with_space(mut self, space: i64) -> Self {
        self.space = space;
        self
    }
}

/// A replication group: its replica set and the tablets it owns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub members: BTreeMap<u64, Member>,
    pub tablets: BTreeMap<String, Tablet>,
    pub snapshot_ts: u64,
}

impl Group {
    /// Total space of the tablets owned by this group.
    pub fn size(&self) -> i64 {
        self.tablets.values().map(|t| t.space).sum()
    }

    pub fn leader(&self) -> Option<&Member> {
        self.members.values().find(|m| m.leader)
    }
}

/// The whole-cluster snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipState {
    /// Index of the last applied consensus entry.
    pub counter: u64,
    pub groups: BTreeMap<u32, Group>,
    pub zeros: BTreeMap<u64, Member>,
    pub max_raft_id: u64,
    pub removed: Vec<Member>,
}

impl MembershipState {
    /// Encode to the wire/persisted form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire/persisted form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Member (zero or data) registered with this address.
    pub fn member_by_addr(&self, addr: &str) -> Option<&Member> {
        self.zeros
            .values()
            .chain(self.groups.values().flat_map(|g| g.members.values()))
            .find(|m| m.addr == addr)
    }

    /// Data member with this id, in whichever group holds it.
    pub fn find_member(&self, id: u64) -> Option<&Member> {
        self.groups.values().find_map(|g| g.members.get(&id))
    }

    /// Current owner of a tablet key.
    pub fn serving_tablet(&self, predicate: &str) -> Option<&Tablet> {
        self.groups.values().find_map(|g| g.tablets.get(predicate))
    }

    pub fn has_leader(&self, group_id: u32) -> bool {
        self.groups
            .get(&group_id)
            .is_some_and(|g| g.leader().is_some())
    }

    /// Was this id removed from a data group? Such ids are never reused.
    pub fn is_removed(&self, id: u64) -> bool {
        self.removed.iter().any(|m| m.group_id != 0 && m.id == id)
    }

    /// Members of a group, with group 0 meaning the zeros.
    pub fn members_of(&self, group_id: u32) -> Option<&BTreeMap<u64, Member>> {
        if group_id == 0 {
            Some(&self.zeros)
        } else {
            self.groups.get(&group_id).map(|g| &g.members)
        }
    }
}

/// One mutation submitted to consensus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Proposal {
    pub member: Option<Member>,
    pub tablet: Option<Tablet>,
    pub max_raft_id: u64,
    pub snapshot_ts: BTreeMap<u32, u64>,
}

impl Proposal {
    pub fn member(member: Member) -> Self {
        Self {
            member: Some(member),
            ..Default::default()
        }
    }

    pub fn tablet(tablet: Tablet) -> Self {
        Self {
            tablet: Some(tablet),
            ..Default::default()
        }
    }

    pub fn snapshot(group_id: u32, ts: u64) -> Self {
        Self {
            snapshot_ts: BTreeMap::from([(group_id, ts)]),
            ..Default::default()
        }
    }
}

/// Response to a Connect request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionState {
    pub state: MembershipState,
    pub member: Option<Member>,
    pub max_pending: u64,
}
