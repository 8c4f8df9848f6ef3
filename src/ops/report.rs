//! Human-readable cluster summary

use crate::coordinator::rebalance::{choose_tablet, Move};
use crate::coordinator::state::MembershipState;
use std::fmt;

#[derive(Debug)]
pub struct GroupReport {
    pub group_id: u32,
    pub members: usize,
    pub leader: Option<u64>,
    pub tablets: usize,
    pub space: i64,
    pub snapshot_ts: u64,
}

#[derive(Debug)]
pub struct ClusterReport {
    pub counter: u64,
    pub max_raft_id: u64,
    pub zeros: usize,
    pub zero_leader: Option<u64>,
    pub removed: usize,
    pub groups: Vec<GroupReport>,
    pub next_move: Option<Move>,
}

impl ClusterReport {
    pub fn from_state(state: &MembershipState) -> Self {
        Self {
            counter: state.counter,
            max_raft_id: state.max_raft_id,
            zeros: state.zeros.len(),
            zero_leader: state.zeros.values().find(|m| m.leader).map(|m| m.id),
            removed: state.removed.len(),
            groups: state
                .groups
                .iter()
                .map(|(gid, group)| GroupReport {
                    group_id: *gid,
                    members: group.members.len(),
                    leader: group.leader().map(|m| m.id),
                    tablets: group.tablets.len(),
                    space: group.size(),
                    snapshot_ts: group.snapshot_ts,
                })
                .collect(),
            next_move: choose_tablet(state),
        }
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cluster state (counter {}):", self.counter)?;
        writeln!(f, "  Max Raft id: {}", self.max_raft_id)?;
        match self.zero_leader {
            Some(id) => writeln!(f, "  Coordinators: {} (leader {})", self.zeros, id)?,
            None => writeln!(f, "  Coordinators: {} (no leader)", self.zeros)?,
        }
        writeln!(f, "  Removed nodes: {}", self.removed)?;
        for g in &self.groups {
            let leader = g.leader.map_or_else(|| "-".to_string(), |id| id.to_string());
            writeln!(
                f,
                "  Group {}: {} members, leader {}, {} tablets, {} bytes, snapshot ts {}",
                g.group_id, g.members, leader, g.tablets, g.space, g.snapshot_ts
            )?;
        }
        if let Some(m) = &self.next_move {
            writeln!(
                f,
                "  Next move: {} ({} bytes) from group {} to group {}",
                m.tablet.predicate, m.tablet.space, m.from, m.to
            )?;
        }
        Ok(())
    }
}
