//! Tablet rebalancing
//!
//! Periodically moves one tablet from the largest group to the smallest one,
//! but only when the move actually narrows the gap.

use crate::common::{Result, METRICS};
use crate::coordinator::service::Zero;
use crate::coordinator::state::{MembershipState, Proposal, Tablet};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A planned move of `tablet` into `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Move {
    pub tablet: Tablet,
    pub from: u32,
    pub to: u32,
}

/// Pick the tablet to move, if any.
///
/// Source is the largest group by tablet space, destination the smallest.
/// The largest source tablet no bigger than half the difference is chosen,
/// so a move never flips which group is larger.
pub fn choose_tablet(state: &MembershipState) -> Option<Move> {
    if state.groups.len() < 2 {
        return None;
    }
    let sizes: Vec<(u32, i64)> = state
        .groups
        .iter()
        .map(|(gid, group)| (*gid, group.size()))
        .collect();
    let (src, src_size) = sizes.iter().copied().max_by_key(|(_, size)| *size)?;
    let (dst, dst_size) = sizes.iter().copied().min_by_key(|(_, size)| *size)?;
    if src == dst {
        return None;
    }
    let limit = (src_size - dst_size) / 2;
    if limit <= 0 {
        return None;
    }

    let tablet = state.groups[&src]
        .tablets
        .values()
        .filter(|t| !t.remove && t.space > 0 && t.space <= limit)
        .max_by_key(|t| t.space)?;
    Some(Move {
        tablet: tablet.clone(),
        from: src,
        to: dst,
    })
}

/// Carry out one rebalancing round.
pub async fn rebalance_once(zero: &Zero, cancel: &CancellationToken) -> Result<Option<Move>> {
    if !zero.gateway().is_leader() {
        return Ok(None);
    }
    let state = zero.latest_membership_state(cancel).await?;
    let Some(planned) = choose_tablet(&state) else {
        debug!("Cluster balanced, nothing to move");
        return Ok(None);
    };

    info!(
        predicate = %planned.tablet.predicate,
        space = planned.tablet.space,
        from = planned.from,
        to = planned.to,
        "Moving tablet"
    );
    let mut tablet = planned.tablet.clone();
    tablet.group_id = planned.to;
    tablet.force = true;
    zero.propose(Proposal::tablet(tablet), cancel).await?;
    METRICS.tablets_moved.inc();
    Ok(Some(planned))
}

/// Background loop. A zero interval disables rebalancing.
pub fn spawn_rebalancer(zero: Arc<Zero>, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        info!("Tablet rebalancing disabled");
        return None;
    }
    let shutdown = zero.shutdown_token();
    Some(tokio::spawn(async move {
        loop {
            // Jitter so replicas started together do not fire in lockstep.
            let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval + Duration::from_millis(jitter)) => {}
            }
            if let Err(e) = rebalance_once(&zero, &shutdown).await {
                warn!("Rebalance round failed: {}", e);
            }
        }
        debug!("Rebalancer stopped");
    }))
}
