//! Seams to the consensus engine and the transaction oracle.

use crate::common::Result;
use crate::coordinator::state::Proposal;
use std::sync::atomic::{AtomicU64, Ordering};

/// Agrees on and applies proposals.
///
/// `propose_and_wait` returns once the proposal is durably committed and
/// applied to the membership state, or fails. Dropping the returned future
/// only stops the wait; an entry already submitted still applies.
#[async_trait::async_trait]
pub trait ConsensusGateway: Send + Sync {
    async fn propose_and_wait(&self, proposal: Proposal) -> Result<()>;

    /// Remove a coordinator (group 0) peer from the consensus group.
    async fn remove_peer(&self, node_id: u64) -> Result<()>;

    /// Current leader as seen by this node.
    fn leader_id(&self) -> Option<u64>;

    fn is_leader(&self) -> bool;

    /// Wait until everything committed before the call has been applied
    /// locally.
    async fn wait_linearizable_read(&self) -> Result<()>;
}

/// Source of the pending-transaction ceiling reported to info-only Connect
/// callers.
pub trait PendingTxnSource: Send + Sync {
    fn max_pending(&self) -> u64;
}

impl PendingTxnSource for AtomicU64 {
    fn max_pending(&self) -> u64 {
        self.load(Ordering::Acquire)
    }
}
