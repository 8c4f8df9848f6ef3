//! Cluster membership coordinator
//!
//! The coordinator is responsible for:
//! - Admitting nodes and assigning Raft ids and groups
//! - Tablet ownership (who serves which predicate)
//! - Reconciling group leaders' reports with authoritative state
//! - Streaming membership snapshots to subscribers
//! - Moving tablets between groups to even out space
//!
//! Every change is committed through consensus before it becomes visible.

pub mod cluster;
pub mod conn;
pub mod consensus;
pub mod http;
pub mod raft_node;
pub mod rebalance;
pub mod server;
pub mod service;
pub mod state;

pub use cluster::ClusterState;
pub use conn::{ConnHandle, ConnPool, ConnectionRegistry, StaticRegistry};
pub use consensus::{ConsensusGateway, PendingTxnSource};
pub use raft_node::RaftNode;
pub use server::Coordinator;
pub use service::Zero;
pub use state::{ConnectionState, Group, Member, MembershipState, Proposal, Tablet};
