//! # minizero
//!
//! Cluster membership coordinator for a sharded, replicated database:
//! - Assigns Raft ids and replication groups to joining nodes
//! - Tracks which group serves each predicate (tablet)
//! - Reconciles group leaders' reports with authoritative state
//! - Streams membership snapshots to subscribers
//! - Rebalances tablets between groups by size
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Coordinator (Zero)            │
//! │  HTTP API ─► Zero service ─► RaftNode    │
//! │                    │            │        │
//! │             ClusterState ◄── apply task  │
//! └──────────────┬───────────────────────────┘
//!                │ connect / report / stream
//!   ┌────────────┴──────┬──────────────┐
//! ┌─▼─────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ Group 1   │   │ Group 2    │   │ Group 3    │
//! │ (tablets) │   │ (tablets)  │   │ (tablets)  │
//! └───────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! minizero-coord serve \
//!   --id 1 \
//!   --bind 0.0.0.0:5080 \
//!   --advertise zero1:5080 \
//!   --replicas 3
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minizero status --coordinator http://localhost:5080
//! minizero connect alpha1:7080 --group 1
//! minizero should-serve name --group 1
//! minizero stream --count 3
//! minizero remove 4 --group 2
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, Zero};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
