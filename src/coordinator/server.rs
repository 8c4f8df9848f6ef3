//! Coordinator server

use crate::common::storage::open_store;
use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::cluster::ClusterState;
use crate::coordinator::conn::{ConnPool, ConnectionRegistry};
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::raft_node::RaftNode;
use crate::coordinator::rebalance::spawn_rebalancer;
use crate::coordinator::service::Zero;
use crate::coordinator::state::Member;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    /// Recover state, become leader of the (single-voter) coordinator group
    /// and serve until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let config = self.config;
        config.validate()?;
        tracing::info!("Starting coordinator: {}", config.node_id);
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  Advertised as: {}", config.advertise_addr);
        tracing::info!("  Storage: {:?} at {}", config.storage, config.db_path.display());
        tracing::info!("  Replicas: {}", config.replicas);

        let store = open_store(config.storage, &config.db_path)?;
        let registry: Arc<dyn ConnectionRegistry> = Arc::new(ConnPool::new(config.probe_timeout()));
        let cluster = Arc::new(ClusterState::new(config.replicas, registry));
        let raft = RaftNode::open(
            config.node_id,
            cluster.clone(),
            store,
            config.snapshot_threshold,
        )?;

        let zero = Arc::new(Zero::new(
            cluster.clone(),
            raft.clone(),
            Arc::new(AtomicU64::new(0)),
            &config,
        ));
        let _watcher = zero.spawn_leadership_watcher(raft.leadership());

        cluster.store_zero(Member::new(config.node_id, 0, config.advertise_addr.clone()));
        let term = raft.campaign();
        let _rebalancer = spawn_rebalancer(zero.clone(), config.rebalance_interval());

        let router = create_router(CoordState { zero: zero.clone() });
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        tracing::info!("Coordinator ready ({}, term {})", raft.get_role(), term);

        let shutdown = zero.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                }
                tracing::info!("Shutdown requested");
                // Open streams end here, letting graceful shutdown finish.
                shutdown.shutdown();
            })
            .await?;

        tracing::info!("Coordinator stopped at index {}", raft.applied_index());
        Ok(())
    }
}
