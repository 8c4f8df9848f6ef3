//! Connection registry: resolves member addresses to live handles.
//!
//! `ConnPool` keeps one entry per address and probes `/health/live` in the
//! background; an address only resolves once a probe has succeeded.

use crate::common::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Live handle to a cluster member.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    addr: String,
    client: reqwest::Client,
}

impl ConnHandle {
    pub fn new(addr: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            addr: addr.into(),
            client,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn url(&self, path: &str) -> String {
        if self.addr.starts_with("http://") || self.addr.starts_with("https://") {
            format!("{}{}", self.addr, path)
        } else {
            format!("http://{}{}", self.addr, path)
        }
    }

    /// Ping the member's liveness endpoint.
    pub async fn echo(&self) -> Result<()> {
        self.client
            .get(self.url("/health/live"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Registry of network handles to cluster members.
pub trait ConnectionRegistry: Send + Sync {
    /// Start maintaining a handle to `addr`. Idempotent, never blocks.
    fn connect(&self, addr: &str);

    /// Handle to `addr` if it is currently reachable.
    fn resolve(&self, addr: &str) -> Option<ConnHandle>;

    /// Stop maintaining `addr`.
    fn remove(&self, addr: &str);
}

struct Pool {
    handle: ConnHandle,
    healthy: AtomicBool,
}

const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// HTTP connection registry with background health probes.
pub struct ConnPool {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    client: reqwest::Client,
}

impl ConnPool {
    pub fn new(probe_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self {
            pools: RwLock::new(HashMap::new()),
            client,
        }
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    fn spawn_probe(&self, pool: Weak<Pool>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, member probes disabled");
            return;
        };
        runtime.spawn(async move {
            loop {
                // Entry dropped by `remove`.
                let Some(pool) = pool.upgrade() else { break };
                let healthy = pool.handle.echo().await.is_ok();
                let was = pool.healthy.swap(healthy, Ordering::Relaxed);
                if was != healthy {
                    tracing::info!(addr = %pool.handle.addr(), healthy, "Member health changed");
                }
                drop(pool);
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        });
    }
}

impl ConnectionRegistry for ConnPool {
    fn connect(&self, addr: &str) {
        if addr.is_empty() || self.pools.read().contains_key(addr) {
            return;
        }
        let pool = {
            let mut pools = self.pools.write();
            if pools.contains_key(addr) {
                return;
            }
            let pool = Arc::new(Pool {
                handle: ConnHandle::new(addr, self.client.clone()),
                healthy: AtomicBool::new(false),
            });
            pools.insert(addr.to_string(), pool.clone());
            pool
        };
        tracing::debug!(%addr, "Connecting to member");
        self.spawn_probe(Arc::downgrade(&pool));
    }

    fn resolve(&self, addr: &str) -> Option<ConnHandle> {
        self.pools
            .read()
            .get(addr)
            .filter(|p| p.healthy.load(Ordering::Relaxed))
            .map(|p| p.handle.clone())
    }

    fn remove(&self, addr: &str) {
        if self.pools.write().remove(addr).is_some() {
            tracing::debug!(%addr, "Dropped connection to member");
        }
    }
}

/// Registry with explicitly controlled reachability. Every connected address
/// is reachable until marked otherwise.
#[derive(Default)]
pub struct StaticRegistry {
    connected: RwLock<Vec<String>>,
    removed: RwLock<Vec<String>>,
    unreachable: RwLock<HashSet<String>>,
    client: reqwest::Client,
}

impl StaticRegistry {
    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(addr);
        } else {
            unreachable.insert(addr.to_string());
        }
    }

    /// Addresses passed to `connect`, in call order.
    pub fn connected(&self) -> Vec<String> {
        self.connected.read().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.read().clone()
    }
}

impl ConnectionRegistry for StaticRegistry {
    fn connect(&self, addr: &str) {
        self.connected.write().push(addr.to_string());
    }

    fn resolve(&self, addr: &str) -> Option<ConnHandle> {
        let known = self.connected.read().iter().any(|a| a == addr);
        let removed = self.removed.read().iter().any(|a| a == addr);
        if known && !removed && !self.unreachable.read().contains(addr) {
            Some(ConnHandle::new(addr, self.client.clone()))
        } else {
            None
        }
    }

    fn remove(&self, addr: &str) {
        self.removed.write().push(addr.to_string());
    }
}
