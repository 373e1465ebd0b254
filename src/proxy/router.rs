//! Routing Proxy
//!
//! Routes writes to the leader and load balances reads across followers,
//! falling back to the leader when there are none. Membership is replaced
//! wholesale on every publish.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::Proxy;
use crate::error::{Error, Result};
use crate::lifecycle::Done;
use crate::node::NodeSpec;

/// Routing table installed by the last publish
#[derive(Debug, Default)]
struct Routes {
    leader: Option<NodeSpec>,
    followers: Vec<NodeSpec>,
    updated_at: Option<DateTime<Utc>>,
}

/// In-process traffic router
pub struct RoutingProxy {
    /// Router name, used in logs
    name: String,
    /// Current routes
    routes: RwLock<Routes>,
    /// Round-robin counter for read distribution
    read_counter: AtomicUsize,
    /// Successful publishes
    publishes: AtomicU64,
    /// Fired on shutdown
    done: CancellationToken,
}

impl RoutingProxy {
    /// Create a router with no routes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: RwLock::new(Routes::default()),
            read_counter: AtomicUsize::new(0),
            publishes: AtomicU64::new(0),
            done: CancellationToken::new(),
        }
    }

    /// Node that receives writes
    pub async fn write_node(&self) -> Option<NodeSpec> {
        self.routes.read().await.leader.clone()
    }

    /// Node for the next read (round-robin across followers).
    /// Falls back to the leader if there are no followers.
    pub async fn read_node(&self) -> Option<NodeSpec> {
        let routes = self.routes.read().await;
        if routes.followers.is_empty() {
            return routes.leader.clone();
        }

        let idx = self.read_counter.fetch_add(1, Ordering::Relaxed) % routes.followers.len();
        routes.followers.get(idx).cloned()
    }

    /// Stop routing; fires the done signal
    pub fn shutdown(&self) {
        if !self.done.is_cancelled() {
            tracing::info!("routing proxy {} shutting down", self.name);
        }
        self.done.cancel();
    }

    /// Get stats about the routing state
    pub async fn stats(&self) -> RoutingStats {
        let routes = self.routes.read().await;
        RoutingStats {
            leader_endpoint: routes.leader.as_ref().map(|l| l.endpoint()),
            read_endpoints: routes.followers.iter().map(|f| f.endpoint()).collect(),
            total_reads_routed: self.read_counter.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            updated_at: routes.updated_at,
        }
    }
}

#[async_trait]
impl Proxy for RoutingProxy {
    async fn publish(&self, leader: Option<NodeSpec>, followers: Vec<NodeSpec>) -> Result<()> {
        if self.done.is_cancelled() {
            return Err(Error::Proxy(format!("{} is shut down", self.name)));
        }

        tracing::info!(
            "{}: leader {}, {} read nodes",
            self.name,
            leader.as_ref().map(|l| l.to_string()).unwrap_or_else(|| "<none>".into()),
            followers.len()
        );

        let mut routes = self.routes.write().await;
        routes.leader = leader;
        routes.followers = followers;
        routes.updated_at = Some(Utc::now());
        self.publishes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn done(&self) -> Done {
        self.done.clone().into()
    }
}

/// Statistics about routing state
#[derive(Debug, Clone)]
pub struct RoutingStats {
    /// Endpoint of the current leader (for writes)
    pub leader_endpoint: Option<String>,
    /// Endpoints of read nodes
    pub read_endpoints: Vec<String>,
    /// Total reads routed (round-robin counter)
    pub total_reads_routed: usize,
    /// Successful publishes
    pub publishes: u64,
    /// When routes last changed
    pub updated_at: Option<DateTime<Utc>>,
}
