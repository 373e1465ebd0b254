//! Managed Proxy Module
//!
//! The contract an observer publishes membership to (`Proxy`) and an
//! in-process traffic router implementing it.

mod router;

pub use router::{RoutingProxy, RoutingStats};

use async_trait::async_trait;

use crate::error::Result;
use crate::lifecycle::Done;
use crate::node::NodeSpec;

/// A traffic routing collaborator fed with cluster membership
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Replace the routed membership with `leader` and `followers`
    async fn publish(&self, leader: Option<NodeSpec>, followers: Vec<NodeSpec>) -> Result<()>;

    /// Fires when the proxy stops on its own
    fn done(&self) -> Done;
}
