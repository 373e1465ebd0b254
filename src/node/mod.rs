//! Managed Node Module
//!
//! The contract an elector drives (`Node`) and the identity record each
//! participant publishes (`NodeSpec`).

mod spec;
pub mod dummy;

pub use spec::NodeSpec;
pub use dummy::DummyNode;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::lifecycle::Done;

/// Role a managed node currently plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Started, no leader observed yet
    Candidate,
    /// Node is the cluster leader
    Leader,
    /// Node is a follower
    Follower,
    /// Node was forced to shed its duties
    Fenced,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Fenced => write!(f, "FENCED"),
        }
    }
}

/// A service instance whose role is driven by an elector
#[async_trait]
pub trait Node: Send + Sync {
    /// Name of the managed daemon, used in log fields
    fn daemon(&self) -> &str {
        "node"
    }

    /// Name of this participant
    fn name(&self) -> &str;

    /// Current identity, used as the campaign value
    fn spec(&self) -> NodeSpec;

    /// Become the leader
    async fn lead(&self, ctx: CancellationToken, leader: NodeSpec) -> Result<()>;

    /// Follow `leader`
    async fn follow(&self, ctx: CancellationToken, leader: NodeSpec) -> Result<()>;

    /// Shed every leader duty immediately
    async fn stonith(&self, ctx: CancellationToken) -> Result<()>;

    /// Fires when the node stops on its own
    fn stop(&self) -> Done;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Leader.to_string(), "LEADER");
        assert_eq!(Role::Fenced.to_string(), "FENCED");
    }
}
