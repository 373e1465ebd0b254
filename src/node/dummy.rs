//! Dummy Node
//!
//! A managed node with no real service behind it. It records the role it
//! has been told to play, which makes it useful for demos and smoke tests
//! of a cluster's election wiring.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{Node, NodeSpec, Role};
use crate::error::Result;
use crate::lifecycle::Done;

/// Node that only tracks its role
pub struct DummyNode {
    /// Identity
    spec: NodeSpec,
    /// Current role
    role: RwLock<Role>,
    /// Leader last followed or led
    leader: RwLock<Option<NodeSpec>>,
    /// Fired when the node stops
    stop: CancellationToken,
}

impl DummyNode {
    /// Create a new dummy node
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            role: RwLock::new(Role::Candidate),
            leader: RwLock::new(None),
            stop: CancellationToken::new(),
        }
    }

    /// Get the current role
    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    /// Get the leader this node knows about
    pub async fn leader(&self) -> Option<NodeSpec> {
        self.leader.read().await.clone()
    }

    /// Stop the node on its own initiative
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl Node for DummyNode {
    fn daemon(&self) -> &str {
        "dummy"
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn spec(&self) -> NodeSpec {
        self.spec.clone()
    }

    async fn lead(&self, _ctx: CancellationToken, leader: NodeSpec) -> Result<()> {
        tracing::info!("{} promoted to LEADER", self.spec.name);
        *self.role.write().await = Role::Leader;
        *self.leader.write().await = Some(leader);
        Ok(())
    }

    async fn follow(&self, _ctx: CancellationToken, leader: NodeSpec) -> Result<()> {
        tracing::info!("{} following {}", self.spec.name, leader);
        *self.role.write().await = Role::Follower;
        *self.leader.write().await = Some(leader);
        Ok(())
    }

    async fn stonith(&self, _ctx: CancellationToken) -> Result<()> {
        tracing::warn!("{} fenced", self.spec.name);
        *self.role.write().await = Role::Fenced;
        self.stop.cancel();
        Ok(())
    }

    fn stop(&self) -> Done {
        self.stop.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dummy_transitions() {
        let node = DummyNode::new(NodeSpec::new("dummy-1", "127.0.0.1", 5432));
        let other = NodeSpec::new("dummy-2", "127.0.0.2", 5432);
        assert_eq!(node.role().await, Role::Candidate);

        node.follow(CancellationToken::new(), other.clone()).await.unwrap();
        assert_eq!(node.role().await, Role::Follower);
        assert_eq!(node.leader().await, Some(other));

        node.lead(CancellationToken::new(), node.spec()).await.unwrap();
        assert_eq!(node.role().await, Role::Leader);
        assert!(!node.stop().is_done());

        node.stonith(CancellationToken::new()).await.unwrap();
        assert_eq!(node.role().await, Role::Fenced);
        assert!(node.stop().is_done());
    }
}
