//! Coordination Backend
//!
//! Contract of the consistent store electors and observers sit on: liveness
//! bound sessions, campaign-based elections, leader observation and prefix
//! watches. The store itself is external; `memory` provides a complete
//! in-process implementation with the same semantics.

pub mod memory;

pub use memory::{MemoryBackend, MemoryConnector};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Done;
use crate::node::NodeSpec;

/// Stream of leader changes
pub type LeaderStream = BoxStream<'static, LeaderRecord>;

/// Stream of key changes under a prefix
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// A stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Key
    pub key: String,
    /// Raw value
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: i64,
    /// Revision of the last modification
    pub mod_revision: i64,
    /// Owning lease (0 = none)
    pub lease: i64,
}

/// The backend's description of the current leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRecord {
    /// Leader's candidate key
    pub key: String,
    /// Marshaled spec of the leader
    pub value: Vec<u8>,
    /// Creation revision; orders candidates and validates resumption
    pub create_revision: i64,
    /// Revision of the last modification
    pub mod_revision: i64,
}

impl LeaderRecord {
    /// Decode the leader's spec, attaching the record key
    pub fn decode(&self) -> Result<NodeSpec> {
        NodeSpec::from_record(&self.key, &self.value)
    }
}

impl From<KeyValue> for LeaderRecord {
    fn from(kv: KeyValue) -> Self {
        Self {
            key: kv.key,
            value: kv.value,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
        }
    }
}

/// Kind of a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Key created or updated
    Put,
    /// Key deleted
    Delete,
}

impl TryFrom<i32> for EventKind {
    type Error = Error;

    /// Decode the wire event type (0 = put, 1 = delete)
    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(EventKind::Put),
            1 => Ok(EventKind::Delete),
            other => Err(Error::Protocol(format!("unknown watch event kind {}", other))),
        }
    }
}

/// A change of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Put or delete
    pub kind: EventKind,
    /// Key state after the change (value is empty for deletes)
    pub kv: KeyValue,
}

/// Key-value access bound to a connection
#[async_trait]
pub trait Client: Send + Sync {
    /// Snapshot of every key under `prefix`
    async fn get_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Changes under `prefix` until `ctx` is cancelled
    fn watch_prefix(&self, ctx: CancellationToken, prefix: &str) -> WatchStream;
}

/// Handle on one election
#[async_trait]
pub trait Election: Send + Sync {
    /// Block until elected or `ctx` is cancelled. On success `value` is the
    /// leader value of the election.
    async fn campaign(&self, ctx: CancellationToken, value: String) -> Result<()>;

    /// Leader changes, current leader first, until `ctx` is cancelled
    fn observe(&self, ctx: CancellationToken) -> LeaderStream;
}

/// Session and election factory for a coordination backend
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a liveness-bound session
    async fn connect(&self, ctx: &CancellationToken, config: &BackendConfig) -> Result<Arc<dyn Client>>;

    /// Start a fresh election handle under `key`
    async fn new_election(&self, ctx: &CancellationToken, key: &str) -> Result<Arc<dyn Election>>;

    /// Rejoin an election this process already took part in
    async fn resume_election(
        &self,
        ctx: &CancellationToken,
        key: &str,
        leader: &LeaderRecord,
    ) -> Result<Arc<dyn Election>>;

    /// Fires when the current session is lost
    fn session_done(&self) -> Done;

    /// Release sessions and connections; safe to call repeatedly
    async fn cleanup(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_codes() {
        assert_eq!(EventKind::try_from(0).unwrap(), EventKind::Put);
        assert_eq!(EventKind::try_from(1).unwrap(), EventKind::Delete);

        let err = EventKind::try_from(7).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_leader_record_decode_attaches_key() {
        let spec = NodeSpec::new("pg-2", "10.0.0.2", 5432);
        let record = LeaderRecord {
            key: "nominee/domain/postgres/cluster/c/1f".into(),
            value: spec.marshal().unwrap().into_bytes(),
            create_revision: 4,
            mod_revision: 4,
        };

        let decoded = record.decode().unwrap();
        assert_eq!(decoded.name, "pg-2");
        assert_eq!(decoded.election_key, record.key);
    }
}
