//! Nominee - Leader Election and Membership Sync
//!
//! Turns a passive group of service instances into a self-healing cluster
//! by racing for leadership through a consistent coordination backend.
//!
//! # Architecture
//!
//! An `Elector` campaigns on behalf of one managed node and drives it
//! through lead, follow and stonith transitions as leadership moves. An
//! `Observer` follows the same election without campaigning and republishes
//! the settled membership to a traffic proxy. Both are built on the
//! `Stonither` fail-stop primitive and survive coordination session loss by
//! resuming the election they were part of.
//!
//! # Features
//!
//! - Campaign, observe and resume over a pluggable `Connector`
//! - Complete in-memory coordination backend
//! - Bounded exponential reconnect backoff
//! - Coalesced membership publishing
//! - Dummy node and routing proxy collaborators

pub mod config;
pub mod coordination;
pub mod election;
pub mod error;
pub mod lifecycle;
pub mod node;
pub mod proxy;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use config::NomineeConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::NomineeConfig;
    pub use crate::coordination::{Connector, LeaderRecord, MemoryBackend};
    pub use crate::election::{Elector, Observer};
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::{Done, Stonither};
    pub use crate::node::{Node, NodeSpec};
    pub use crate::proxy::Proxy;
}
