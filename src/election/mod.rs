//! Leader Election Module
//!
//! Electors race for leadership of a domain/cluster on behalf of a managed
//! node; observers follow the same election to keep a proxy's membership
//! view current. Both recover from session loss through the shared
//! reconnect policy.

pub mod elector;
pub mod membership;
pub mod observer;
pub mod reconnect;

pub use elector::{Elector, Transition};
pub use membership::{MembershipSet, MembershipSnapshot, MembershipSummary};
pub use observer::Observer;
pub use reconnect::Backoff;
