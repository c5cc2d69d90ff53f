//! Cluster Liveness View
//!
//! Node identity and the liveness view consumed from the external membership
//! service. Failure *detection* (gossip, probes, timeouts) happens outside
//! this crate; what arrives here is the already-decided signal "this node is
//! dead", which invalidates every object copy the node held and every
//! attempt it was running.

pub mod types;
pub mod view;


pub use types::{NodeId, NodeState};
pub use view::MembershipView;
