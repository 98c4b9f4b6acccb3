//! Fleet coordination: the coordinator that drives the authoritative
//! engine, the transport seam it speaks through, and the subordinate-side
//! mirror that follows it.

pub mod coordinator;
pub mod mirror;
pub mod transport;

pub use coordinator::{Coordinator, CoordinatorSettings};
pub use mirror::{FollowFleet, MirrorDelegate, NodeMirror};
pub use transport::{TransitionAck, Transport};
