//! Mesh session mode
//!
//! Every remote participant gets its own [`PeerLink`], negotiated with
//! offer/answer and trickled ICE relayed through signaling.

pub mod ice_queue;
pub mod manager;
pub mod peer_link;

pub use ice_queue::{IceCandidateQueue, QueueOutcome};
pub use manager::{MeshSessionManager, MeshSnapshot, MeshState};
pub use peer_link::{NegotiationRole, PeerLink, PeerLinkInfo, PeerLinkState};
