use crate::capture::MediaTrack;
use crate::errors::{Result, SessionError};
use crate::mesh::ice_queue::IceCandidateQueue;
use crate::rtc::PeerNegotiator;
use crate::types::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerLinkState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

/// Which side of the current offer/answer round we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Connection to one remote participant in a mesh session.
pub struct PeerLink {
    peer_id: PeerId,
    /// Identifies this incarnation; a replaced link gets a new id.
    link_id: Uuid,
    role: NegotiationRole,
    state: PeerLinkState,
    negotiator: Arc<dyn PeerNegotiator>,
    ice_queue: IceCandidateQueue,
    /// Serializes description/candidate application.
    ice_apply: Arc<tokio::sync::Mutex<()>>,
    negotiation_started: Option<Instant>,
    /// Local tracks changed mid-round; offer again once connected.
    renegotiation_pending: bool,
    created_at: DateTime<Utc>,
    remote_tracks: Vec<MediaTrack>,
}

impl PeerLink {
    pub fn new(
        peer_id: PeerId,
        role: NegotiationRole,
        negotiator: Arc<dyn PeerNegotiator>,
        ice_queue: IceCandidateQueue,
    ) -> Self {
        Self {
            peer_id,
            link_id: Uuid::new_v4(),
            role,
            state: PeerLinkState::Idle,
            negotiator,
            ice_queue,
            ice_apply: Arc::new(tokio::sync::Mutex::new(())),
            negotiation_started: None,
            renegotiation_pending: false,
            created_at: Utc::now(),
            remote_tracks: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn link_id(&self) -> Uuid {
        self.link_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn set_role(&mut self, role: NegotiationRole) {
        self.role = role;
    }

    pub fn state(&self) -> PeerLinkState {
        self.state
    }

    pub fn negotiator(&self) -> &Arc<dyn PeerNegotiator> {
        &self.negotiator
    }

    pub fn ice_queue(&self) -> &IceCandidateQueue {
        &self.ice_queue
    }

    pub fn ice_queue_mut(&mut self) -> &mut IceCandidateQueue {
        &mut self.ice_queue
    }

    pub fn ice_apply(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.ice_apply.clone()
    }

    pub fn remote_tracks(&self) -> &[MediaTrack] {
        &self.remote_tracks
    }

    pub fn add_remote_track(&mut self, track: MediaTrack) {
        self.remote_tracks.push(track);
    }

    pub fn take_remote_tracks(&mut self) -> Vec<MediaTrack> {
        std::mem::take(&mut self.remote_tracks)
    }

    pub fn request_renegotiation(&mut self) {
        self.renegotiation_pending = true;
    }

    pub fn take_renegotiation(&mut self) -> bool {
        std::mem::take(&mut self.renegotiation_pending)
    }

    /// How long the current negotiation round has been running.
    pub fn negotiating_for(&self) -> Option<std::time::Duration> {
        self.negotiation_started.map(|started| started.elapsed())
    }

    pub fn transition(&mut self, next: PeerLinkState) -> Result<()> {
        use PeerLinkState::*;

        let allowed = match (self.state, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Negotiating) => true,
            (Negotiating, Connected) | (Negotiating, Failed) => true,
            (Connected, Negotiating) | (Connected, Failed) => true,
            _ => false,
        };
        if !allowed {
            return Err(SessionError::InvalidState(format!(
                "peer link {}: {:?} -> {:?}",
                self.peer_id, self.state, next
            )));
        }

        log::info!("Peer {}: {:?} -> {:?}", self.peer_id, self.state, next);
        self.negotiation_started = (next == Negotiating).then(Instant::now);
        self.state = next;
        Ok(())
    }

    pub fn info(&self) -> PeerLinkInfo {
        PeerLinkInfo {
            peer_id: self.peer_id.clone(),
            link_id: self.link_id,
            role: self.role,
            state: self.state,
            queued_candidates: self.ice_queue.len(),
            renegotiation_pending: self.renegotiation_pending,
            remote_tracks: self.remote_tracks.len(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLinkInfo {
    pub peer_id: PeerId,
    pub link_id: Uuid,
    pub role: NegotiationRole,
    pub state: PeerLinkState,
    pub queued_candidates: usize,
    pub renegotiation_pending: bool,
    pub remote_tracks: usize,
    pub created_at: DateTime<Utc>,
}
