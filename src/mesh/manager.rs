//! Mesh-mode session: one negotiated peer connection per remote participant.

use crate::capture::{LocalCapture, MediaTrack};
use crate::errors::{ErrorScope, Result, SessionError};
use crate::events::{EngineEvent, EventEmitter, InputSender, SessionEvent};
use crate::mesh::ice_queue::{IceCandidateQueue, QueueOutcome};
use crate::mesh::peer_link::{NegotiationRole, PeerLink, PeerLinkInfo, PeerLinkState};
use crate::rtc::{
    ConnectionState, IceCandidate, PeerNegotiator, PeerNegotiatorFactory, RtcConfiguration,
    SessionDescription,
};
use crate::signaling::{JoinAck, ServerEvent, SignalRequest, Signaling};
use crate::types::{PeerId, RoomId, TrackId};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Candidates held per peer before a link exists; extras are dropped.
const MAX_EARLY_CANDIDATES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshState {
    Idle,
    Joining,
    Joined,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSnapshot {
    pub state: MeshState,
    pub room_id: Option<RoomId>,
    pub self_id: Option<PeerId>,
    pub links: Vec<PeerLinkInfo>,
}

struct MeshSlot {
    state: MeshState,
    room: Option<RoomId>,
    self_id: Option<PeerId>,
    epoch: u64,
    links: HashMap<PeerId, PeerLink>,
    /// Candidates from peers we have no link for yet.
    early_candidates: HashMap<PeerId, EarlyCandidates>,
    /// Local tracks every link sends.
    outgoing: Vec<MediaTrack>,
}

struct EarlyCandidates {
    queue: IceCandidateQueue,
    first_seen: Instant,
}

impl MeshSlot {
    fn link(&self, peer_id: &PeerId, link_id: Uuid) -> Option<&PeerLink> {
        self.links.get(peer_id).filter(|l| l.link_id() == link_id)
    }

    fn link_mut(&mut self, peer_id: &PeerId, link_id: Uuid) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id).filter(|l| l.link_id() == link_id)
    }
}

enum OfferPlan {
    Fresh,
    Yield,
    KeepOurs,
    Renegotiate(Uuid, Arc<dyn PeerNegotiator>),
}

fn stale_link(peer_id: &PeerId) -> SessionError {
    SessionError::InvalidState(format!("link to {} was replaced or closed", peer_id))
}

pub struct MeshSessionManager {
    signaling: Signaling,
    factory: Arc<dyn PeerNegotiatorFactory>,
    rtc_config: RtcConfiguration,
    emitter: EventEmitter,
    inputs: InputSender,
    negotiation_timeout: Duration,
    slot: Mutex<MeshSlot>,
}

impl MeshSessionManager {
    pub fn new(
        signaling: Signaling,
        factory: Arc<dyn PeerNegotiatorFactory>,
        rtc_config: RtcConfiguration,
        emitter: EventEmitter,
        inputs: InputSender,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            signaling,
            factory,
            rtc_config,
            emitter,
            inputs,
            negotiation_timeout,
            slot: Mutex::new(MeshSlot {
                state: MeshState::Idle,
                room: None,
                self_id: None,
                epoch: 0,
                links: HashMap::new(),
                early_candidates: HashMap::new(),
                outgoing: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> MeshState {
        self.slot.lock().state
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.slot.lock().room.clone()
    }

    pub fn self_id(&self) -> Option<PeerId> {
        self.slot.lock().self_id.clone()
    }

    pub fn link_state(&self, peer_id: &PeerId) -> Option<PeerLinkState> {
        self.slot.lock().links.get(peer_id).map(PeerLink::state)
    }

    pub fn link_info(&self, peer_id: &PeerId) -> Option<PeerLinkInfo> {
        self.slot.lock().links.get(peer_id).map(PeerLink::info)
    }

    /// Candidates held for `peer_id` before its link exists.
    pub fn early_candidate_count(&self, peer_id: &PeerId) -> usize {
        self.slot
            .lock()
            .early_candidates
            .get(peer_id)
            .map_or(0, |early| early.queue.len())
    }

    pub fn link_count(&self) -> usize {
        self.slot.lock().links.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.slot.lock().links.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn is_joined(&self) -> bool {
        self.slot.lock().state == MeshState::Joined
    }

    fn ensure_link(&self, peer_id: &PeerId, link_id: Uuid) -> Result<()> {
        match self.slot.lock().link(peer_id, link_id) {
            Some(_) => Ok(()),
            None => Err(stale_link(peer_id)),
        }
    }

    /// Join the room and offer to everybody already in it.
    ///
    /// Only the join round-trip itself can fail the call; a peer that cannot
    /// be reached is reported as a peer warning.
    pub async fn join(&self, room_id: RoomId, capture: &LocalCapture) -> Result<()> {
        let epoch = {
            let mut slot = self.slot.lock();
            if slot.state != MeshState::Idle {
                return Err(SessionError::InvalidState(format!(
                    "cannot join from state {:?}",
                    slot.state
                )));
            }
            slot.state = MeshState::Joining;
            slot.room = Some(room_id.clone());
            slot.outgoing = capture.tracks();
            slot.epoch
        };
        log::info!("Joining mesh room {}", room_id);

        let ack: JoinAck = self
            .signaling
            .call(SignalRequest::JoinRoom {
                room_id: room_id.clone(),
            })
            .await?;

        let peers: Vec<PeerId> = {
            let mut slot = self.slot.lock();
            if slot.epoch != epoch || slot.state != MeshState::Joining {
                return Err(SessionError::InvalidState(
                    "mesh session closed while joining".to_string(),
                ));
            }
            slot.state = MeshState::Joined;
            slot.self_id = Some(ack.self_id.clone());
            ack.peers
                .into_iter()
                .filter(|p| *p != ack.self_id)
                .collect()
        };
        log::info!(
            "Joined mesh room {} as {} with {} peer(s) present",
            room_id,
            ack.self_id,
            peers.len()
        );

        join_all(peers.into_iter().map(|peer| self.connect_to(peer))).await;
        Ok(())
    }

    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::PeerJoined { peer_id } => self.handle_peer_joined(peer_id).await,
            ServerEvent::PeerLeft { peer_id } => self.handle_peer_left(&peer_id).await,
            ServerEvent::Offer { peer_id, sdp } => self.handle_offer(peer_id, sdp).await,
            ServerEvent::Answer { peer_id, sdp } => self.handle_answer(peer_id, sdp).await,
            ServerEvent::IceCandidate { peer_id, candidate } => {
                self.handle_ice_candidate(peer_id, candidate).await
            }
            other => log::debug!("Ignoring forwarding event in mesh mode: {:?}", other),
        }
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::LocalIceCandidate { peer_id, candidate } => {
                self.handle_local_candidate(peer_id, candidate).await
            }
            EngineEvent::PeerConnectionState { peer_id, state } => {
                self.handle_connection_state(&peer_id, state).await
            }
            EngineEvent::RemoteTrack { peer_id, track } => {
                self.handle_remote_track(&peer_id, track)
            }
            other => log::debug!("Ignoring engine event in mesh mode: {:?}", other),
        }
    }

    pub async fn handle_peer_joined(&self, peer_id: PeerId) {
        if !self.is_joined() || self.self_id().as_ref() == Some(&peer_id) {
            return;
        }
        log::info!("Peer {} joined", peer_id);
        self.connect_to(peer_id).await;
    }

    /// Create a link as offerer and send the offer.
    async fn connect_to(&self, peer_id: PeerId) {
        let (link_id, negotiator) = match self.open_link(&peer_id, NegotiationRole::Offerer).await
        {
            Ok(link) => link,
            Err(e) => {
                self.report_open_failure(&peer_id, &e);
                return;
            }
        };
        if let Err(e) = self.send_offer(&peer_id, link_id, negotiator).await {
            self.fail_peer(&peer_id, link_id, &e).await;
        }
    }

    fn report_open_failure(&self, peer_id: &PeerId, error: &SessionError) {
        if self.is_joined() {
            self.emitter.error(error, ErrorScope::Peer);
        } else {
            log::debug!("Not opening link to {}: {}", peer_id, error);
        }
    }

    /// Build a fresh link for `peer_id`, destroying any existing one first.
    async fn open_link(
        &self,
        peer_id: &PeerId,
        role: NegotiationRole,
    ) -> Result<(Uuid, Arc<dyn PeerNegotiator>)> {
        let (epoch, previous, outgoing) = {
            let mut slot = self.slot.lock();
            if slot.state != MeshState::Joined {
                return Err(SessionError::InvalidState(
                    "mesh session is not joined".to_string(),
                ));
            }
            (slot.epoch, slot.links.remove(peer_id), slot.outgoing.clone())
        };
        if let Some(previous) = previous {
            log::info!("Replacing existing link to {}", peer_id);
            self.destroy_link(previous).await;
        }

        let negotiator = self
            .factory
            .create(peer_id, &self.rtc_config, self.inputs.clone())
            .await?;
        for track in &outgoing {
            if let Err(e) = negotiator.add_track(track).await {
                let _ = negotiator.close().await;
                return Err(e);
            }
        }

        let installed = {
            let mut slot = self.slot.lock();
            if slot.epoch == epoch && slot.state == MeshState::Joined {
                let queue = slot
                    .early_candidates
                    .remove(peer_id)
                    .map(|early| early.queue)
                    .unwrap_or_default();
                let mut link = PeerLink::new(peer_id.clone(), role, negotiator.clone(), queue);
                link.transition(PeerLinkState::Negotiating)?;
                let link_id = link.link_id();
                Some((link_id, slot.links.insert(peer_id.clone(), link)))
            } else {
                None
            }
        };

        match installed {
            Some((link_id, displaced)) => {
                if let Some(displaced) = displaced {
                    self.destroy_link(displaced).await;
                }
                Ok((link_id, negotiator))
            }
            None => {
                let _ = negotiator.close().await;
                Err(stale_link(peer_id))
            }
        }
    }

    async fn send_offer(
        &self,
        peer_id: &PeerId,
        link_id: Uuid,
        negotiator: Arc<dyn PeerNegotiator>,
    ) -> Result<()> {
        let offer = negotiator.create_offer().await?;
        self.ensure_link(peer_id, link_id)?;

        self.signaling
            .send(SignalRequest::Offer {
                peer_id: peer_id.clone(),
                sdp: offer,
            })
            .await?;
        self.ensure_link(peer_id, link_id)?;
        log::info!("Sent offer to {}", peer_id);
        Ok(())
    }

    pub async fn handle_offer(&self, peer_id: PeerId, sdp: SessionDescription) {
        let plan = {
            let slot = self.slot.lock();
            if slot.state != MeshState::Joined {
                log::debug!("Ignoring offer from {} while not joined", peer_id);
                return;
            }
            match slot.links.get(&peer_id) {
                None => OfferPlan::Fresh,
                Some(link)
                    if link.state() == PeerLinkState::Negotiating
                        && link.role() == NegotiationRole::Offerer =>
                {
                    // Glare: the lexically greater id gives way.
                    match slot.self_id.as_ref() {
                        Some(self_id) if *self_id > peer_id => {
                            log::info!("Offer collision with {}: yielding", peer_id);
                            OfferPlan::Yield
                        }
                        _ => OfferPlan::KeepOurs,
                    }
                }
                Some(link) => OfferPlan::Renegotiate(link.link_id(), link.negotiator().clone()),
            }
        };

        let (link_id, negotiator) = match plan {
            OfferPlan::KeepOurs => {
                log::info!("Offer collision with {}: keeping our offer", peer_id);
                return;
            }
            OfferPlan::Fresh | OfferPlan::Yield => {
                match self.open_link(&peer_id, NegotiationRole::Answerer).await {
                    Ok(link) => link,
                    Err(e) => {
                        self.report_open_failure(&peer_id, &e);
                        return;
                    }
                }
            }
            OfferPlan::Renegotiate(link_id, negotiator) => {
                let mut slot = self.slot.lock();
                let Some(link) = slot.link_mut(&peer_id, link_id) else {
                    return;
                };
                link.set_role(NegotiationRole::Answerer);
                if link.state() == PeerLinkState::Connected {
                    if let Err(e) = link.transition(PeerLinkState::Negotiating) {
                        log::warn!("{}", e);
                        return;
                    }
                }
                (link_id, negotiator)
            }
        };

        if let Err(e) = self.answer(&peer_id, link_id, negotiator, sdp).await {
            self.fail_peer(&peer_id, link_id, &e).await;
        }
    }

    async fn answer(
        &self,
        peer_id: &PeerId,
        link_id: Uuid,
        negotiator: Arc<dyn PeerNegotiator>,
        offer: SessionDescription,
    ) -> Result<()> {
        self.apply_remote_description(peer_id, link_id, &negotiator, offer)
            .await?;
        let answer = negotiator.create_answer().await?;
        self.ensure_link(peer_id, link_id)?;

        self.signaling
            .send(SignalRequest::Answer {
                peer_id: peer_id.clone(),
                sdp: answer,
            })
            .await?;
        log::info!("Sent answer to {}", peer_id);
        self.finish_round(peer_id, link_id, negotiator).await
    }

    pub async fn handle_answer(&self, peer_id: PeerId, sdp: SessionDescription) {
        let (link_id, negotiator) = {
            let slot = self.slot.lock();
            match slot.links.get(&peer_id) {
                Some(link)
                    if link.state() == PeerLinkState::Negotiating
                        && link.role() == NegotiationRole::Offerer =>
                {
                    (link.link_id(), link.negotiator().clone())
                }
                Some(link) => {
                    log::debug!(
                        "Ignoring answer from {} in state {:?} as {:?}",
                        peer_id,
                        link.state(),
                        link.role()
                    );
                    return;
                }
                None => {
                    log::debug!("Ignoring answer from unknown peer {}", peer_id);
                    return;
                }
            }
        };

        let result = match self
            .apply_remote_description(&peer_id, link_id, &negotiator, sdp)
            .await
        {
            Ok(()) => self.finish_round(&peer_id, link_id, negotiator).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.fail_peer(&peer_id, link_id, &e).await;
        }
    }

    /// Set the remote description, then flush queued candidates in arrival order.
    async fn apply_remote_description(
        &self,
        peer_id: &PeerId,
        link_id: Uuid,
        negotiator: &Arc<dyn PeerNegotiator>,
        description: SessionDescription,
    ) -> Result<()> {
        let ice_apply = self
            .slot
            .lock()
            .link(peer_id, link_id)
            .map(PeerLink::ice_apply)
            .ok_or_else(|| stale_link(peer_id))?;
        let _ordered = ice_apply.lock().await;

        negotiator.set_remote_description(description).await?;

        let queued = self
            .slot
            .lock()
            .link_mut(peer_id, link_id)
            .map(|link| link.ice_queue_mut().drain())
            .ok_or_else(|| stale_link(peer_id))?;
        if !queued.is_empty() {
            log::debug!("Applying {} queued candidate(s) from {}", queued.len(), peer_id);
        }
        for candidate in queued {
            if let Err(e) = negotiator.add_ice_candidate(candidate).await {
                log::warn!("Queued candidate from {} rejected: {}", peer_id, e);
            }
        }
        Ok(())
    }

    /// Complete an offer/answer round, then pick up any track change that
    /// arrived while it was in flight.
    async fn finish_round(
        &self,
        peer_id: &PeerId,
        link_id: Uuid,
        negotiator: Arc<dyn PeerNegotiator>,
    ) -> Result<()> {
        if self.mark_connected(peer_id, link_id)? {
            self.renegotiate(peer_id, link_id, negotiator).await?;
        }
        Ok(())
    }

    /// Returns whether a renegotiation was deferred until now.
    fn mark_connected(&self, peer_id: &PeerId, link_id: Uuid) -> Result<bool> {
        let mut slot = self.slot.lock();
        let link = slot
            .link_mut(peer_id, link_id)
            .ok_or_else(|| stale_link(peer_id))?;
        link.transition(PeerLinkState::Connected)?;
        Ok(link.take_renegotiation())
    }

    pub async fn handle_ice_candidate(&self, peer_id: PeerId, candidate: IceCandidate) {
        let (link_id, ice_apply, negotiator) = {
            let mut slot = self.slot.lock();
            if !matches!(slot.state, MeshState::Joining | MeshState::Joined) {
                return;
            }
            match slot.links.get(&peer_id) {
                Some(link) => (link.link_id(), link.ice_apply(), link.negotiator().clone()),
                None => {
                    let early = slot
                        .early_candidates
                        .entry(peer_id.clone())
                        .or_insert_with(|| EarlyCandidates {
                            queue: IceCandidateQueue::new(),
                            first_seen: Instant::now(),
                        });
                    if early.queue.len() >= MAX_EARLY_CANDIDATES {
                        log::warn!("Dropping early candidate from {}: queue full", peer_id);
                    } else {
                        log::debug!("Holding early candidate from {}", peer_id);
                        early.queue.enqueue(candidate);
                    }
                    return;
                }
            }
        };

        let _ordered = ice_apply.lock().await;
        let outcome = {
            let mut slot = self.slot.lock();
            match slot.link_mut(&peer_id, link_id) {
                Some(link) => link.ice_queue_mut().enqueue(candidate),
                None => {
                    log::debug!("Dropping candidate for replaced link to {}", peer_id);
                    return;
                }
            }
        };
        match outcome {
            QueueOutcome::Queued => log::debug!("Queued candidate from {}", peer_id),
            QueueOutcome::ApplyNow(candidate) => {
                if let Err(e) = negotiator.add_ice_candidate(candidate).await {
                    log::warn!("Candidate from {} rejected: {}", peer_id, e);
                }
            }
        }
    }

    pub async fn handle_local_candidate(&self, peer_id: PeerId, candidate: IceCandidate) {
        if !self.slot.lock().links.contains_key(&peer_id) {
            return;
        }
        let result = self
            .signaling
            .notify(SignalRequest::IceCandidate {
                peer_id: peer_id.clone(),
                candidate,
            })
            .await;
        if let Err(e) = result {
            log::warn!("Failed to relay candidate to {}: {}", peer_id, e);
        }
    }

    pub fn handle_remote_track(&self, peer_id: &PeerId, track: MediaTrack) {
        {
            let mut slot = self.slot.lock();
            let Some(link) = slot.links.get_mut(peer_id) else {
                log::debug!("Remote track from unknown peer {}", peer_id);
                return;
            };
            link.add_remote_track(track.clone());
        }
        log::info!("Receiving {} from {}", track.kind(), peer_id);
        self.emitter.emit(SessionEvent::RemoteStreamAdded {
            id: peer_id.to_string(),
            kind: track.kind(),
            track,
        });
    }

    pub async fn handle_connection_state(&self, peer_id: &PeerId, state: ConnectionState) {
        let link_id = match self.slot.lock().links.get(peer_id) {
            Some(link) => link.link_id(),
            None => return,
        };
        match state {
            ConnectionState::Failed => {
                let error =
                    SessionError::Negotiation(format!("ICE connection to {} failed", peer_id));
                self.fail_peer(peer_id, link_id, &error).await;
            }
            ConnectionState::Disconnected => {
                log::warn!("Connection to {} interrupted", peer_id)
            }
            other => log::debug!("Peer {} connection {:?}", peer_id, other),
        }
    }

    pub async fn handle_peer_left(&self, peer_id: &PeerId) {
        let link = {
            let mut slot = self.slot.lock();
            slot.early_candidates.remove(peer_id);
            slot.links.remove(peer_id)
        };
        if let Some(link) = link {
            log::info!("Peer {} left", peer_id);
            self.destroy_link(link).await;
        }
    }

    /// Move one link to `failed` and drop it. Other links are untouched.
    async fn fail_peer(&self, peer_id: &PeerId, link_id: Uuid, error: &SessionError) {
        let link = {
            let mut slot = self.slot.lock();
            match slot.link(peer_id, link_id) {
                Some(_) => slot.links.remove(peer_id),
                None => None,
            }
        };
        let Some(mut link) = link else {
            log::debug!("Ignoring failure of stale link to {}: {}", peer_id, error);
            return;
        };
        if let Err(e) = link.transition(PeerLinkState::Failed) {
            log::debug!("{}", e);
        }
        self.emitter.error(error, ErrorScope::Peer);
        self.destroy_link(link).await;
    }

    async fn destroy_link(&self, mut link: PeerLink) {
        let _ = link.transition(PeerLinkState::Closed);
        if let Err(e) = link.negotiator().close().await {
            log::warn!("Closing link to {} failed: {}", link.peer_id(), e);
        }
        let tracks = link.take_remote_tracks();
        if !tracks.is_empty() {
            for track in &tracks {
                track.stop();
            }
            self.emitter.emit(SessionEvent::RemoteStreamRemoved {
                id: link.peer_id().to_string(),
            });
        }
    }

    /// Fail every link stuck in `negotiating` past the negotiation timeout.
    ///
    /// Early candidates from peers that never opened a link expire on the
    /// same schedule.
    pub async fn expire_stale_negotiations(&self) -> usize {
        let expired: Vec<(PeerId, Uuid)> = {
            let mut slot = self.slot.lock();
            let timeout = self.negotiation_timeout;
            slot.early_candidates.retain(|peer_id, early| {
                let keep = early.first_seen.elapsed() < timeout;
                if !keep {
                    log::debug!(
                        "Discarding {} early candidate(s) from {}",
                        early.queue.len(),
                        peer_id
                    );
                }
                keep
            });
            let stuck = slot
                .links
                .values()
                .filter(|link| {
                    link.state() == PeerLinkState::Negotiating
                        && link
                            .negotiating_for()
                            .is_some_and(|elapsed| elapsed >= timeout)
                })
                .map(|link| (link.peer_id().clone(), link.link_id()))
                .collect();
            stuck
        };

        for (peer_id, link_id) in &expired {
            let error = SessionError::Negotiation(format!(
                "negotiation with {} did not complete within {:?}",
                peer_id, self.negotiation_timeout
            ));
            self.fail_peer(peer_id, *link_id, &error).await;
        }
        expired.len()
    }

    /// Swap `old` for `new` on every link without renegotiating.
    ///
    /// All-or-nothing: if any link refuses, links already switched are
    /// switched back and `old` stays in use.
    pub async fn replace_track(&self, old: &TrackId, new: MediaTrack) -> Result<()> {
        let negotiators: Vec<(PeerId, Arc<dyn PeerNegotiator>)> = {
            let slot = self.slot.lock();
            slot.links
                .values()
                .map(|l| (l.peer_id().clone(), l.negotiator().clone()))
                .collect()
        };

        let results = join_all(
            negotiators
                .iter()
                .map(|(_, negotiator)| negotiator.replace_track(old, &new)),
        )
        .await;

        let previous = {
            let slot = self.slot.lock();
            slot.outgoing.iter().find(|t| t.id() == old).cloned()
        };
        let mut failure = None;
        let mut switched = Vec::new();
        for ((peer_id, negotiator), result) in negotiators.iter().zip(results) {
            match result {
                Ok(()) => switched.push(negotiator.clone()),
                Err(e) => {
                    log::warn!("Peer {} refused track replacement: {}", peer_id, e);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(error) = failure {
            if let Some(previous) = previous {
                for negotiator in switched {
                    let _ = negotiator.replace_track(new.id(), &previous).await;
                }
            }
            return Err(error);
        }

        let mut slot = self.slot.lock();
        if let Some(slot_track) = slot.outgoing.iter_mut().find(|t| t.id() == old) {
            *slot_track = new;
        }
        Ok(())
    }

    /// Send an additional track (screen share) to every peer, renegotiating
    /// connected links.
    pub async fn add_track(&self, track: MediaTrack) -> Result<()> {
        let links = {
            let mut slot = self.slot.lock();
            if slot.state != MeshState::Joined {
                return Err(SessionError::InvalidState(
                    "mesh session is not joined".to_string(),
                ));
            }
            slot.outgoing.push(track.clone());
            self.link_handles(&slot)
        };

        let attached = join_all(links.into_iter().map(|(peer_id, link_id, negotiator)| {
            let track = track.clone();
            async move {
                let result = negotiator.add_track(&track).await;
                (peer_id, link_id, negotiator, result)
            }
        }))
        .await;
        self.renegotiate_all(attached).await;
        Ok(())
    }

    /// Stop sending a track to every peer, renegotiating connected links.
    pub async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        let links = {
            let mut slot = self.slot.lock();
            let before = slot.outgoing.len();
            slot.outgoing.retain(|t| t.id() != track_id);
            if slot.outgoing.len() == before {
                return Ok(());
            }
            self.link_handles(&slot)
        };

        let detached = join_all(links.into_iter().map(|(peer_id, link_id, negotiator)| {
            async move {
                let result = negotiator.remove_track(track_id).await;
                (peer_id, link_id, negotiator, result)
            }
        }))
        .await;
        self.renegotiate_all(detached).await;
        Ok(())
    }

    fn link_handles(&self, slot: &MeshSlot) -> Vec<(PeerId, Uuid, Arc<dyn PeerNegotiator>)> {
        slot.links
            .values()
            .map(|l| (l.peer_id().clone(), l.link_id(), l.negotiator().clone()))
            .collect()
    }

    async fn renegotiate_all(
        &self,
        links: Vec<(PeerId, Uuid, Arc<dyn PeerNegotiator>, Result<()>)>,
    ) {
        join_all(
            links
                .into_iter()
                .map(|(peer_id, link_id, negotiator, result)| async move {
                    let outcome = match result {
                        Ok(()) => self.renegotiate(&peer_id, link_id, negotiator).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = outcome {
                        self.fail_peer(&peer_id, link_id, &e).await;
                    }
                }),
        )
        .await;
    }

    /// Offer again on a connected link. A link mid-negotiation offers again
    /// as soon as its current round completes.
    async fn renegotiate(
        &self,
        peer_id: &PeerId,
        link_id: Uuid,
        negotiator: Arc<dyn PeerNegotiator>,
    ) -> Result<()> {
        {
            let mut slot = self.slot.lock();
            let Some(link) = slot.link_mut(peer_id, link_id) else {
                return Ok(());
            };
            match link.state() {
                PeerLinkState::Connected => {}
                PeerLinkState::Idle | PeerLinkState::Negotiating => {
                    log::debug!("Deferring renegotiation with {} until connected", peer_id);
                    link.request_renegotiation();
                    return Ok(());
                }
                PeerLinkState::Failed | PeerLinkState::Closed => return Ok(()),
            }
            link.set_role(NegotiationRole::Offerer);
            link.transition(PeerLinkState::Negotiating)?;
        }
        log::info!("Renegotiating with {}", peer_id);
        self.send_offer(peer_id, link_id, negotiator).await
    }

    /// Close every link and announce departure. Never fails.
    pub async fn leave(&self) {
        let (room, links) = {
            let mut slot = self.slot.lock();
            if slot.state == MeshState::Closed {
                return;
            }
            slot.epoch += 1;
            slot.state = MeshState::Closed;
            slot.early_candidates.clear();
            slot.outgoing.clear();
            let links: Vec<PeerLink> = slot.links.drain().map(|(_, link)| link).collect();
            (slot.room.take(), links)
        };

        for link in links {
            self.destroy_link(link).await;
        }
        if let Some(room_id) = room {
            if let Err(e) = self
                .signaling
                .notify(SignalRequest::LeaveRoom {
                    room_id: room_id.clone(),
                })
                .await
            {
                log::warn!("Failed to announce leaving {}: {}", room_id, e);
            }
            log::info!("Left mesh room {}", room_id);
        }
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        let slot = self.slot.lock();
        let mut links: Vec<PeerLinkInfo> = slot.links.values().map(PeerLink::info).collect();
        links.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        MeshSnapshot {
            state: slot.state,
            room_id: slot.room.clone(),
            self_id: slot.self_id.clone(),
            links,
        }
    }
}
