use crate::capture::MediaTrack;
use crate::errors::{Result, SessionError};
use crate::events::{EngineEvent, InputSender, SessionInput};
use crate::forwarding::capabilities::{
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
use crate::forwarding::engine::{
    ConsumerOptions, DtlsFingerprint, DtlsParameters, ForwardingEngine, TransportEngine,
    TransportOptions,
};
use crate::forwarding::transport::TransportState;
use crate::quality::RtpEncoding;
use crate::rtc::{
    ConnectionState, IceCandidate, PeerNegotiator, PeerNegotiatorFactory, RtcConfiguration,
    SessionDescription,
};
use crate::types::{ConsumerId, MediaKind, PeerId, TrackId, TransportDirection, TransportId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Opus and VP8, what a typical forwarding server offers.
pub fn default_capabilities() -> RtpCapabilities {
    RtpCapabilities::new(vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()])
}

pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities::new(vec![RtpCodecCapability::opus()])
}

#[derive(Default)]
struct NegotiatorState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    tracks: Vec<TrackId>,
    offers: usize,
    closed: bool,
    fail_offers: bool,
    reject_remote: bool,
    reject_replace: bool,
}

/// Negotiator that produces placeholder SDP and records every call.
///
/// Like a real engine it refuses candidates before a remote description.
pub struct FakeNegotiator {
    peer_id: PeerId,
    events: Option<InputSender>,
    state: Mutex<NegotiatorState>,
}

impl FakeNegotiator {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            events: None,
            state: Mutex::new(NegotiatorState::default()),
        }
    }

    pub fn with_events(mut self, events: InputSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.state.lock().reject_remote = reject;
    }

    pub fn reject_replace(&self, reject: bool) {
        self.state.lock().reject_replace = reject;
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.state.lock().tracks.clone()
    }

    pub fn offer_count(&self) -> usize {
        self.state.lock().offers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn send(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionInput::Engine(event));
        }
    }

    /// Simulate media arriving from the peer.
    pub fn emit_remote_track(&self, kind: MediaKind) -> MediaTrack {
        let track = MediaTrack::remote(kind, format!("{} from {}", kind, self.peer_id));
        self.send(EngineEvent::RemoteTrack {
            peer_id: self.peer_id.clone(),
            track: track.clone(),
        });
        track
    }

    pub fn emit_state(&self, state: ConnectionState) {
        self.send(EngineEvent::PeerConnectionState {
            peer_id: self.peer_id.clone(),
            state,
        });
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        self.send(EngineEvent::LocalIceCandidate {
            peer_id: self.peer_id.clone(),
            candidate,
        });
    }
}

#[async_trait]
impl PeerNegotiator for FakeNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.fail_offers {
            return Err(SessionError::Negotiation(format!(
                "offer to {} refused",
                self.peer_id
            )));
        }
        state.offers += 1;
        let offer = SessionDescription::offer(format!(
            "v=0 offer #{} tracks={}",
            state.offers,
            state.tracks.len()
        ));
        state.local = Some(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(SessionError::Negotiation(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        let answer = SessionDescription::answer(format!("v=0 answer tracks={}", state.tracks.len()));
        state.local = Some(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        if state.reject_remote {
            return Err(SessionError::Negotiation(
                "remote description rejected".to_string(),
            ));
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(SessionError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.state.lock().tracks.push(track.id().clone());
        Ok(())
    }

    async fn replace_track(&self, old: &TrackId, new: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock();
        if state.reject_replace {
            return Err(SessionError::Negotiation("track replacement refused".to_string()));
        }
        match state.tracks.iter_mut().find(|t| *t == old) {
            Some(slot) => {
                *slot = new.id().clone();
                Ok(())
            }
            None => Err(SessionError::InvalidState(format!(
                "track {} is not being sent",
                old
            ))),
        }
    }

    async fn remove_track(&self, track: &TrackId) -> Result<()> {
        self.state.lock().tracks.retain(|t| t != track);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    created: HashMap<PeerId, Vec<Arc<FakeNegotiator>>>,
    fail_create: HashSet<PeerId>,
    fail_offers: HashSet<PeerId>,
    reject_replace: HashSet<PeerId>,
}

/// Hands out [`FakeNegotiator`]s and keeps every one it created.
#[derive(Default)]
pub struct FakeNegotiatorFactory {
    state: Mutex<FactoryState>,
}

impl FakeNegotiatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create_for(&self, peer_id: &str) {
        self.state.lock().fail_create.insert(PeerId::from(peer_id));
    }

    pub fn fail_offers_for(&self, peer_id: &str) {
        self.state.lock().fail_offers.insert(PeerId::from(peer_id));
    }

    pub fn reject_replace_for(&self, peer_id: &str) {
        self.state.lock().reject_replace.insert(PeerId::from(peer_id));
    }

    /// The most recent negotiator created for `peer_id`.
    pub fn latest(&self, peer_id: &str) -> Option<Arc<FakeNegotiator>> {
        self.state
            .lock()
            .created
            .get(&PeerId::from(peer_id))
            .and_then(|all| all.last().cloned())
    }

    pub fn created_for(&self, peer_id: &str) -> Vec<Arc<FakeNegotiator>> {
        self.state
            .lock()
            .created
            .get(&PeerId::from(peer_id))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerNegotiatorFactory for FakeNegotiatorFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        _config: &RtcConfiguration,
        events: InputSender,
    ) -> Result<Arc<dyn PeerNegotiator>> {
        let mut state = self.state.lock();
        if state.fail_create.contains(peer_id) {
            return Err(SessionError::Negotiation(format!(
                "cannot create a connection for {}",
                peer_id
            )));
        }
        let negotiator = FakeNegotiator::new(peer_id.clone()).with_events(events);
        negotiator.fail_offers(state.fail_offers.contains(peer_id));
        negotiator.reject_replace(state.reject_replace.contains(peer_id));
        let negotiator = Arc::new(negotiator);
        state
            .created
            .entry(peer_id.clone())
            .or_default()
            .push(negotiator.clone());
        Ok(negotiator)
    }
}

#[derive(Default)]
struct TransportRecord {
    sending: Vec<TrackId>,
    receiving: Vec<ConsumerId>,
    replaced: Vec<(TrackId, TrackId)>,
    closed: bool,
    reject_replace: bool,
}

/// One side of a fake forwarding connection.
pub struct FakeTransportEngine {
    id: TransportId,
    direction: TransportDirection,
    events: InputSender,
    record: Mutex<TransportRecord>,
}

impl FakeTransportEngine {
    pub fn id(&self) -> &TransportId {
        &self.id
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn sending(&self) -> Vec<TrackId> {
        self.record.lock().sending.clone()
    }

    pub fn receiving(&self) -> Vec<ConsumerId> {
        self.record.lock().receiving.clone()
    }

    pub fn replaced(&self) -> Vec<(TrackId, TrackId)> {
        self.record.lock().replaced.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.record.lock().closed
    }

    pub fn reject_replace(&self, reject: bool) {
        self.record.lock().reject_replace = reject;
    }

    /// Report a connection-state change as the engine would.
    pub fn emit_state(&self, state: TransportState) {
        let _ = self
            .events
            .send(SessionInput::Engine(EngineEvent::TransportConnectionState {
                transport_id: self.id.clone(),
                state,
            }));
    }
}

#[async_trait]
impl TransportEngine for FakeTransportEngine {
    fn dtls_parameters(&self) -> DtlsParameters {
        DtlsParameters {
            role: "client".to_string(),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "12:34:56".to_string(),
            }],
        }
    }

    async fn send(
        &self,
        track: &MediaTrack,
        codec: &RtpCodecCapability,
        encodings: &[RtpEncoding],
    ) -> Result<RtpParameters> {
        let mut record = self.record.lock();
        record.sending.push(track.id().clone());
        Ok(RtpParameters {
            mid: Some(record.sending.len().to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(100),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
            }],
            encodings: encodings.to_vec(),
        })
    }

    async fn replace_track(&self, old: &TrackId, new: &MediaTrack) -> Result<()> {
        let mut record = self.record.lock();
        if record.reject_replace {
            return Err(SessionError::TransportFailed(
                "sender refused the new track".to_string(),
            ));
        }
        match record.sending.iter_mut().find(|t| *t == old) {
            Some(slot) => *slot = new.id().clone(),
            None => {
                return Err(SessionError::InvalidState(format!(
                    "track {} is not being sent",
                    old
                )))
            }
        }
        record.replaced.push((old.clone(), new.id().clone()));
        Ok(())
    }

    async fn stop_sending(&self, track: &TrackId) -> Result<()> {
        self.record.lock().sending.retain(|t| t != track);
        Ok(())
    }

    async fn receive(&self, options: &ConsumerOptions) -> Result<MediaTrack> {
        self.record.lock().receiving.push(options.id.clone());
        Ok(MediaTrack::remote(
            options.kind,
            format!("consumer {} of {}", options.id, options.producer_id),
        ))
    }

    async fn stop_receiving(&self, consumer: &ConsumerId) -> Result<()> {
        self.record.lock().receiving.retain(|c| c != consumer);
        Ok(())
    }

    async fn close(&self) {
        self.record.lock().closed = true;
    }
}

/// Forwarding engine whose transports are [`FakeTransportEngine`]s.
pub struct FakeForwardingEngine {
    capabilities: Mutex<RtpCapabilities>,
    transports: Mutex<Vec<Arc<FakeTransportEngine>>>,
}

impl Default for FakeForwardingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeForwardingEngine {
    /// Opus, VP8 and H264 locally.
    pub fn new() -> Self {
        Self {
            capabilities: Mutex::new(RtpCapabilities::new(vec![
                RtpCodecCapability::opus(),
                RtpCodecCapability::vp8(),
                RtpCodecCapability::h264(),
            ])),
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn set_local_capabilities(&self, capabilities: RtpCapabilities) {
        *self.capabilities.lock() = capabilities;
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransportEngine>> {
        self.transports.lock().clone()
    }

    fn latest(&self, direction: TransportDirection) -> Option<Arc<FakeTransportEngine>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.direction == direction)
            .cloned()
    }

    pub fn send_transport(&self) -> Option<Arc<FakeTransportEngine>> {
        self.latest(TransportDirection::Send)
    }

    pub fn recv_transport(&self) -> Option<Arc<FakeTransportEngine>> {
        self.latest(TransportDirection::Receive)
    }
}

#[async_trait]
impl ForwardingEngine for FakeForwardingEngine {
    fn local_capabilities(&self) -> RtpCapabilities {
        self.capabilities.lock().clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: &TransportOptions,
        events: InputSender,
    ) -> Result<Arc<dyn TransportEngine>> {
        let transport = Arc::new(FakeTransportEngine {
            id: options.id.clone(),
            direction,
            events,
            record: Mutex::new(TransportRecord::default()),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}
