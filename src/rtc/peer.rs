//! webrtc-rs backed [`PeerNegotiator`]
//!
//! Each local [`MediaTrack`] is published through a `TrackLocalStaticSample`
//! sender; the capture pipeline pushes encoded frames with
//! [`WebRtcNegotiator::write_sample`]. Remote tracks surface as
//! [`EngineEvent::RemoteTrack`] on the session input queue.

use crate::capture::MediaTrack;
use crate::errors::{Result, SessionError};
use crate::events::{EngineEvent, InputSender, SessionInput};
use crate::rtc::{
    BundlePolicy, ConnectionState, IceCandidate, IceServer, IceTransportPolicy,
    PeerNegotiator, PeerNegotiatorFactory, RtcConfiguration, SdpType, SessionDescription,
};
use crate::types::{MediaKind, PeerId, TrackId};
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use ::webrtc::api::{APIBuilder, API};
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::media::Sample;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use ::webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use ::webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use ::webrtc::track::track_local::TrackLocal;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const STREAM_ID: &str = "crabmeet";

fn negotiation_error(context: &str, error: impl std::fmt::Display) -> SessionError {
    SessionError::Negotiation(format!("{}: {}", context, error))
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = SessionError;

    fn try_from(desc: SessionDescription) -> Result<Self> {
        match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(SessionError::Negotiation(
                    "rollback descriptions are not supported".to_string(),
                ))
            }
        }
        .map_err(|e| negotiation_error("invalid SDP", e))
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

fn rtc_configuration(config: &RtcConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.ice_servers.iter().cloned().map(Into::into).collect(),
        ice_transport_policy: match config.ice_transport_policy {
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
        },
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        ..Default::default()
    }
}

/// Builds one webrtc-rs peer connection per remote participant.
pub struct WebRtcNegotiatorFactory {
    api: API,
}

impl WebRtcNegotiatorFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation_error("failed to register codecs", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| negotiation_error("failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerNegotiatorFactory for WebRtcNegotiatorFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        config: &RtcConfiguration,
        events: InputSender,
    ) -> Result<Arc<dyn PeerNegotiator>> {
        let connection = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(config))
                .await
                .map_err(|e| negotiation_error("failed to create peer connection", e))?,
        );

        let negotiator = WebRtcNegotiator {
            peer_id: peer_id.clone(),
            connection,
            senders: Mutex::new(HashMap::new()),
        };
        negotiator.install_callbacks(events);
        Ok(Arc::new(negotiator))
    }
}

struct LocalSender {
    sample_track: Arc<TrackLocalStaticSample>,
    rtp_sender: Arc<RTCRtpSender>,
}

pub struct WebRtcNegotiator {
    peer_id: PeerId,
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackId, LocalSender>>,
}

impl WebRtcNegotiator {
    fn install_callbacks(&self, events: InputSender) {
        let candidate_sink = events.clone();
        let peer_id = self.peer_id.clone();
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            log::debug!("ICE candidate gathered for peer {}", peer_id);
                            let _ = candidate_sink.send(SessionInput::Engine(
                                EngineEvent::LocalIceCandidate {
                                    peer_id: peer_id.clone(),
                                    candidate: IceCandidate {
                                        candidate: json.candidate,
                                        sdp_mid: json.sdp_mid,
                                        sdp_mline_index: json.sdp_mline_index,
                                    },
                                },
                            ));
                        }
                        Err(e) => log::warn!("Unserializable candidate for {}: {}", peer_id, e),
                    }
                }
                Box::pin(async {})
            }));

        let state_sink = events.clone();
        let peer_id = self.peer_id.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let _ = state_sink.send(SessionInput::Engine(EngineEvent::PeerConnectionState {
                    peer_id: peer_id.clone(),
                    state: state.into(),
                }));
                Box::pin(async {})
            }));

        let peer_id = self.peer_id.clone();
        self.connection
            .on_track(Box::new(move |remote, _receiver, _transceiver| {
                let kind = match remote.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    RTPCodecType::Unspecified => None,
                };
                if let Some(kind) = kind {
                    let track = MediaTrack::remote(kind, remote.id());
                    let _ = events.send(SessionInput::Engine(EngineEvent::RemoteTrack {
                        peer_id: peer_id.clone(),
                        track,
                    }));
                }
                Box::pin(async {})
            }));
    }

    /// Push one encoded frame of a local track to the remote peer.
    pub async fn write_sample(&self, track_id: &TrackId, data: Bytes, duration: Duration) -> Result<()> {
        let sample_track = self
            .senders
            .lock()
            .get(track_id)
            .map(|s| s.sample_track.clone())
            .ok_or_else(|| SessionError::InvalidState(format!("track {} is not sent", track_id)))?;

        sample_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| negotiation_error("failed to write sample", e))
    }

    fn sample_track(track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            STREAM_ID.to_string(),
        ))
    }
}

#[async_trait]
impl PeerNegotiator for WebRtcNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        log::info!("Creating SDP offer for peer {}", self.peer_id);
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error("failed to create offer", e))?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error("failed to set local description", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        log::info!("Creating SDP answer for peer {}", self.peer_id);
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error("failed to create answer", e))?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation_error("failed to set local description", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = RTCSessionDescription::try_from(description)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| negotiation_error("failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        log::debug!("Adding ICE candidate for peer {}", self.peer_id);
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| negotiation_error("failed to add ICE candidate", e))
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let sample_track = Self::sample_track(track);
        let rtp_sender = self
            .connection
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| negotiation_error("failed to add track", e))?;

        self.senders.lock().insert(
            track.id().clone(),
            LocalSender {
                sample_track,
                rtp_sender,
            },
        );
        Ok(())
    }

    async fn replace_track(&self, old: &TrackId, new: &MediaTrack) -> Result<()> {
        let rtp_sender = self
            .senders
            .lock()
            .get(old)
            .map(|s| s.rtp_sender.clone())
            .ok_or_else(|| SessionError::InvalidState(format!("track {} is not sent", old)))?;

        let sample_track = Self::sample_track(new);
        rtp_sender
            .replace_track(Some(
                Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .map_err(|e| negotiation_error("failed to replace track", e))?;

        let mut senders = self.senders.lock();
        senders.remove(old);
        senders.insert(
            new.id().clone(),
            LocalSender {
                sample_track,
                rtp_sender,
            },
        );
        Ok(())
    }

    async fn remove_track(&self, track: &TrackId) -> Result<()> {
        let removed = self.senders.lock().remove(track);
        match removed {
            Some(sender) => self
                .connection
                .remove_track(&sender.rtp_sender)
                .await
                .map_err(|e| negotiation_error("failed to remove track", e)),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.connection
            .close()
            .await
            .map_err(|e| negotiation_error("failed to close peer connection", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
    }

    #[test]
    fn test_rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(RTCSessionDescription::try_from(desc).is_err());
    }

    #[tokio::test]
    async fn test_offer_contains_local_tracks() {
        let factory = WebRtcNegotiatorFactory::new().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let negotiator = factory
            .create(&PeerId::from("bob"), &RtcConfiguration { ice_servers: vec![], ..Default::default() }, tx)
            .await
            .unwrap();

        negotiator
            .add_track(&MediaTrack::remote(MediaKind::Video, "camera"))
            .await
            .unwrap();
        let offer = negotiator.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        negotiator.close().await.unwrap();
    }
}
