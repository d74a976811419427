//! Wire messages exchanged with the signaling server
//!
//! Every message is an envelope `{"event": "<kebab-name>", "data": {...}}`
//! with camelCase payload fields.

use crate::forwarding::capabilities::{RtpCapabilities, RtpParameters};
use crate::forwarding::engine::DtlsParameters;
use crate::rtc::{IceCandidate, SessionDescription};
use crate::types::{
    ConsumerId, MediaKind, MediaSource, PeerId, ProducerId, RoomId, TransportDirection,
    TransportId,
};
use serde::{Deserialize, Serialize};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalRequest {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    Offer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    GetCapabilities { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        room_id: RoomId,
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: MediaSource,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    CloseConsumer { consumer_id: ConsumerId },
}

impl SignalRequest {
    /// Wire name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            SignalRequest::JoinRoom { .. } => "join-room",
            SignalRequest::LeaveRoom { .. } => "leave-room",
            SignalRequest::Offer { .. } => "offer",
            SignalRequest::Answer { .. } => "answer",
            SignalRequest::IceCandidate { .. } => "ice-candidate",
            SignalRequest::GetCapabilities { .. } => "get-capabilities",
            SignalRequest::CreateTransport { .. } => "create-transport",
            SignalRequest::ConnectTransport { .. } => "connect-transport",
            SignalRequest::Produce { .. } => "produce",
            SignalRequest::Consume { .. } => "consume",
            SignalRequest::ResumeConsumer { .. } => "resume-consumer",
            SignalRequest::PauseProducer { .. } => "pause-producer",
            SignalRequest::ResumeProducer { .. } => "resume-producer",
            SignalRequest::CloseProducer { .. } => "close-producer",
            SignalRequest::CloseConsumer { .. } => "close-consumer",
        }
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    Offer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        peer_id: PeerId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        #[serde(default)]
        peer_id: Option<PeerId>,
        #[serde(default)]
        kind: Option<MediaKind>,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: ConsumerId },
}

/// Ack of `join-room`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub self_id: PeerId,
    #[serde(default)]
    pub peers: Vec<PeerId>,
}

/// Ack of `produce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceAck {
    pub id: ProducerId,
}
