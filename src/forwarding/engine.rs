//! Media engine seam for forwarding mode
//!
//! The engine owns the actual ICE/DTLS/RTP machinery; this crate drives it
//! and relays its parameters through signaling.

use crate::capture::MediaTrack;
use crate::errors::Result;
use crate::events::InputSender;
use crate::forwarding::capabilities::{RtpCapabilities, RtpCodecCapability, RtpParameters};
use crate::quality::RtpEncoding;
use crate::types::{ConsumerId, MediaKind, ProducerId, TrackId, TransportDirection, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default = "default_dtls_role")]
    pub role: String,
    pub fingerprints: Vec<DtlsFingerprint>,
}

fn default_dtls_role() -> String {
    "auto".to_string()
}

/// Ack of `create-transport`: everything the engine needs to build one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    #[serde(default)]
    pub ice_parameters: serde_json::Value,
    #[serde(default)]
    pub ice_candidates: Vec<serde_json::Value>,
    pub dtls_parameters: DtlsParameters,
}

/// Ack of `consume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[async_trait]
pub trait ForwardingEngine: Send + Sync {
    /// Codecs the local engine can send and receive.
    fn local_capabilities(&self) -> RtpCapabilities;

    /// Build the engine side of a transport. Connection-state changes are
    /// reported as [`crate::EngineEvent::TransportConnectionState`].
    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: &TransportOptions,
        events: InputSender,
    ) -> Result<Arc<dyn TransportEngine>>;
}

#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Local DTLS parameters to relay on first connect.
    fn dtls_parameters(&self) -> DtlsParameters;

    /// Start sending a track; returns the RTP parameters for the `produce` request.
    async fn send(
        &self,
        track: &MediaTrack,
        codec: &RtpCodecCapability,
        encodings: &[RtpEncoding],
    ) -> Result<RtpParameters>;

    async fn replace_track(&self, old: &TrackId, new: &MediaTrack) -> Result<()>;

    async fn stop_sending(&self, track: &TrackId) -> Result<()>;

    /// Start receiving a consumer; returns the remote track.
    async fn receive(&self, options: &ConsumerOptions) -> Result<MediaTrack>;

    async fn stop_receiving(&self, consumer: &ConsumerId) -> Result<()>;

    async fn close(&self);
}
