//! RTP capability negotiation against the forwarding server

use crate::errors::{Result, SessionError};
use crate::quality::RtpEncoding;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl RtpCodecCapability {
    pub fn new(kind: MediaKind, mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            clock_rate,
            channels: None,
            preferred_payload_type: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn opus() -> Self {
        Self {
            channels: Some(2),
            ..Self::new(MediaKind::Audio, "audio/opus", 48_000)
        }
    }

    pub fn vp8() -> Self {
        Self::new(MediaKind::Video, "video/VP8", 90_000)
    }

    pub fn h264() -> Self {
        let mut codec = Self::new(MediaKind::Video, "video/H264", 90_000);
        codec
            .parameters
            .insert("packetization-mode".to_string(), 1.into());
        codec
            .parameters
            .insert("profile-level-id".to_string(), "42e01f".into());
        codec
    }

    /// Same codec as far as negotiation is concerned.
    pub fn matches(&self, other: &RtpCodecCapability) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && self.channels.unwrap_or(1) == other.channels.unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
}

impl RtpCapabilities {
    pub fn new(codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            codecs,
            header_extensions: Vec::new(),
        }
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Parameters of one sent or received RTP stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncoding>,
}

/// Capability-negotiation object loaded against the server's capabilities.
///
/// Only codecs both sides support survive; producing or consuming a kind
/// with no surviving codec is refused.
#[derive(Debug, Clone)]
pub struct CapabilityNegotiator {
    negotiated: RtpCapabilities,
}

impl CapabilityNegotiator {
    pub fn load(server: &RtpCapabilities, local: &RtpCapabilities) -> Result<Self> {
        let codecs: Vec<RtpCodecCapability> = server
            .codecs
            .iter()
            .filter(|remote| local.codecs.iter().any(|ours| ours.matches(remote)))
            .cloned()
            .collect();

        if codecs.is_empty() {
            return Err(SessionError::IncompatibleCapabilities(
                "no codec in common with the forwarding server".to_string(),
            ));
        }

        log::info!(
            "Negotiated {} codec(s) with forwarding server: {}",
            codecs.len(),
            codecs
                .iter()
                .map(|c| c.mime_type.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            negotiated: RtpCapabilities {
                codecs,
                header_extensions: server.header_extensions.clone(),
            },
        })
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.negotiated
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        self.negotiated.supports(kind)
    }

    /// Preferred codec for sending `kind`.
    pub fn codec_for(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.negotiated.codecs.iter().find(|c| c.kind == kind)
    }

    /// Whether a stream offered by the server can be decoded locally.
    pub fn can_consume(&self, kind: MediaKind, parameters: &RtpParameters) -> bool {
        let Some(primary) = parameters.codecs.first() else {
            return false;
        };
        self.negotiated.codecs.iter().any(|c| {
            c.kind == kind
                && c.mime_type.eq_ignore_ascii_case(&primary.mime_type)
                && c.clock_rate == primary.clock_rate
        })
    }
}
