//! Capture quality presets and simulcast layering
//!
//! Quality levels map to resolution/frame-rate constraints applied to the
//! camera track in place; simulcast layers describe the encodings requested
//! for camera video in forwarding mode.

use crate::types::FacingMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
    #[serde(rename = "fullhd")]
    FullHd,
}

impl Default for QualityLevel {
    fn default() -> Self {
        QualityLevel::Medium
    }
}

impl QualityLevel {
    pub fn constraints(self) -> VideoConstraints {
        let (width, height, frame_rate) = match self {
            QualityLevel::Low => (320, 240, 15),
            QualityLevel::Medium => (640, 480, 24),
            QualityLevel::High => (1280, 720, 30),
            QualityLevel::FullHd => (1920, 1080, 30),
        };
        VideoConstraints {
            width,
            height,
            frame_rate,
            facing_mode: None,
        }
    }
}

/// Resolution/frame-rate constraints for a video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub facing_mode: Option<FacingMode>,
}

impl VideoConstraints {
    pub fn with_facing(mut self, facing: FacingMode) -> Self {
        self.facing_mode = Some(facing);
        self
    }
}

/// Individual simulcast layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulcastLayer {
    pub rid: String,                   // RTP Stream ID (f, h, q, etc.)
    pub scale_resolution_down_by: f32, // 1.0 = full resolution
    pub max_bitrate: u32,              // Layer bitrate in bps
    pub max_framerate: u32,            // Layer frame rate
}

/// Simulcast configuration for camera video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulcastConfig {
    pub enabled: bool,
    pub layers: Vec<SimulcastLayer>,
}

impl Default for SimulcastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            layers: vec![
                SimulcastLayer {
                    rid: "q".to_string(), // Quarter resolution
                    scale_resolution_down_by: 4.0,
                    max_bitrate: 150_000,
                    max_framerate: 10,
                },
                SimulcastLayer {
                    rid: "h".to_string(), // Half resolution
                    scale_resolution_down_by: 2.0,
                    max_bitrate: 500_000,
                    max_framerate: 15,
                },
                SimulcastLayer {
                    rid: "f".to_string(), // Full resolution
                    scale_resolution_down_by: 1.0,
                    max_bitrate: 2_000_000,
                    max_framerate: 30,
                },
            ],
        }
    }
}

impl SimulcastConfig {
    /// Encodings for one producer; a single default encoding when simulcast is off.
    pub fn encodings(&self) -> Vec<RtpEncoding> {
        if !self.enabled || self.layers.is_empty() {
            return vec![RtpEncoding::default()];
        }
        self.layers
            .iter()
            .map(|layer| RtpEncoding {
                rid: Some(layer.rid.clone()),
                max_bitrate: Some(layer.max_bitrate),
                max_framerate: Some(layer.max_framerate),
                scale_resolution_down_by: Some(layer.scale_resolution_down_by),
            })
            .collect()
    }
}

/// One RTP encoding of an outgoing track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_framerate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_levels_increase() {
        let low = QualityLevel::Low.constraints();
        let high = QualityLevel::High.constraints();
        assert!(low.width < high.width);
        assert!(low.frame_rate < high.frame_rate);
        assert_eq!(QualityLevel::FullHd.constraints().height, 1080);
    }

    #[test]
    fn test_simulcast_encodings() {
        let config = SimulcastConfig::default();
        let encodings = config.encodings();
        assert_eq!(encodings.len(), 3);
        assert_eq!(encodings[2].rid.as_deref(), Some("f"));

        let disabled = SimulcastConfig {
            enabled: false,
            ..SimulcastConfig::default()
        };
        assert_eq!(disabled.encodings(), vec![RtpEncoding::default()]);
    }

    #[test]
    fn test_encoding_wire_format() {
        let json = serde_json::to_value(RtpEncoding {
            rid: Some("h".into()),
            max_bitrate: Some(500_000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["rid"], "h");
        assert_eq!(json["maxBitrate"], 500_000);
        assert!(json.get("maxFramerate").is_none());
    }
}
