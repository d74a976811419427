//! Shared identifiers and small enums used across the session layer.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

opaque_id!(
    /// Room/session identifier, set on join and cleared on leave.
    RoomId
);
opaque_id!(
    /// Remote (or local) participant identifier.
    PeerId
);
opaque_id!(
    /// Server-assigned transport id.
    TransportId
);
opaque_id!(
    /// Server-assigned producer id.
    ProducerId
);
opaque_id!(
    /// Server-assigned consumer id.
    ConsumerId
);
opaque_id!(
    /// Locally generated media track id.
    TrackId
);

impl TrackId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Where a track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    #[serde(rename = "mic")]
    Microphone,
    Camera,
    Screen,
    /// Received from another participant.
    Remote,
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Microphone => write!(f, "mic"),
            MediaSource::Camera => write!(f, "camera"),
            MediaSource::Screen => write!(f, "screen"),
            MediaSource::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// One peer connection per remote participant.
    Mesh,
    /// One uplink and one downlink transport to a forwarding server.
    Forwarding,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Mesh
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    #[serde(rename = "recv")]
    Receive,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Receive => write!(f, "recv"),
        }
    }
}

/// Camera facing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

impl Default for FacingMode {
    fn default() -> Self {
        FacingMode::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_transparent_on_the_wire() {
        let id = ProducerId::new("p-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"p-1\"");
        assert_eq!(id.to_string(), "p-1");
    }

    #[test]
    fn test_generated_track_ids_are_unique() {
        assert_ne!(TrackId::generate(), TrackId::generate());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&MediaSource::Microphone).unwrap(),
            "\"mic\""
        );
        assert_eq!(
            serde_json::to_string(&TransportDirection::Receive).unwrap(),
            "\"recv\""
        );
    }

    #[test]
    fn test_facing_mode_opposite() {
        assert_eq!(FacingMode::User.opposite(), FacingMode::Environment);
        assert_eq!(FacingMode::Environment.opposite(), FacingMode::User);
    }
}
