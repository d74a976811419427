//! CrabMeet: real-time media session orchestration for group calls
//!
//! Captures local camera/microphone/screen media and keeps it flowing to the
//! other participants of a room in one of two modes:
//!
//! - **Mesh**: one peer connection per remote participant, negotiated with
//!   offer/answer and trickled ICE relayed through signaling.
//! - **Forwarding**: one send and one receive transport to a selective
//!   forwarding server, producing local tracks and consuming remote ones.
//!
//! The signaling socket and the media engine are seams
//! ([`signaling::SignalingChannel`], [`rtc::PeerNegotiatorFactory`],
//! [`forwarding::ForwardingEngine`]) so the orchestration can run against
//! real implementations or the in-process fakes in [`testing`].
//!
//! # Usage
//! ```rust,ignore
//! use crabmeet::{CrabMeetConfig, MediaSessionController};
//!
//! let mut controller = MediaSessionController::builder(CrabMeetConfig::load_or_default())
//!     .devices(devices)
//!     .signaling(channel)
//!     .mesh_engine(negotiators)
//!     .build()?;
//!
//! let mut events = controller.subscribe();
//! controller.start("standup").await?;
//! controller.run_until(shutdown_signal).await;
//! ```
pub mod capture;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod forwarding;
pub mod mesh;
pub mod quality;
pub mod rtc;
pub mod signaling;
pub mod types;

// Fakes for offline testing of both session modes
pub mod testing;

// Re-exports for convenience
pub use capture::{CaptureRequest, LocalCapture, MediaDevices, MediaTrack};
pub use config::CrabMeetConfig;
pub use controller::{
    CaptureSnapshot, ControllerBuilder, MediaSessionController, SessionManager, SessionSnapshot,
};
pub use errors::{ErrorScope, Result, SessionError, SessionErrorKind};
pub use events::{EngineEvent, EventEmitter, InputSender, SessionEvent, SessionInput};
pub use quality::{QualityLevel, SimulcastConfig, VideoConstraints};
pub use signaling::{ServerEvent, SignalRequest, Signaling, SignalingChannel};
pub use types::{
    ConsumerId, FacingMode, MediaKind, MediaSource, PeerId, ProducerId, RoomId, SessionMode,
    TrackId, TransportId,
};

/// Initialize logging for the session layer
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("crabmeet=info");
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        webrtc_engine: cfg!(feature = "webrtc-engine"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Whether the webrtc-rs mesh engine was compiled in
    pub webrtc_engine: bool,
}
