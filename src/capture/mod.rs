//! Local media capture
//!
//! Tracks, the device-access seam and the controller-owned capture state.

pub mod devices;
pub mod local;
pub mod track;

pub use devices::{CaptureRequest, MediaDevices};
pub use local::LocalCapture;
pub use track::{MediaTrack, RemoteTrackBackend, TrackBackend};
