use crate::capture::MediaTrack;
use crate::errors::Result;
use crate::quality::VideoConstraints;
use async_trait::async_trait;

/// What to capture from the user's devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl CaptureRequest {
    pub fn audio_video(video: VideoConstraints) -> Self {
        Self {
            audio: true,
            video: Some(video),
        }
    }

    pub fn video_only(video: VideoConstraints) -> Self {
        Self {
            audio: false,
            video: Some(video),
        }
    }
}

/// Capture device access (the `getUserMedia`/`getDisplayMedia` equivalent).
///
/// Implementations fail with [`crate::SessionError::Device`] when permission
/// is denied or no suitable device exists.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Tracks for the request: at most one audio and one camera track.
    async fn get_user_media(&self, request: &CaptureRequest) -> Result<Vec<MediaTrack>>;

    /// A display-capture track with source [`crate::MediaSource::Screen`].
    async fn get_display_media(&self) -> Result<MediaTrack>;

    async fn video_input_count(&self) -> Result<usize>;
}
