use crate::capture::{CaptureRequest, MediaDevices, MediaTrack, TrackBackend};
use crate::errors::{Result, SessionError};
use crate::quality::VideoConstraints;
use crate::types::{MediaKind, MediaSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Backend of every track handed out by [`FakeMediaDevices`].
pub struct FakeTrackBackend {
    reject_constraints: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl FakeTrackBackend {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackBackend for FakeTrackBackend {
    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<()> {
        if self.reject_constraints.load(Ordering::SeqCst) {
            return Err(SessionError::ConstraintRejected(format!(
                "{}x{}@{} not supported",
                constraints.width, constraints.height, constraints.frame_rate
            )));
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Capture devices that always succeed unless told otherwise.
pub struct FakeMediaDevices {
    cameras: AtomicUsize,
    microphone: AtomicBool,
    permission_denied: AtomicBool,
    display_denied: AtomicBool,
    reject_constraints: Arc<AtomicBool>,
    requests: Mutex<Vec<CaptureRequest>>,
    issued: Mutex<Vec<MediaTrack>>,
}

impl Default for FakeMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMediaDevices {
    /// Two cameras and a microphone.
    pub fn new() -> Self {
        Self::with_cameras(2)
    }

    pub fn with_cameras(count: usize) -> Self {
        Self {
            cameras: AtomicUsize::new(count),
            microphone: AtomicBool::new(true),
            permission_denied: AtomicBool::new(false),
            display_denied: AtomicBool::new(false),
            reject_constraints: Arc::new(AtomicBool::new(false)),
            requests: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn set_camera_count(&self, count: usize) {
        self.cameras.store(count, Ordering::SeqCst);
    }

    pub fn set_microphone(&self, present: bool) {
        self.microphone.store(present, Ordering::SeqCst);
    }

    pub fn deny_permission(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    pub fn deny_display(&self, denied: bool) {
        self.display_denied.store(denied, Ordering::SeqCst);
    }

    /// Make every issued track refuse constraint changes.
    pub fn reject_constraints(&self, reject: bool) {
        self.reject_constraints.store(reject, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.requests.lock().clone()
    }

    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().clone()
    }

    fn issue(&self, kind: MediaKind, source: MediaSource, label: String) -> MediaTrack {
        let backend = Arc::new(FakeTrackBackend {
            reject_constraints: self.reject_constraints.clone(),
            stopped: AtomicBool::new(false),
        });
        let track = MediaTrack::new(kind, source, label, backend);
        self.issued.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(&self, request: &CaptureRequest) -> Result<Vec<MediaTrack>> {
        self.requests.lock().push(*request);
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(SessionError::Device("permission denied".to_string()));
        }
        if request.video.is_some() && self.cameras.load(Ordering::SeqCst) == 0 {
            return Err(SessionError::Device("no camera found".to_string()));
        }
        if request.audio && !self.microphone.load(Ordering::SeqCst) {
            return Err(SessionError::Device("no microphone found".to_string()));
        }

        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(self.issue(
                MediaKind::Audio,
                MediaSource::Microphone,
                "Fake microphone".to_string(),
            ));
        }
        if let Some(constraints) = request.video {
            let facing = constraints.facing_mode.unwrap_or_default();
            let track = self.issue(
                MediaKind::Video,
                MediaSource::Camera,
                format!("Fake camera ({:?})", facing),
            );
            tracks.push(track.with_constraints(constraints));
        }
        Ok(tracks)
    }

    async fn get_display_media(&self) -> Result<MediaTrack> {
        if self.display_denied.load(Ordering::SeqCst) {
            return Err(SessionError::Device("screen capture denied".to_string()));
        }
        Ok(self.issue(
            MediaKind::Video,
            MediaSource::Screen,
            "Fake screen".to_string(),
        ))
    }

    async fn video_input_count(&self) -> Result<usize> {
        Ok(self.cameras.load(Ordering::SeqCst))
    }
}
