use crate::capture::MediaTrack;
use crate::errors::{Result, SessionError};
use crate::events::InputSender;
use crate::types::{MediaKind, MediaSource, TrackId};

/// Local capture state owned by the controller.
///
/// Holds at most one microphone track, one camera track and one screen
/// track. Screen sharing never touches the camera slot.
#[derive(Debug, Default)]
pub struct LocalCapture {
    audio: Option<MediaTrack>,
    camera: Option<MediaTrack>,
    screen: Option<MediaTrack>,
}

impl LocalCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from freshly acquired user-media tracks.
    pub fn from_tracks(tracks: Vec<MediaTrack>) -> Result<Self> {
        let mut capture = Self::new();
        for track in tracks {
            let slot = match (track.kind(), track.source()) {
                (MediaKind::Audio, _) => &mut capture.audio,
                (MediaKind::Video, MediaSource::Screen) => &mut capture.screen,
                (MediaKind::Video, _) => &mut capture.camera,
            };
            if slot.is_some() {
                return Err(SessionError::Device(format!(
                    "device returned more than one {} track",
                    track.kind()
                )));
            }
            *slot = Some(track);
        }
        Ok(capture)
    }

    pub fn audio(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    pub fn camera(&self) -> Option<&MediaTrack> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&MediaTrack> {
        self.screen.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.camera.is_none() && self.screen.is_none()
    }

    /// Microphone and camera tracks, in that order.
    pub fn user_tracks(&self) -> Vec<MediaTrack> {
        self.audio.iter().chain(self.camera.iter()).cloned().collect()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.audio
            .iter()
            .chain(self.camera.iter())
            .chain(self.screen.iter())
            .cloned()
            .collect()
    }

    /// Which slot holds the track, if any.
    pub fn source_of(&self, track_id: &TrackId) -> Option<MediaSource> {
        if self.audio.as_ref().is_some_and(|t| t.id() == track_id) {
            Some(MediaSource::Microphone)
        } else if self.camera.as_ref().is_some_and(|t| t.id() == track_id) {
            Some(MediaSource::Camera)
        } else if self.screen.as_ref().is_some_and(|t| t.id() == track_id) {
            Some(MediaSource::Screen)
        } else {
            None
        }
    }

    /// Put a new camera track in place and hand back the previous one.
    pub fn replace_camera(&mut self, track: MediaTrack) -> Option<MediaTrack> {
        self.camera.replace(track)
    }

    pub fn set_screen(&mut self, track: MediaTrack) -> Result<()> {
        if self.screen.is_some() {
            return Err(SessionError::InvalidState(
                "a screen track is already active".to_string(),
            ));
        }
        self.screen = Some(track);
        Ok(())
    }

    pub fn take_screen(&mut self) -> Option<MediaTrack> {
        self.screen.take()
    }

    /// Drop a track from whichever slot holds it, without stopping it.
    pub fn remove(&mut self, track_id: &TrackId) -> Option<MediaTrack> {
        for slot in [&mut self.audio, &mut self.camera, &mut self.screen] {
            if slot.as_ref().is_some_and(|t| t.id() == track_id) {
                return slot.take();
            }
        }
        None
    }

    pub fn subscribe_ended(&self, sink: &InputSender) {
        for track in self.tracks() {
            track.subscribe_ended(sink.clone());
        }
    }

    /// Stop and release every track.
    pub fn stop_all(&mut self) {
        for slot in [&mut self.audio, &mut self.camera, &mut self.screen] {
            if let Some(track) = slot.take() {
                track.stop();
            }
        }
    }
}
