use crate::errors::{Result, SessionError};
use crate::events::{InputSender, SessionInput};
use crate::quality::VideoConstraints;
use crate::types::{MediaKind, MediaSource, TrackId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Device-side half of a track: whatever actually produces the media.
#[async_trait]
pub trait TrackBackend: Send + Sync {
    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<()>;
    fn stop(&self);
}

/// Backend for tracks received from the network; they cannot be reconfigured.
pub struct RemoteTrackBackend;

#[async_trait]
impl TrackBackend for RemoteTrackBackend {
    async fn apply_constraints(&self, _constraints: &VideoConstraints) -> Result<()> {
        Err(SessionError::ConstraintRejected(
            "remote tracks cannot be reconfigured".to_string(),
        ))
    }

    fn stop(&self) {}
}

struct TrackStatus {
    ended: bool,
    enabled: bool,
    constraints: Option<VideoConstraints>,
    ended_sinks: Vec<InputSender>,
}

struct TrackInner {
    id: TrackId,
    kind: MediaKind,
    source: MediaSource,
    label: String,
    backend: Arc<dyn TrackBackend>,
    status: Mutex<TrackStatus>,
}

/// Shared handle to a local or remote media track.
///
/// Clones refer to the same track. Only the owner (the controller for local
/// capture) calls [`MediaTrack::stop`]; everybody else observes the track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(
        kind: MediaKind,
        source: MediaSource,
        label: impl Into<String>,
        backend: Arc<dyn TrackBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::generate(),
                kind,
                source,
                label: label.into(),
                backend,
                status: Mutex::new(TrackStatus {
                    ended: false,
                    enabled: true,
                    constraints: None,
                    ended_sinks: Vec::new(),
                }),
            }),
        }
    }

    pub fn remote(kind: MediaKind, label: impl Into<String>) -> Self {
        Self::new(kind, MediaSource::Remote, label, Arc::new(RemoteTrackBackend))
    }

    /// Record the constraints the device opened the track with.
    pub fn with_constraints(self, constraints: VideoConstraints) -> Self {
        self.inner.status.lock().constraints = Some(constraints);
        self
    }

    pub fn id(&self) -> &TrackId {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn source(&self) -> MediaSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_ended(&self) -> bool {
        self.inner.status.lock().ended
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.status.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.status.lock().enabled = enabled;
    }

    pub fn constraints(&self) -> Option<VideoConstraints> {
        self.inner.status.lock().constraints
    }

    /// Apply new constraints in place. On rejection the previous constraints stay.
    pub async fn apply_constraints(&self, constraints: VideoConstraints) -> Result<()> {
        if self.is_ended() {
            return Err(SessionError::InvalidState(format!(
                "track {} has ended",
                self.inner.id
            )));
        }
        if self.inner.kind != MediaKind::Video {
            return Err(SessionError::ConstraintRejected(
                "video constraints on a non-video track".to_string(),
            ));
        }

        self.inner
            .backend
            .apply_constraints(&constraints)
            .await
            .map_err(|e| match e {
                SessionError::ConstraintRejected(_) => e,
                other => SessionError::ConstraintRejected(other.to_string()),
            })?;

        self.inner.status.lock().constraints = Some(constraints);
        Ok(())
    }

    /// Owner-initiated stop. Does not raise an ended notification.
    pub fn stop(&self) {
        {
            let mut status = self.inner.status.lock();
            if status.ended {
                return;
            }
            status.ended = true;
            status.ended_sinks.clear();
        }
        log::debug!("Stopping {} track {}", self.inner.kind, self.inner.id);
        self.inner.backend.stop();
    }

    /// The track ended underneath us (device unplugged, OS-level stop).
    ///
    /// Subscribers receive a [`SessionInput::TrackEnded`] message; nothing is
    /// torn down synchronously here.
    pub fn notify_ended(&self) {
        let sinks = {
            let mut status = self.inner.status.lock();
            if status.ended {
                return;
            }
            status.ended = true;
            std::mem::take(&mut status.ended_sinks)
        };

        log::info!(
            "{} track {} ({}) ended externally",
            self.inner.kind,
            self.inner.id,
            self.inner.source
        );
        for sink in sinks {
            let _ = sink.send(SessionInput::TrackEnded {
                track_id: self.inner.id.clone(),
            });
        }
    }

    /// Route this track's ended notification onto an input queue.
    pub fn subscribe_ended(&self, sink: InputSender) {
        self.inner.status.lock().ended_sinks.push(sink);
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_notify_ended_reaches_subscribers_once() {
        let track = MediaTrack::remote(MediaKind::Video, "remote");
        let (tx, mut rx) = mpsc::unbounded_channel();
        track.subscribe_ended(tx);

        track.notify_ended();
        track.notify_ended();

        assert!(track.is_ended());
        match rx.try_recv() {
            Ok(SessionInput::TrackEnded { track_id }) => assert_eq!(&track_id, track.id()),
            other => panic!("unexpected input: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_is_silent() {
        let track = MediaTrack::remote(MediaKind::Audio, "remote");
        let (tx, mut rx) = mpsc::unbounded_channel();
        track.subscribe_ended(tx);

        track.stop();
        track.notify_ended();

        assert!(track.is_ended());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_track_rejects_constraints() {
        let track = MediaTrack::remote(MediaKind::Video, "remote");
        let result = track
            .apply_constraints(crate::quality::QualityLevel::High.constraints())
            .await;
        assert!(matches!(result, Err(SessionError::ConstraintRejected(_))));
        assert!(track.constraints().is_none());
    }
}
