//! Session inputs and upward notifications
//!
//! Everything that happens *to* a session (server events, engine callbacks,
//! track "ended" interrupts) is a [`SessionInput`] on one ordered queue.
//! Everything the session reports upward is a [`SessionEvent`].

use crate::capture::MediaTrack;
use crate::errors::{ErrorScope, SessionError, SessionErrorKind};
use crate::forwarding::transport::TransportState;
use crate::rtc::{ConnectionState, IceCandidate};
use crate::signaling::ServerEvent;
use crate::types::{MediaKind, PeerId, TrackId, TransportId};
use tokio::sync::{broadcast, mpsc};

/// Callbacks raised by a media engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LocalIceCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    PeerConnectionState {
        peer_id: PeerId,
        state: ConnectionState,
    },
    RemoteTrack {
        peer_id: PeerId,
        track: MediaTrack,
    },
    TransportConnectionState {
        transport_id: TransportId,
        state: TransportState,
    },
}

#[derive(Debug, Clone)]
pub enum SessionInput {
    Server(ServerEvent),
    Engine(EngineEvent),
    TrackEnded { track_id: TrackId },
}

pub type InputSender = mpsc::UnboundedSender<SessionInput>;
pub type InputReceiver = mpsc::UnboundedReceiver<SessionInput>;

/// Mode-agnostic notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LocalStreamReady {
        audio: bool,
        video: bool,
    },
    /// `id` is the remote peer id (mesh) or the remote producer id (forwarding).
    RemoteStreamAdded {
        id: String,
        kind: MediaKind,
        track: MediaTrack,
    },
    RemoteStreamRemoved {
        id: String,
    },
    SessionError {
        kind: SessionErrorKind,
        detail: String,
        scope: ErrorScope,
    },
    ScreenShareChanged {
        active: bool,
    },
}

impl SessionEvent {
    pub fn error(error: &SessionError, scope: ErrorScope) -> Self {
        SessionEvent::SessionError {
            kind: error.kind(),
            detail: error.to_string(),
            scope,
        }
    }
}

/// Fan-out of [`SessionEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        log::debug!("Session event: {:?}", event);
        // No subscribers is fine; the UI may not be attached yet.
        let _ = self.sender.send(event);
    }

    pub fn error(&self, error: &SessionError, scope: ErrorScope) {
        match scope {
            ErrorScope::Session => log::error!("Session failure: {}", error),
            ErrorScope::Peer | ErrorScope::Operation => log::warn!("{:?} warning: {}", scope, error),
        }
        self.emit(SessionEvent::error(error, scope));
    }
}
