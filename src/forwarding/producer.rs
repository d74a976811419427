use crate::capture::MediaTrack;
use crate::quality::RtpEncoding;
use crate::types::{MediaKind, MediaSource, ProducerId, TransportId};
use serde::{Deserialize, Serialize};

/// An outgoing track registered with the forwarding server.
#[derive(Debug, Clone)]
pub struct Producer {
    id: ProducerId,
    source: MediaSource,
    transport_id: TransportId,
    track: MediaTrack,
    encodings: Vec<RtpEncoding>,
    paused: bool,
    closed: bool,
}

impl Producer {
    pub fn new(
        id: ProducerId,
        source: MediaSource,
        transport_id: TransportId,
        track: MediaTrack,
        encodings: Vec<RtpEncoding>,
    ) -> Self {
        Self {
            id,
            source,
            transport_id,
            track,
            encodings,
            paused: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &ProducerId {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    pub fn source(&self) -> MediaSource {
        self.source
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    pub fn encodings(&self) -> &[RtpEncoding] {
        &self.encodings
    }

    /// Simulcast is on when more than one layer is being sent.
    pub fn is_simulcast(&self) -> bool {
        self.encodings.len() > 1
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Swap the underlying track, returning the previous one.
    pub fn replace_track(&mut self, track: MediaTrack) -> MediaTrack {
        std::mem::replace(&mut self.track, track)
    }

    /// Mark closed. Returns `false` if it already was.
    pub fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            id: self.id.clone(),
            kind: self.kind(),
            source: self.source,
            paused: self.paused,
            simulcast: self.is_simulcast(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub paused: bool,
    pub simulcast: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_idempotent() {
        let mut producer = Producer::new(
            ProducerId::from("p1"),
            MediaSource::Microphone,
            TransportId::from("send"),
            MediaTrack::remote(MediaKind::Audio, "mic"),
            vec![RtpEncoding::default()],
        );
        assert!(producer.close());
        assert!(!producer.close());
        assert!(producer.is_closed());
        assert!(!producer.info().simulcast);
    }
}
