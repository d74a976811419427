use crate::capture::MediaTrack;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde::{Deserialize, Serialize};

/// Local copy of a remote participant's producer.
#[derive(Debug, Clone)]
pub struct Consumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    transport_id: TransportId,
    track: MediaTrack,
    closed: bool,
}

impl Consumer {
    pub fn new(
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        transport_id: TransportId,
        track: MediaTrack,
    ) -> Self {
        Self {
            id,
            producer_id,
            kind,
            transport_id,
            track,
            closed: false,
        }
    }

    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    /// Mark closed. Returns `false` if it already was.
    pub fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}
