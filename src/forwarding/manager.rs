//! Forwarding-mode session: one send and one receive transport to a media
//! forwarding server, with producers and consumers on top.

use crate::capture::{LocalCapture, MediaTrack};
use crate::errors::{ErrorScope, Result, SessionError};
use crate::events::{EngineEvent, EventEmitter, InputSender, SessionEvent};
use crate::forwarding::capabilities::{CapabilityNegotiator, RtpCapabilities};
use crate::forwarding::consumer::{Consumer, ConsumerInfo};
use crate::forwarding::engine::{ConsumerOptions, ForwardingEngine, TransportOptions};
use crate::forwarding::producer::{Producer, ProducerInfo};
use crate::forwarding::transport::{Transport, TransportState};
use crate::quality::{RtpEncoding, SimulcastConfig};
use crate::signaling::{ServerEvent, SignalRequest, Signaling};
use crate::types::{
    ConsumerId, MediaKind, MediaSource, ProducerId, RoomId, TrackId, TransportDirection,
    TransportId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardingState {
    Unjoined,
    CapabilitiesPending,
    TransportsPending,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub state: TransportState,
    pub connected_once: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingSnapshot {
    pub state: ForwardingState,
    pub room_id: Option<RoomId>,
    pub send_transport: Option<TransportInfo>,
    pub recv_transport: Option<TransportInfo>,
    pub producers: Vec<ProducerInfo>,
    pub consumers: Vec<ConsumerInfo>,
}

struct SessionSlot {
    state: ForwardingState,
    room: Option<RoomId>,
    /// Bumped on teardown so in-flight continuations can tell they are stale.
    epoch: u64,
    negotiator: Option<Arc<CapabilityNegotiator>>,
    send: Option<Arc<Transport>>,
    recv: Option<Arc<Transport>>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    pending_consumes: HashSet<ProducerId>,
}

impl SessionSlot {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state != ForwardingState::Closed
    }

    fn producer_for_track(&self, track_id: &TrackId) -> Option<ProducerId> {
        self.producers
            .values()
            .find(|p| p.track().id() == track_id)
            .map(|p| p.id().clone())
    }
}

/// Timeouts and connect failures are unrecoverable in forwarding mode.
fn is_session_fatal(error: &SessionError) -> bool {
    error.is_timeout() || matches!(error, SessionError::TransportFailed(_))
}

fn stale() -> SessionError {
    SessionError::InvalidState("forwarding session closed while a request was in flight".to_string())
}

pub struct ForwardingSessionManager {
    signaling: Signaling,
    engine: Arc<dyn ForwardingEngine>,
    emitter: EventEmitter,
    inputs: InputSender,
    simulcast: SimulcastConfig,
    connect_timeout: Duration,
    slot: Mutex<SessionSlot>,
}

impl ForwardingSessionManager {
    pub fn new(
        signaling: Signaling,
        engine: Arc<dyn ForwardingEngine>,
        emitter: EventEmitter,
        inputs: InputSender,
        simulcast: SimulcastConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            signaling,
            engine,
            emitter,
            inputs,
            simulcast,
            connect_timeout,
            slot: Mutex::new(SessionSlot {
                state: ForwardingState::Unjoined,
                room: None,
                epoch: 0,
                negotiator: None,
                send: None,
                recv: None,
                producers: HashMap::new(),
                consumers: HashMap::new(),
                pending_consumes: HashSet::new(),
            }),
        }
    }

    pub fn state(&self) -> ForwardingState {
        self.slot.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ForwardingState::Closed
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.slot.lock().room.clone()
    }

    pub fn negotiated_capabilities(&self) -> Option<RtpCapabilities> {
        self.slot
            .lock()
            .negotiator
            .as_ref()
            .map(|n| n.rtp_capabilities().clone())
    }

    pub fn send_transport(&self) -> Option<Arc<Transport>> {
        self.slot.lock().send.clone()
    }

    pub fn recv_transport(&self) -> Option<Arc<Transport>> {
        self.slot.lock().recv.clone()
    }

    pub fn producer(&self, producer_id: &ProducerId) -> Option<ProducerInfo> {
        self.slot.lock().producers.get(producer_id).map(Producer::info)
    }

    pub fn producer_for_track(&self, track_id: &TrackId) -> Option<ProducerId> {
        self.slot.lock().producer_for_track(track_id)
    }

    pub fn producer_count(&self) -> usize {
        self.slot.lock().producers.len()
    }

    pub fn consumer_for_producer(&self, producer_id: &ProducerId) -> Option<ConsumerInfo> {
        self.slot
            .lock()
            .consumers
            .values()
            .find(|c| c.producer_id() == producer_id)
            .map(Consumer::info)
    }

    pub fn consumer_count(&self) -> usize {
        self.slot.lock().consumers.len()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.slot.lock().is_current(epoch)
    }

    /// Join a room: capabilities, both transports, then one producer per
    /// local user track.
    ///
    /// Fatal failures leave the manager `closed` and are returned without
    /// emitting an event; the caller owns the user-visible notification.
    /// Per-track failures are reported as operation warnings.
    pub async fn join(&self, room_id: RoomId, capture: &LocalCapture) -> Result<()> {
        let epoch = {
            let mut slot = self.slot.lock();
            if slot.state != ForwardingState::Unjoined {
                return Err(SessionError::InvalidState(format!(
                    "cannot join from state {:?}",
                    slot.state
                )));
            }
            slot.state = ForwardingState::CapabilitiesPending;
            slot.room = Some(room_id.clone());
            slot.epoch
        };
        log::info!("Joining forwarding room {}", room_id);

        if let Err(e) = self.establish(&room_id, epoch).await {
            if self.is_current(epoch) {
                self.shutdown(false).await;
            }
            return Err(e);
        }

        for track in capture.user_tracks() {
            let source = track.source();
            match self.produce(track, source).await {
                Ok(_) => {}
                Err(e) if is_session_fatal(&e) => {
                    self.shutdown(false).await;
                    return Err(e);
                }
                Err(e) => {
                    if !self.is_current(epoch) {
                        return Err(e);
                    }
                    self.emitter.error(&e, ErrorScope::Operation);
                }
            }
        }

        log::info!(
            "Forwarding session active in room {} with {} producer(s)",
            room_id,
            self.producer_count()
        );
        Ok(())
    }

    async fn establish(&self, room_id: &RoomId, epoch: u64) -> Result<()> {
        let server: RtpCapabilities = self
            .signaling
            .call(SignalRequest::GetCapabilities {
                room_id: room_id.clone(),
            })
            .await?;
        if !self.is_current(epoch) {
            return Err(stale());
        }

        let negotiator = CapabilityNegotiator::load(&server, &self.engine.local_capabilities())?;
        {
            let mut slot = self.slot.lock();
            slot.negotiator = Some(Arc::new(negotiator));
            slot.state = ForwardingState::TransportsPending;
        }

        let (send, recv) = tokio::join!(
            self.create_transport(room_id, TransportDirection::Send),
            self.create_transport(room_id, TransportDirection::Receive),
        );
        let (send, recv) = match (send, recv) {
            (Ok(send), Ok(recv)) => (send, recv),
            (Ok(created), Err(e)) | (Err(e), Ok(created)) => {
                created.close().await;
                return Err(e);
            }
            (Err(e), Err(_)) => return Err(e),
        };

        {
            let mut slot = self.slot.lock();
            if slot.is_current(epoch) {
                slot.send = Some(send);
                slot.recv = Some(recv);
                slot.state = ForwardingState::Active;
                return Ok(());
            }
        }
        send.close().await;
        recv.close().await;
        Err(stale())
    }

    async fn create_transport(
        &self,
        room_id: &RoomId,
        direction: TransportDirection,
    ) -> Result<Arc<Transport>> {
        let options: TransportOptions = self
            .signaling
            .call(SignalRequest::CreateTransport {
                room_id: room_id.clone(),
                direction,
            })
            .await?;
        let engine = self
            .engine
            .create_transport(direction, &options, self.inputs.clone())
            .await?;
        log::info!("Created {} transport {}", direction, options.id);

        Ok(Arc::new(Transport::new(
            &options,
            direction,
            engine,
            self.signaling.clone(),
            self.connect_timeout,
        )))
    }

    /// Start sending a local track. Simulcast applies to camera video only.
    pub async fn add_producer(&self, track: MediaTrack, source: MediaSource) -> Result<ProducerId> {
        match self.produce(track, source).await {
            Ok(id) => Ok(id),
            Err(e) => Err(self.escalate(e).await),
        }
    }

    async fn produce(&self, track: MediaTrack, source: MediaSource) -> Result<ProducerId> {
        let (epoch, transport, codec) = {
            let slot = self.slot.lock();
            if slot.state != ForwardingState::Active {
                return Err(SessionError::InvalidState(format!(
                    "cannot produce in state {:?}",
                    slot.state
                )));
            }
            let negotiator = slot.negotiator.as_ref().ok_or_else(stale)?;
            let codec = negotiator.codec_for(track.kind()).cloned().ok_or_else(|| {
                SessionError::IncompatibleCapabilities(format!(
                    "forwarding server cannot receive {}",
                    track.kind()
                ))
            })?;
            let transport = slot.send.clone().ok_or_else(stale)?;
            (slot.epoch, transport, codec)
        };
        if track.is_ended() {
            return Err(SessionError::InvalidState(format!(
                "track {} has ended",
                track.id()
            )));
        }

        let encodings = if track.kind() == MediaKind::Video && source == MediaSource::Camera {
            self.simulcast.encodings()
        } else {
            vec![RtpEncoding::default()]
        };

        let producer = transport.produce(&track, source, &codec, &encodings).await?;
        let producer_id = producer.id().clone();
        {
            let mut slot = self.slot.lock();
            if slot.is_current(epoch) {
                log::info!(
                    "Producing {} ({}) as {} with {} encoding(s)",
                    track.kind(),
                    source,
                    producer_id,
                    producer.encodings().len()
                );
                slot.producers.insert(producer_id.clone(), producer);
                return Ok(producer_id);
            }
        }

        log::warn!(
            "Producer {} acknowledged after the session closed; closing it",
            producer_id
        );
        let _ = transport.engine().stop_sending(track.id()).await;
        let _ = self
            .signaling
            .notify(SignalRequest::CloseProducer { producer_id })
            .await;
        Err(stale())
    }

    /// Close a producer locally and on the server. Unknown ids are a no-op.
    pub async fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        let (producer, transport) = {
            let mut slot = self.slot.lock();
            let Some(mut producer) = slot.producers.remove(producer_id) else {
                log::debug!("Producer {} already closed", producer_id);
                return Ok(());
            };
            producer.close();
            (producer, slot.send.clone())
        };

        log::info!("Closing {} producer {}", producer.kind(), producer_id);
        if let Some(transport) = transport {
            if let Err(e) = transport.engine().stop_sending(producer.track().id()).await {
                log::warn!("Failed to stop sending for producer {}: {}", producer_id, e);
            }
        }

        let result = self
            .signaling
            .send(SignalRequest::CloseProducer {
                producer_id: producer_id.clone(),
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.escalate(e).await),
        }
    }

    /// A local track ended underneath us: its producer goes away with it.
    pub async fn on_track_ended(&self, track_id: &TrackId) -> Result<()> {
        let producer_id = self.slot.lock().producer_for_track(track_id);
        match producer_id {
            Some(id) => self.close_producer(&id).await,
            None => Ok(()),
        }
    }

    /// Hot-swap the media of the producer carrying `old`. A track that is
    /// not being sent has nothing to swap.
    pub async fn replace_track(&self, old: &TrackId, new: MediaTrack) -> Result<()> {
        let (producer_id, transport) = {
            let slot = self.slot.lock();
            let Some(producer_id) = slot.producer_for_track(old) else {
                log::debug!("No producer carries track {}; nothing to replace", old);
                return Ok(());
            };
            (producer_id, slot.send.clone().ok_or_else(stale)?)
        };

        if let Err(e) = transport.engine().replace_track(old, &new).await {
            return Err(self.escalate(e).await);
        }

        let new_id = new.id().clone();
        let mut slot = self.slot.lock();
        match slot.producers.get_mut(&producer_id) {
            Some(producer) => {
                producer.replace_track(new);
                log::info!("Producer {} now sends track {}", producer_id, new_id);
                Ok(())
            }
            None => Err(stale()),
        }
    }

    /// Pause or resume the producer carrying `track_id` on the server.
    pub async fn set_track_paused(&self, track_id: &TrackId, paused: bool) -> Result<()> {
        let producer_id = {
            let mut slot = self.slot.lock();
            let Some(producer_id) = slot.producer_for_track(track_id) else {
                return Ok(());
            };
            match slot.producers.get_mut(&producer_id) {
                Some(producer) if producer.is_paused() != paused => producer.set_paused(paused),
                _ => return Ok(()),
            }
            producer_id
        };

        let request = if paused {
            SignalRequest::PauseProducer {
                producer_id: producer_id.clone(),
            }
        } else {
            SignalRequest::ResumeProducer {
                producer_id: producer_id.clone(),
            }
        };
        if let Err(e) = self.signaling.send(request).await {
            if let Some(producer) = self.slot.lock().producers.get_mut(&producer_id) {
                producer.set_paused(!paused);
            }
            return Err(self.escalate(e).await);
        }
        log::info!(
            "Producer {} {}",
            producer_id,
            if paused { "paused" } else { "resumed" }
        );
        Ok(())
    }

    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewProducer {
                producer_id, kind, ..
            } => self.handle_new_producer(producer_id, kind).await,
            ServerEvent::ProducerClosed { producer_id } => {
                self.handle_producer_closed(&producer_id).await
            }
            ServerEvent::ConsumerClosed { consumer_id } => {
                self.drop_consumer(&consumer_id).await;
            }
            other => log::debug!("Ignoring mesh event in forwarding mode: {:?}", other),
        }
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportConnectionState {
                transport_id,
                state,
            } => self.handle_transport_state(&transport_id, state).await,
            other => log::debug!("Ignoring engine event in forwarding mode: {:?}", other),
        }
    }

    /// A remote participant started producing: consume it if we can decode it.
    pub async fn handle_new_producer(&self, producer_id: ProducerId, kind: Option<MediaKind>) {
        let (epoch, transport, negotiator) = {
            let mut slot = self.slot.lock();
            if slot.state != ForwardingState::Active {
                log::debug!(
                    "Ignoring new producer {} in state {:?}",
                    producer_id,
                    slot.state
                );
                return;
            }
            if slot.producers.contains_key(&producer_id)
                || slot.pending_consumes.contains(&producer_id)
                || slot.consumers.values().any(|c| c.producer_id() == &producer_id)
            {
                log::debug!("Producer {} is already ours or consumed", producer_id);
                return;
            }
            let (Some(negotiator), Some(transport)) = (slot.negotiator.clone(), slot.recv.clone())
            else {
                return;
            };
            if let Some(kind) = kind {
                if !negotiator.supports(kind) {
                    log::info!(
                        "Skipping {} producer {}: no common codec",
                        kind,
                        producer_id
                    );
                    return;
                }
            }
            slot.pending_consumes.insert(producer_id.clone());
            (slot.epoch, transport, negotiator)
        };

        let result = self
            .consume(&transport, &negotiator, &producer_id, epoch)
            .await;
        self.slot.lock().pending_consumes.remove(&producer_id);

        match result {
            Ok(Some((kind, track))) => self.emitter.emit(SessionEvent::RemoteStreamAdded {
                id: producer_id.to_string(),
                kind,
                track,
            }),
            Ok(None) => {}
            Err(_) if !self.is_current(epoch) => {
                log::debug!("Dropped consume of {}: session closed", producer_id);
            }
            Err(e) if is_session_fatal(&e) => self.fail_session(&e).await,
            Err(e) => self.emitter.error(&e, ErrorScope::Operation),
        }
    }

    async fn consume(
        &self,
        transport: &Transport,
        negotiator: &CapabilityNegotiator,
        producer_id: &ProducerId,
        epoch: u64,
    ) -> Result<Option<(MediaKind, MediaTrack)>> {
        let options: ConsumerOptions = self
            .signaling
            .call(SignalRequest::Consume {
                transport_id: transport.id().clone(),
                producer_id: producer_id.clone(),
                rtp_capabilities: negotiator.rtp_capabilities().clone(),
            })
            .await?;
        let consumer_id = options.id.clone();

        if !self.is_current(epoch) {
            let _ = self
                .signaling
                .notify(SignalRequest::CloseConsumer { consumer_id })
                .await;
            return Err(stale());
        }

        if !negotiator.can_consume(options.kind, &options.rtp_parameters) {
            log::info!(
                "Declining producer {}: its codec cannot be decoded locally",
                producer_id
            );
            let _ = self
                .signaling
                .send(SignalRequest::CloseConsumer { consumer_id })
                .await;
            return Ok(None);
        }

        let consumer = match transport.consume(&options).await {
            Ok(consumer) => consumer,
            Err(e) => {
                let _ = self
                    .signaling
                    .notify(SignalRequest::CloseConsumer { consumer_id })
                    .await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .signaling
            .send(SignalRequest::ResumeConsumer {
                consumer_id: consumer_id.clone(),
            })
            .await
        {
            let _ = transport.engine().stop_receiving(&consumer_id).await;
            return Err(e);
        }

        let kind = consumer.kind();
        let track = consumer.track().clone();
        {
            let mut slot = self.slot.lock();
            if slot.is_current(epoch) {
                log::info!(
                    "Consuming {} producer {} as {}",
                    kind,
                    producer_id,
                    consumer_id
                );
                slot.consumers.insert(consumer_id, consumer);
                return Ok(Some((kind, track)));
            }
        }
        let _ = transport.engine().stop_receiving(&consumer_id).await;
        Err(stale())
    }

    /// The remote producer went away; its consumer follows.
    pub async fn handle_producer_closed(&self, producer_id: &ProducerId) {
        let consumer_id = self
            .slot
            .lock()
            .consumers
            .values()
            .find(|c| c.producer_id() == producer_id)
            .map(|c| c.id().clone());
        if let Some(consumer_id) = consumer_id {
            self.drop_consumer(&consumer_id).await;
        }
    }

    /// Close a consumer locally and tell the server. Unknown ids are a no-op.
    pub async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        if !self.drop_consumer(consumer_id).await {
            return Ok(());
        }
        let result = self
            .signaling
            .send(SignalRequest::CloseConsumer {
                consumer_id: consumer_id.clone(),
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.escalate(e).await),
        }
    }

    /// Local half of closing a consumer. Returns `false` when it was already gone.
    async fn drop_consumer(&self, consumer_id: &ConsumerId) -> bool {
        let (consumer, transport) = {
            let mut slot = self.slot.lock();
            let Some(mut consumer) = slot.consumers.remove(consumer_id) else {
                log::debug!("Consumer {} already closed", consumer_id);
                return false;
            };
            consumer.close();
            (consumer, slot.recv.clone())
        };

        log::info!(
            "Closing consumer {} of producer {}",
            consumer_id,
            consumer.producer_id()
        );
        if let Some(transport) = transport {
            if let Err(e) = transport.engine().stop_receiving(consumer_id).await {
                log::warn!("Failed to stop receiving {}: {}", consumer_id, e);
            }
        }
        consumer.track().stop();
        self.emitter.emit(SessionEvent::RemoteStreamRemoved {
            id: consumer.producer_id().to_string(),
        });
        true
    }

    pub async fn handle_transport_state(&self, transport_id: &TransportId, state: TransportState) {
        let transport = {
            let slot = self.slot.lock();
            let found = [slot.send.as_ref(), slot.recv.as_ref()]
                .into_iter()
                .flatten()
                .find(|t| t.id() == transport_id)
                .cloned();
            found
        };
        let Some(transport) = transport else {
            log::debug!("State change for unknown transport {}", transport_id);
            return;
        };

        transport.set_state(state);
        if state.is_terminal() && !self.is_closed() {
            let error = SessionError::TransportFailed(format!(
                "{} transport {} is {:?}",
                transport.direction(),
                transport_id,
                state
            ));
            self.fail_session(&error).await;
        }
    }

    async fn escalate(&self, error: SessionError) -> SessionError {
        if is_session_fatal(&error) {
            self.fail_session(&error).await;
        }
        error
    }

    /// Tear everything down and raise the single session-level failure.
    async fn fail_session(&self, error: &SessionError) {
        if self.is_closed() {
            return;
        }
        self.shutdown(false).await;
        self.emitter.error(error, ErrorScope::Session);
    }

    /// Leave the room. Safe from any state and never fails.
    pub async fn leave(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, notify_server: bool) {
        let (room, producers, consumers, transports) = {
            let mut slot = self.slot.lock();
            if slot.state == ForwardingState::Closed {
                return;
            }
            slot.epoch += 1;
            slot.state = ForwardingState::Closed;
            slot.negotiator = None;
            slot.pending_consumes.clear();
            let producers: Vec<Producer> = slot.producers.drain().map(|(_, p)| p).collect();
            let consumers: Vec<Consumer> = slot.consumers.drain().map(|(_, c)| c).collect();
            let transports: Vec<Arc<Transport>> =
                slot.send.take().into_iter().chain(slot.recv.take()).collect();
            (slot.room.take(), producers, consumers, transports)
        };

        let mut notifications = Vec::new();
        for mut producer in producers {
            producer.close();
            notifications.push(SignalRequest::CloseProducer {
                producer_id: producer.id().clone(),
            });
        }
        for mut consumer in consumers {
            consumer.close();
            consumer.track().stop();
            self.emitter.emit(SessionEvent::RemoteStreamRemoved {
                id: consumer.producer_id().to_string(),
            });
            notifications.push(SignalRequest::CloseConsumer {
                consumer_id: consumer.id().clone(),
            });
        }
        for transport in &transports {
            transport.close().await;
        }

        if notify_server {
            if let Some(room_id) = room.clone() {
                notifications.push(SignalRequest::LeaveRoom { room_id });
            }
            let sends = notifications.into_iter().map(|n| self.signaling.notify(n));
            for result in futures::future::join_all(sends).await {
                if let Err(e) = result {
                    log::warn!("Teardown notification failed: {}", e);
                }
            }
        }

        match room {
            Some(room_id) => log::info!("Left forwarding room {}", room_id),
            None => log::info!("Forwarding session closed before joining"),
        }
    }

    pub fn snapshot(&self) -> ForwardingSnapshot {
        let slot = self.slot.lock();
        let info = |t: &Arc<Transport>| TransportInfo {
            id: t.id().clone(),
            direction: t.direction(),
            state: t.state(),
            connected_once: t.connect_fired(),
        };

        let mut producers: Vec<ProducerInfo> = slot.producers.values().map(Producer::info).collect();
        producers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut consumers: Vec<ConsumerInfo> = slot.consumers.values().map(Consumer::info).collect();
        consumers.sort_by(|a, b| a.id.cmp(&b.id));

        ForwardingSnapshot {
            state: slot.state,
            room_id: slot.room.clone(),
            send_transport: slot.send.as_ref().map(info),
            recv_transport: slot.recv.as_ref().map(info),
            producers,
            consumers,
        }
    }
}
