//! Forwarding session integration tests
//!
//! Runs a `ForwardingSessionManager` against a scripted forwarding server and
//! fake transport engines.

use crabmeet::capture::{CaptureRequest, LocalCapture, MediaDevices, MediaTrack, RemoteTrackBackend};
use crabmeet::events::{EventEmitter, InputReceiver, SessionEvent, SessionInput};
use crabmeet::forwarding::{ForwardingSessionManager, ForwardingState, TransportState};
use crabmeet::quality::{QualityLevel, SimulcastConfig};
use crabmeet::signaling::{ServerEvent, SignalRequest, Signaling};
use crabmeet::testing::{
    audio_only_capabilities, FakeForwardingEngine, FakeMediaDevices, MockReply, MockSignaling,
};
use crabmeet::{
    ErrorScope, MediaKind, MediaSource, ProducerId, RoomId, SessionError, SessionErrorKind,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct Harness {
    signaling: Arc<MockSignaling>,
    engine: Arc<FakeForwardingEngine>,
    manager: ForwardingSessionManager,
    inputs: InputReceiver,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    fn new() -> Self {
        let signaling = Arc::new(MockSignaling::new());
        let engine = Arc::new(FakeForwardingEngine::new());
        let emitter = EventEmitter::new(64);
        let events = emitter.subscribe();
        let (tx, inputs) = mpsc::unbounded_channel();

        let manager = ForwardingSessionManager::new(
            Signaling::new(signaling.clone(), Duration::from_secs(5)),
            engine.clone(),
            emitter,
            tx,
            SimulcastConfig::default(),
            Duration::from_secs(5),
        );
        Self {
            signaling,
            engine,
            manager,
            inputs,
            events,
        }
    }

    async fn join_with_media(&self) -> crabmeet::Result<LocalCapture> {
        let devices = FakeMediaDevices::new();
        let tracks = devices
            .get_user_media(&CaptureRequest::audio_video(QualityLevel::High.constraints()))
            .await?;
        let capture = LocalCapture::from_tracks(tracks)?;
        self.manager
            .join(RoomId::from("townhall"), &capture)
            .await?;
        Ok(capture)
    }

    async fn join_empty(&self) {
        self.manager
            .join(RoomId::from("townhall"), &LocalCapture::new())
            .await
            .unwrap();
    }

    async fn pump(&mut self) {
        while let Ok(input) = self.inputs.try_recv() {
            match input {
                SessionInput::Engine(event) => self.manager.handle_engine_event(event).await,
                SessionInput::Server(event) => self.manager.handle_server_event(event).await,
                SessionInput::TrackEnded { .. } => {}
            }
        }
    }

    fn events(&mut self) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }

    async fn new_producer(&self, id: &str, kind: Option<MediaKind>) {
        self.manager
            .handle_server_event(ServerEvent::NewProducer {
                producer_id: ProducerId::from(id),
                peer_id: None,
                kind,
            })
            .await;
    }
}

fn microphone(label: &str) -> MediaTrack {
    MediaTrack::new(
        MediaKind::Audio,
        MediaSource::Microphone,
        label,
        Arc::new(RemoteTrackBackend),
    )
}

fn errors_in(events: &[SessionEvent], wanted: ErrorScope) -> Vec<SessionErrorKind> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SessionError { kind, scope, .. } if *scope == wanted => Some(*kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_join_produces_every_local_track() {
    let harness = Harness::new();
    harness.join_with_media().await.unwrap();

    assert_eq!(harness.manager.state(), ForwardingState::Active);
    assert_eq!(harness.signaling.count("get-capabilities"), 1);
    assert_eq!(harness.signaling.count("create-transport"), 2);
    assert_eq!(harness.signaling.count("produce"), 2);
    // Only the send transport has been used so far.
    assert_eq!(harness.signaling.count("connect-transport"), 1);

    let snapshot = harness.manager.snapshot();
    assert_eq!(snapshot.producers.len(), 2);
    let video = snapshot
        .producers
        .iter()
        .find(|p| p.kind == MediaKind::Video)
        .unwrap();
    assert!(video.simulcast);
    assert!(snapshot.send_transport.unwrap().connected_once);
    assert!(!snapshot.recv_transport.unwrap().connected_once);

    let send = harness.engine.send_transport().unwrap();
    assert_eq!(send.sending().len(), 2);
}

#[tokio::test]
async fn test_audio_only_server_rejects_video_but_keeps_audio() {
    let mut harness = Harness::new();
    harness.signaling.set_capabilities(audio_only_capabilities());

    harness.join_with_media().await.unwrap();

    assert_eq!(harness.manager.state(), ForwardingState::Active);
    assert_eq!(harness.manager.producer_count(), 1);
    assert_eq!(harness.signaling.count("produce"), 1);
    assert_eq!(
        errors_in(&harness.events(), ErrorScope::Operation),
        vec![SessionErrorKind::IncompatibleCapabilities]
    );
}

#[tokio::test]
async fn test_connect_runs_once_for_concurrent_producers() {
    let harness = Harness::new();
    harness.join_empty().await;

    let tracks: Vec<MediaTrack> = (0..3).map(|n| microphone(&format!("mic {}", n))).collect();
    let results = join_all(
        tracks
            .iter()
            .map(|t| harness.manager.add_producer(t.clone(), MediaSource::Microphone)),
    )
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(harness.signaling.count("connect-transport"), 1);
    assert_eq!(harness.manager.producer_count(), 3);
}

#[tokio::test]
async fn test_close_producer_twice_is_a_noop() {
    let harness = Harness::new();
    harness.join_empty().await;

    let id = harness
        .manager
        .add_producer(microphone("mic"), MediaSource::Microphone)
        .await
        .unwrap();

    harness.manager.close_producer(&id).await.unwrap();
    harness.manager.close_producer(&id).await.unwrap();

    assert_eq!(harness.signaling.count("close-producer"), 1);
    assert_eq!(harness.manager.producer_count(), 0);
    assert!(harness.engine.send_transport().unwrap().sending().is_empty());
}

#[tokio::test]
async fn test_ended_track_closes_its_producer() {
    let harness = Harness::new();
    let capture = harness.join_with_media().await.unwrap();
    let camera = capture.camera().unwrap().clone();

    harness.manager.on_track_ended(camera.id()).await.unwrap();

    assert_eq!(harness.manager.producer_count(), 1);
    assert!(harness.manager.producer_for_track(camera.id()).is_none());
    assert_eq!(harness.signaling.count("close-producer"), 1);
}

#[tokio::test]
async fn test_new_producer_is_consumed_and_resumed() {
    let mut harness = Harness::new();
    harness.join_empty().await;
    harness.events();

    harness.new_producer("remote-cam", Some(MediaKind::Video)).await;
    harness.new_producer("remote-cam", Some(MediaKind::Video)).await;

    assert_eq!(harness.signaling.count("consume"), 1);
    assert_eq!(harness.signaling.count("resume-consumer"), 1);
    assert_eq!(harness.manager.consumer_count(), 1);

    let consumer = harness
        .manager
        .consumer_for_producer(&ProducerId::from("remote-cam"))
        .unwrap();
    assert_eq!(consumer.kind, MediaKind::Video);

    let events = harness.events();
    assert!(matches!(
        &events[..],
        [SessionEvent::RemoteStreamAdded { id, kind: MediaKind::Video, .. }] if id == "remote-cam"
    ));
    assert_eq!(harness.engine.recv_transport().unwrap().receiving().len(), 1);
}

#[tokio::test]
async fn test_producer_closed_removes_consumer() {
    let mut harness = Harness::new();
    harness.join_empty().await;
    harness.new_producer("remote-mic", Some(MediaKind::Audio)).await;
    harness.events();

    harness
        .manager
        .handle_server_event(ServerEvent::ProducerClosed {
            producer_id: ProducerId::from("remote-mic"),
        })
        .await;

    assert_eq!(harness.manager.consumer_count(), 0);
    assert_eq!(
        harness.events(),
        vec![SessionEvent::RemoteStreamRemoved {
            id: "remote-mic".to_string()
        }]
    );
    assert!(harness.engine.recv_transport().unwrap().receiving().is_empty());
}

#[tokio::test]
async fn test_undecodable_stream_is_declined() {
    let harness = Harness::new();
    harness.engine.set_local_capabilities(audio_only_capabilities());
    harness.join_empty().await;

    // The server does not say what kind it is; the consume ack reveals video.
    harness.new_producer("remote-cam", None).await;

    assert_eq!(harness.manager.consumer_count(), 0);
    assert_eq!(harness.signaling.count("close-consumer"), 1);
    assert_eq!(harness.signaling.count("resume-consumer"), 0);
}

#[tokio::test]
async fn test_unsupported_kind_is_skipped_without_consuming() {
    let harness = Harness::new();
    harness.signaling.set_capabilities(audio_only_capabilities());
    harness.join_empty().await;

    harness.new_producer("remote-cam", Some(MediaKind::Video)).await;

    assert_eq!(harness.signaling.count("consume"), 0);
}

#[tokio::test]
async fn test_transport_failure_closes_the_session() {
    let mut harness = Harness::new();
    harness.join_with_media().await.unwrap();
    harness.events();

    harness
        .engine
        .send_transport()
        .unwrap()
        .emit_state(TransportState::Failed);
    harness.pump().await;

    assert_eq!(harness.manager.state(), ForwardingState::Closed);
    assert_eq!(
        errors_in(&harness.events(), ErrorScope::Session),
        vec![SessionErrorKind::TransportFailed]
    );
    assert!(harness.engine.transports().iter().all(|t| t.is_closed()));

    // A second failure report finds nothing left to tear down.
    harness
        .engine
        .recv_transport()
        .unwrap()
        .emit_state(TransportState::Failed);
    harness.pump().await;
    assert!(errors_in(&harness.events(), ErrorScope::Session).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_is_fatal() {
    let mut harness = Harness::new();
    harness
        .signaling
        .respond("connect-transport", MockReply::NoReply);

    let result = harness.join_with_media().await;

    assert!(matches!(result, Err(SessionError::SignalingTimeout { .. })));
    assert_eq!(harness.manager.state(), ForwardingState::Closed);
    // The caller reports join failures; the manager stays quiet.
    assert!(errors_in(&harness.events(), ErrorScope::Session).is_empty());
}

#[tokio::test]
async fn test_rejected_connect_closes_the_session() {
    let mut harness = Harness::new();
    harness.join_empty().await;
    harness.events();
    harness.signaling.respond(
        "connect-transport",
        MockReply::Reject("dtls refused".to_string()),
    );

    let result = harness
        .manager
        .add_producer(microphone("mic"), MediaSource::Microphone)
        .await;

    assert!(matches!(result, Err(SessionError::TransportFailed(_))));
    assert_eq!(harness.manager.state(), ForwardingState::Closed);
    assert_eq!(
        errors_in(&harness.events(), ErrorScope::Session),
        vec![SessionErrorKind::TransportFailed]
    );
    assert!(harness.engine.transports().iter().all(|t| t.is_closed()));
}

#[tokio::test]
async fn test_rejected_receive_connect_closes_the_session() {
    let mut harness = Harness::new();
    harness.join_empty().await;
    harness.events();
    harness.signaling.respond(
        "connect-transport",
        MockReply::Reject("dtls refused".to_string()),
    );

    harness.new_producer("remote-cam", Some(MediaKind::Video)).await;

    assert_eq!(harness.manager.state(), ForwardingState::Closed);
    assert_eq!(harness.manager.consumer_count(), 0);
    let events = harness.events();
    assert_eq!(
        errors_in(&events, ErrorScope::Session),
        vec![SessionErrorKind::TransportFailed]
    );
    assert!(errors_in(&events, ErrorScope::Operation).is_empty());
}

#[tokio::test]
async fn test_rejected_produce_keeps_session_active() {
    let harness = Harness::new();
    harness.join_empty().await;
    harness
        .signaling
        .respond("produce", MockReply::Reject("quota exceeded".to_string()));

    let result = harness
        .manager
        .add_producer(microphone("mic"), MediaSource::Microphone)
        .await;

    assert!(matches!(result, Err(SessionError::Signaling(_))));
    assert_eq!(harness.manager.state(), ForwardingState::Active);
    assert!(harness.engine.send_transport().unwrap().sending().is_empty());
}

#[tokio::test]
async fn test_pause_and_resume_producer() {
    let harness = Harness::new();
    let capture = harness.join_with_media().await.unwrap();
    let mic = capture.audio().unwrap().clone();

    harness.manager.set_track_paused(mic.id(), true).await.unwrap();
    harness.manager.set_track_paused(mic.id(), true).await.unwrap();
    harness.manager.set_track_paused(mic.id(), false).await.unwrap();

    assert_eq!(harness.signaling.count("pause-producer"), 1);
    assert_eq!(harness.signaling.count("resume-producer"), 1);
}

#[tokio::test]
async fn test_replace_track_keeps_the_producer() {
    let harness = Harness::new();
    let capture = harness.join_with_media().await.unwrap();
    let camera = capture.camera().unwrap().clone();
    let producer = harness.manager.producer_for_track(camera.id()).unwrap();

    let devices = FakeMediaDevices::new();
    let replacement = devices
        .get_user_media(&CaptureRequest::video_only(QualityLevel::High.constraints()))
        .await
        .unwrap()
        .remove(0);
    harness
        .manager
        .replace_track(camera.id(), replacement.clone())
        .await
        .unwrap();

    assert_eq!(
        harness.manager.producer_for_track(replacement.id()),
        Some(producer)
    );
    assert_eq!(harness.signaling.count("produce"), 2);
    assert_eq!(
        harness.engine.send_transport().unwrap().replaced(),
        vec![(camera.id().clone(), replacement.id().clone())]
    );
}

#[tokio::test]
async fn test_leave_notifies_server_and_closes_everything() {
    let harness = Harness::new();
    harness.join_with_media().await.unwrap();
    harness.new_producer("remote-cam", Some(MediaKind::Video)).await;

    harness.manager.leave().await;
    harness.manager.leave().await;

    assert_eq!(harness.manager.state(), ForwardingState::Closed);
    assert_eq!(harness.signaling.emitted_named("close-producer").len(), 2);
    assert_eq!(harness.signaling.emitted_named("close-consumer").len(), 1);
    assert_eq!(
        harness.signaling.emitted_named("leave-room"),
        vec![SignalRequest::LeaveRoom {
            room_id: RoomId::from("townhall")
        }]
    );
    assert!(harness.engine.transports().iter().all(|t| t.is_closed()));
}
