//! Controller-level tests: capture lifecycle, camera switching, quality
//! changes, screen sharing and ended-track interrupts in both modes.

use crabmeet::config::CrabMeetConfig;
use crabmeet::events::{SessionEvent, SessionInput};
use crabmeet::signaling::ServerEvent;
use crabmeet::testing::{
    FakeForwardingEngine, FakeMediaDevices, FakeNegotiatorFactory, MockReply, MockSignaling,
};
use crabmeet::{
    ErrorScope, FacingMode, MediaSessionController, PeerId, QualityLevel, SessionError,
    SessionErrorKind, SessionMode,
};
use crabmeet::forwarding::TransportState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Rig {
    controller: MediaSessionController,
    devices: Arc<FakeMediaDevices>,
    signaling: Arc<MockSignaling>,
    factory: Arc<FakeNegotiatorFactory>,
    engine: Arc<FakeForwardingEngine>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Rig {
    fn new(mode: SessionMode, devices: FakeMediaDevices) -> Self {
        let mut config = CrabMeetConfig::default();
        config.session.mode = mode;

        let devices = Arc::new(devices);
        let signaling = Arc::new(MockSignaling::new());
        let factory = Arc::new(FakeNegotiatorFactory::new());
        let engine = Arc::new(FakeForwardingEngine::new());

        let controller = MediaSessionController::builder(config)
            .devices(devices.clone())
            .signaling(signaling.clone())
            .mesh_engine(factory.clone())
            .forwarding_engine(engine.clone())
            .build()
            .unwrap();
        let events = controller.subscribe();
        Self {
            controller,
            devices,
            signaling,
            factory,
            engine,
            events,
        }
    }

    fn mesh() -> Self {
        Self::new(SessionMode::Mesh, FakeMediaDevices::new())
    }

    fn forwarding() -> Self {
        Self::new(SessionMode::Forwarding, FakeMediaDevices::new())
    }

    fn events(&mut self) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

fn error_kinds(events: &[SessionEvent], wanted: ErrorScope) -> Vec<SessionErrorKind> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SessionError { kind, scope, .. } if *scope == wanted => Some(*kind),
            _ => None,
        })
        .collect()
}

fn screen_changes(events: &[SessionEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ScreenShareChanged { active } => Some(*active),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_start_and_stop_mesh_session() {
    let mut rig = Rig::mesh();
    rig.controller.start("standup").await.unwrap();

    assert!(rig.controller.is_active());
    assert_eq!(rig.controller.room_id().unwrap().as_str(), "standup");
    assert_eq!(
        rig.events(),
        vec![SessionEvent::LocalStreamReady {
            audio: true,
            video: true
        }]
    );

    let snapshot = rig.controller.snapshot();
    assert_eq!(snapshot.mode, SessionMode::Mesh);
    assert!(snapshot.capture.audio && snapshot.capture.video);
    assert!(snapshot.mesh.is_some());
    assert!(snapshot.forwarding.is_none());

    rig.controller.stop().await;
    rig.controller.stop().await;

    assert!(!rig.controller.is_active());
    assert!(rig.devices.issued_tracks().iter().all(|t| t.is_ended()));
    assert_eq!(rig.signaling.emitted_named("leave-room").len(), 1);
}

#[tokio::test]
async fn test_capture_request_uses_quality_and_facing() {
    let mut rig = Rig::mesh();
    rig.controller.start("standup").await.unwrap();

    let request = rig.devices.requests()[0];
    assert!(request.audio);
    assert_eq!(
        request.video,
        Some(QualityLevel::Medium.constraints().with_facing(FacingMode::User))
    );
}

#[tokio::test]
async fn test_denied_permission_is_a_session_error() {
    let mut rig = Rig::mesh();
    rig.devices.deny_permission(true);

    let result = rig.controller.start("standup").await;

    assert!(matches!(result, Err(SessionError::Device(_))));
    assert!(!rig.controller.is_active());
    assert_eq!(rig.signaling.count("join-room"), 0);
    assert_eq!(
        error_kinds(&rig.events(), ErrorScope::Session),
        vec![SessionErrorKind::Device]
    );
}

#[tokio::test]
async fn test_failed_join_releases_capture() {
    let mut rig = Rig::mesh();
    rig.signaling
        .respond("join-room", MockReply::Reject("room is full".to_string()));

    let result = rig.controller.start("standup").await;

    assert!(matches!(result, Err(SessionError::Signaling(_))));
    assert!(!rig.controller.is_active());
    assert!(rig.devices.issued_tracks().iter().all(|t| t.is_ended()));
    assert_eq!(
        error_kinds(&rig.events(), ErrorScope::Session),
        vec![SessionErrorKind::Signaling]
    );
}

#[tokio::test]
async fn test_restart_leaves_previous_room() {
    let mut rig = Rig::mesh();
    rig.controller.start("first").await.unwrap();
    rig.controller.start("second").await.unwrap();

    assert_eq!(rig.controller.room_id().unwrap().as_str(), "second");
    assert_eq!(rig.signaling.emitted_named("leave-room").len(), 1);
    let issued = rig.devices.issued_tracks();
    assert_eq!(issued.len(), 4);
    assert!(issued[..2].iter().all(|t| t.is_ended()));
    assert!(issued[2..].iter().all(|t| !t.is_ended()));
}

#[tokio::test]
async fn test_switch_camera_keeps_video_flowing() {
    let mut rig = Rig::mesh();
    rig.signaling.set_room("alice", &["bob"]);
    rig.controller.start("standup").await.unwrap();
    let old = rig.controller.capture().camera().unwrap().clone();

    rig.controller.switch_camera().await.unwrap();

    let new = rig.controller.capture().camera().unwrap().clone();
    assert_ne!(old.id(), new.id());
    assert!(old.is_ended());
    assert!(!new.is_ended());
    assert_eq!(rig.controller.facing_mode(), FacingMode::Environment);
    assert_eq!(
        new.constraints().unwrap().facing_mode,
        Some(FacingMode::Environment)
    );

    // Same sender, new media: no renegotiation.
    let bob = rig.factory.latest("bob").unwrap();
    assert!(bob.track_ids().contains(new.id()));
    assert!(!bob.track_ids().contains(old.id()));
    assert_eq!(bob.offer_count(), 1);
}

#[tokio::test]
async fn test_switch_camera_needs_two_cameras() {
    let mut rig = Rig::new(SessionMode::Mesh, FakeMediaDevices::with_cameras(1));
    rig.controller.start("standup").await.unwrap();
    let camera = rig.controller.capture().camera().unwrap().clone();

    let result = rig.controller.switch_camera().await;

    assert!(matches!(result, Err(SessionError::Device(_))));
    assert_eq!(rig.controller.capture().camera(), Some(&camera));
    assert!(!camera.is_ended());
    assert_eq!(rig.controller.facing_mode(), FacingMode::User);
}

#[tokio::test]
async fn test_refused_switch_keeps_current_camera() {
    let mut rig = Rig::mesh();
    rig.signaling.set_room("alice", &["bob"]);
    rig.factory.reject_replace_for("bob");
    rig.controller.start("standup").await.unwrap();
    let camera = rig.controller.capture().camera().unwrap().clone();

    assert!(rig.controller.switch_camera().await.is_err());

    assert_eq!(rig.controller.capture().camera(), Some(&camera));
    assert!(!camera.is_ended());
    let replacement = rig.devices.issued_tracks().pop().unwrap();
    assert!(replacement.is_ended());
    assert_eq!(rig.controller.facing_mode(), FacingMode::User);
}

#[tokio::test]
async fn test_change_quality_applies_in_place() {
    let mut rig = Rig::forwarding();
    rig.controller.start("townhall").await.unwrap();
    let camera = rig.controller.capture().camera().unwrap().clone();

    rig.controller.change_quality(QualityLevel::High).await.unwrap();

    assert_eq!(rig.controller.quality(), QualityLevel::High);
    assert_eq!(rig.controller.capture().camera(), Some(&camera));
    assert_eq!(camera.constraints().unwrap().width, 1280);
    assert_eq!(rig.signaling.count("produce"), 2);
}

#[tokio::test]
async fn test_rejected_quality_keeps_previous_level() {
    let mut rig = Rig::mesh();
    rig.controller.start("standup").await.unwrap();
    rig.events();
    rig.devices.reject_constraints(true);

    let result = rig.controller.change_quality(QualityLevel::FullHd).await;

    assert!(matches!(result, Err(SessionError::ConstraintRejected(_))));
    assert_eq!(rig.controller.quality(), QualityLevel::Medium);
    assert!(rig.controller.is_active());
    assert_eq!(
        error_kinds(&rig.events(), ErrorScope::Operation),
        vec![SessionErrorKind::Constraint]
    );
}

#[tokio::test]
async fn test_screen_share_lifecycle_in_forwarding_mode() {
    let mut rig = Rig::forwarding();
    rig.controller.start("townhall").await.unwrap();

    rig.controller.start_screen_share().await.unwrap();
    assert!(rig.controller.is_screen_sharing());
    assert_eq!(rig.signaling.count("produce"), 3);
    assert!(matches!(
        rig.controller.start_screen_share().await,
        Err(SessionError::InvalidState(_))
    ));

    rig.controller.stop_screen_share().await.unwrap();
    rig.controller.stop_screen_share().await.unwrap();

    assert!(!rig.controller.is_screen_sharing());
    assert_eq!(rig.signaling.count("close-producer"), 1);
    assert!(rig.controller.capture().camera().is_some());
    assert_eq!(screen_changes(&rig.events()), vec![true, false]);
}

#[tokio::test]
async fn test_screen_share_ended_by_user_agent() {
    let mut rig = Rig::mesh();
    rig.signaling.set_room("alice", &["bob"]);
    rig.controller.start("standup").await.unwrap();
    rig.controller.start_screen_share().await.unwrap();
    let screen = rig.controller.capture().screen().unwrap().clone();
    assert!(rig.factory.latest("bob").unwrap().track_ids().contains(screen.id()));

    screen.notify_ended();
    assert_eq!(rig.controller.process_pending().await, 1);

    assert!(!rig.controller.is_screen_sharing());
    assert!(!rig.factory.latest("bob").unwrap().track_ids().contains(screen.id()));
    assert!(rig.controller.capture().camera().is_some());
    assert_eq!(screen_changes(&rig.events()), vec![true, false]);
}

#[tokio::test]
async fn test_camera_unplugged_is_an_operation_warning() {
    let mut rig = Rig::forwarding();
    rig.controller.start("townhall").await.unwrap();
    rig.events();
    let camera = rig.controller.capture().camera().unwrap().clone();

    camera.notify_ended();
    rig.controller.process_pending().await;

    assert!(rig.controller.is_active());
    assert!(rig.controller.capture().camera().is_none());
    assert!(rig.controller.capture().audio().is_some());
    assert_eq!(rig.signaling.count("close-producer"), 1);
    assert_eq!(
        error_kinds(&rig.events(), ErrorScope::Operation),
        vec![SessionErrorKind::Device]
    );
}

#[tokio::test]
async fn test_mute_pauses_producer() {
    let mut rig = Rig::forwarding();
    rig.controller.start("townhall").await.unwrap();

    rig.controller.set_microphone_enabled(false).await.unwrap();
    assert!(!rig.controller.snapshot().capture.audio_enabled);
    assert_eq!(rig.signaling.count("pause-producer"), 1);

    rig.controller.set_microphone_enabled(true).await.unwrap();
    assert!(rig.controller.snapshot().capture.audio_enabled);
    assert_eq!(rig.signaling.count("resume-producer"), 1);
}

#[tokio::test]
async fn test_fatal_forwarding_failure_releases_capture() {
    let mut rig = Rig::forwarding();
    rig.controller.start("townhall").await.unwrap();
    rig.events();

    rig.engine
        .send_transport()
        .unwrap()
        .emit_state(TransportState::Failed);
    rig.controller.process_pending().await;

    assert!(!rig.controller.is_active());
    assert!(rig.devices.issued_tracks().iter().all(|t| t.is_ended()));
    assert_eq!(
        error_kinds(&rig.events(), ErrorScope::Session),
        vec![SessionErrorKind::TransportFailed]
    );
}

#[tokio::test]
async fn test_mode_is_fixed_during_a_session() {
    let mut rig = Rig::mesh();
    rig.controller.set_mode(SessionMode::Forwarding).unwrap();
    rig.controller.set_mode(SessionMode::Mesh).unwrap();
    rig.controller.start("standup").await.unwrap();

    assert!(matches!(
        rig.controller.set_mode(SessionMode::Forwarding),
        Err(SessionError::InvalidState(_))
    ));
}

#[test]
fn test_builder_requires_signaling() {
    let result = MediaSessionController::builder(CrabMeetConfig::default())
        .devices(Arc::new(FakeMediaDevices::new()))
        .mesh_engine(Arc::new(FakeNegotiatorFactory::new()))
        .build();
    assert!(matches!(result, Err(SessionError::Config(_))));
}

#[test]
fn test_builder_requires_engine_for_mode() {
    let mut config = CrabMeetConfig::default();
    config.session.mode = SessionMode::Forwarding;
    let result = MediaSessionController::builder(config)
        .devices(Arc::new(FakeMediaDevices::new()))
        .signaling(Arc::new(MockSignaling::new()))
        .mesh_engine(Arc::new(FakeNegotiatorFactory::new()))
        .build();
    assert!(matches!(result, Err(SessionError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_run_until_handles_inputs_then_stops() {
    let mut rig = Rig::mesh();
    rig.signaling.set_room("alice", &[]);
    rig.controller.start("standup").await.unwrap();

    rig.controller
        .input_sender()
        .send(SessionInput::Server(ServerEvent::PeerJoined {
            peer_id: PeerId::from("bob"),
        }))
        .unwrap();

    rig.controller
        .run_until(tokio::time::sleep(Duration::from_secs(30)))
        .await;

    assert_eq!(rig.signaling.count("offer"), 1);
    assert!(!rig.controller.is_active());
    assert_eq!(rig.signaling.emitted_named("leave-room").len(), 1);
}
