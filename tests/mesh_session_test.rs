//! Mesh session integration tests
//!
//! Drives a `MeshSessionManager` against scripted signaling and fake peer
//! negotiators, pumping engine callbacks through the input queue the way the
//! controller does.

use crabmeet::capture::{CaptureRequest, LocalCapture, MediaDevices};
use crabmeet::events::{EventEmitter, InputReceiver, SessionEvent, SessionInput};
use crabmeet::mesh::{MeshSessionManager, MeshState, NegotiationRole, PeerLinkState};
use crabmeet::quality::QualityLevel;
use crabmeet::rtc::{ConnectionState, IceCandidate, RtcConfiguration, SessionDescription};
use crabmeet::signaling::{ServerEvent, SignalRequest, Signaling};
use crabmeet::testing::{FakeMediaDevices, FakeNegotiatorFactory, MockSignaling};
use crabmeet::{ErrorScope, MediaKind, PeerId, RoomId, SessionErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct Harness {
    signaling: Arc<MockSignaling>,
    factory: Arc<FakeNegotiatorFactory>,
    manager: MeshSessionManager,
    inputs: InputReceiver,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    fn new(self_id: &str, peers: &[&str]) -> Self {
        let signaling = Arc::new(MockSignaling::new());
        signaling.set_room(self_id, peers);
        let factory = Arc::new(FakeNegotiatorFactory::new());
        let emitter = EventEmitter::new(64);
        let events = emitter.subscribe();
        let (tx, inputs) = mpsc::unbounded_channel();

        let manager = MeshSessionManager::new(
            Signaling::new(signaling.clone(), Duration::from_secs(5)),
            factory.clone(),
            RtcConfiguration::default(),
            emitter,
            tx,
            Duration::from_secs(15),
        );
        Self {
            signaling,
            factory,
            manager,
            inputs,
            events,
        }
    }

    async fn join(&self) -> LocalCapture {
        let devices = FakeMediaDevices::new();
        let tracks = devices
            .get_user_media(&CaptureRequest::audio_video(QualityLevel::Medium.constraints()))
            .await
            .unwrap();
        let capture = LocalCapture::from_tracks(tracks).unwrap();
        self.manager
            .join(RoomId::from("standup"), &capture)
            .await
            .unwrap();
        capture
    }

    /// Feed queued engine callbacks back into the manager.
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

    async fn server(&self, event: ServerEvent) {
        self.manager.handle_server_event(event).await;
    }
}

fn peer(id: &str) -> PeerId {
    PeerId::from(id)
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{} 1 UDP 2122 10.0.0.{} 5000 typ host", n, n))
}

fn peer_errors(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::SessionError {
                    scope: ErrorScope::Peer,
                    ..
                }
            )
        })
        .count()
}

#[tokio::test]
async fn test_join_offers_to_present_peers_and_connects_on_answer() {
    let harness = Harness::new("alice", &["bob"]);
    harness.join().await;

    assert_eq!(harness.manager.state(), MeshState::Joined);
    assert_eq!(harness.manager.self_id(), Some(peer("alice")));
    assert_eq!(harness.signaling.count("offer"), 1);
    assert_eq!(
        harness.manager.link_state(&peer("bob")),
        Some(PeerLinkState::Negotiating)
    );

    let negotiator = harness.factory.latest("bob").unwrap();
    assert_eq!(negotiator.track_ids().len(), 2);
    assert!(negotiator.local_description().is_some());

    harness
        .server(ServerEvent::Answer {
            peer_id: peer("bob"),
            sdp: SessionDescription::answer("v=0 bob"),
        })
        .await;

    assert_eq!(
        harness.manager.link_state(&peer("bob")),
        Some(PeerLinkState::Connected)
    );
    let info = harness.manager.link_info(&peer("bob")).unwrap();
    assert_eq!(info.role, NegotiationRole::Offerer);
}

#[tokio::test]
async fn test_incoming_offer_is_answered() {
    let harness = Harness::new("alice", &[]);
    harness.join().await;
    assert_eq!(harness.manager.link_count(), 0);

    harness
        .server(ServerEvent::Offer {
            peer_id: peer("bob"),
            sdp: SessionDescription::offer("v=0 bob"),
        })
        .await;

    let answers = harness.signaling.requests_named("answer");
    assert_eq!(answers.len(), 1);
    match &answers[0] {
        SignalRequest::Answer { peer_id, .. } => assert_eq!(peer_id, &peer("bob")),
        other => panic!("unexpected request {:?}", other),
    }
    let info = harness.manager.link_info(&peer("bob")).unwrap();
    assert_eq!(info.role, NegotiationRole::Answerer);
    assert_eq!(info.state, PeerLinkState::Connected);
}

#[tokio::test]
async fn test_candidates_before_offer_are_applied_in_order() {
    let harness = Harness::new("alice", &[]);
    harness.join().await;

    for n in 1..=2 {
        harness
            .server(ServerEvent::IceCandidate {
                peer_id: peer("bob"),
                candidate: candidate(n),
            })
            .await;
    }

    harness
        .server(ServerEvent::Offer {
            peer_id: peer("bob"),
            sdp: SessionDescription::offer("v=0 bob"),
        })
        .await;
    harness
        .server(ServerEvent::IceCandidate {
            peer_id: peer("bob"),
            candidate: candidate(3),
        })
        .await;

    let negotiator = harness.factory.latest("bob").unwrap();
    assert_eq!(
        negotiator.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );
}

#[tokio::test]
async fn test_candidates_before_answer_wait_for_remote_description() {
    let harness = Harness::new("alice", &["bob"]);
    harness.join().await;

    harness
        .server(ServerEvent::IceCandidate {
            peer_id: peer("bob"),
            candidate: candidate(1),
        })
        .await;

    let negotiator = harness.factory.latest("bob").unwrap();
    assert!(negotiator.applied_candidates().is_empty());
    assert_eq!(
        harness.manager.link_info(&peer("bob")).unwrap().queued_candidates,
        1
    );

    harness
        .server(ServerEvent::Answer {
            peer_id: peer("bob"),
            sdp: SessionDescription::answer("v=0 bob"),
        })
        .await;
    assert_eq!(negotiator.applied_candidates(), vec![candidate(1)]);
}

#[tokio::test]
async fn test_failing_peer_does_not_affect_others() {
    let mut harness = Harness::new("alice", &["bob", "carol"]);
    harness.factory.fail_offers_for("carol");
    harness.join().await;

    assert_eq!(harness.manager.link_count(), 1);
    assert_eq!(
        harness.manager.link_state(&peer("bob")),
        Some(PeerLinkState::Negotiating)
    );
    assert_eq!(harness.manager.link_state(&peer("carol")), None);
    assert!(harness.factory.latest("carol").unwrap().is_closed());

    let events = harness.events();
    assert_eq!(peer_errors(&events), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::SessionError {
            kind: SessionErrorKind::Negotiation,
            ..
        }
    )));
}

#[tokio::test]
async fn test_ice_failure_fails_only_that_peer() {
    let mut harness = Harness::new("alice", &["bob", "carol"]);
    harness.join().await;

    harness
        .factory
        .latest("carol")
        .unwrap()
        .emit_state(ConnectionState::Failed);
    harness.pump().await;

    assert_eq!(harness.manager.link_state(&peer("carol")), None);
    assert_eq!(
        harness.manager.link_state(&peer("bob")),
        Some(PeerLinkState::Negotiating)
    );
    assert_eq!(peer_errors(&harness.events()), 1);
}

#[tokio::test]
async fn test_remote_tracks_are_announced_and_removed_on_leave() {
    let mut harness = Harness::new("alice", &["bob"]);
    harness.join().await;
    harness.events();

    let negotiator = harness.factory.latest("bob").unwrap();
    let track = negotiator.emit_remote_track(MediaKind::Video);
    harness.pump().await;

    let events = harness.events();
    assert!(matches!(
        &events[..],
        [SessionEvent::RemoteStreamAdded { id, kind: MediaKind::Video, .. }] if id == "bob"
    ));

    harness
        .server(ServerEvent::PeerLeft {
            peer_id: peer("bob"),
        })
        .await;

    assert_eq!(
        harness.events(),
        vec![SessionEvent::RemoteStreamRemoved {
            id: "bob".to_string()
        }]
    );
    assert!(track.is_ended());
    assert!(negotiator.is_closed());
    assert_eq!(harness.manager.link_count(), 0);
}

#[tokio::test]
async fn test_local_candidates_are_relayed() {
    let mut harness = Harness::new("alice", &["bob"]);
    harness.join().await;

    harness
        .factory
        .latest("bob")
        .unwrap()
        .emit_local_candidate(candidate(7));
    harness.pump().await;

    let relayed = harness.signaling.emitted_named("ice-candidate");
    assert_eq!(
        relayed,
        vec![SignalRequest::IceCandidate {
            peer_id: peer("bob"),
            candidate: candidate(7),
        }]
    );
}

#[tokio::test]
async fn test_glare_lower_id_keeps_its_offer() {
    let harness = Harness::new("alice", &["bob"]);
    harness.join().await;

    harness
        .server(ServerEvent::Offer {
            peer_id: peer("bob"),
            sdp: SessionDescription::offer("v=0 bob"),
        })
        .await;

    assert_eq!(harness.signaling.count("answer"), 0);
    assert_eq!(harness.factory.created_for("bob").len(), 1);
    let info = harness.manager.link_info(&peer("bob")).unwrap();
    assert_eq!(info.role, NegotiationRole::Offerer);
    assert_eq!(info.state, PeerLinkState::Negotiating);
}

#[tokio::test]
async fn test_glare_higher_id_yields_and_answers() {
    let harness = Harness::new("carol", &["bob"]);
    harness.join().await;
    let ours = harness.factory.latest("bob").unwrap();

    harness
        .server(ServerEvent::Offer {
            peer_id: peer("bob"),
            sdp: SessionDescription::offer("v=0 bob"),
        })
        .await;

    assert!(ours.is_closed());
    assert_eq!(harness.factory.created_for("bob").len(), 2);
    assert_eq!(harness.signaling.count("answer"), 1);
    let info = harness.manager.link_info(&peer("bob")).unwrap();
    assert_eq!(info.role, NegotiationRole::Answerer);
    assert_eq!(info.state, PeerLinkState::Connected);
}

#[tokio::test]
async fn test_stale_answer_is_ignored() {
    let harness = Harness::new("alice", &[]);
    harness.join().await;

    harness
        .server(ServerEvent::Answer {
            peer_id: peer("bob"),
            sdp: SessionDescription::answer("v=0 late"),
        })
        .await;

    assert_eq!(harness.manager.link_count(), 0);
    assert!(harness.factory.created_for("bob").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fails_stuck_negotiations() {
    let mut harness = Harness::new("alice", &["bob"]);
    harness.join().await;

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(harness.manager.expire_stale_negotiations().await, 0);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(harness.manager.expire_stale_negotiations().await, 1);

    assert_eq!(harness.manager.link_count(), 0);
    assert_eq!(peer_errors(&harness.events()), 1);
}

#[tokio::test]
async fn test_early_candidates_are_capped_per_peer() {
    let harness = Harness::new("alice", &[]);
    harness.join().await;

    for n in 0..100 {
        harness
            .server(ServerEvent::IceCandidate {
                peer_id: peer("mallory"),
                candidate: candidate(n),
            })
            .await;
    }

    assert_eq!(harness.manager.early_candidate_count(&peer("mallory")), 32);
    assert_eq!(harness.manager.link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_discards_early_candidates_of_absent_peers() {
    let harness = Harness::new("alice", &[]);
    harness.join().await;
    harness
        .server(ServerEvent::IceCandidate {
            peer_id: peer("ghost"),
            candidate: candidate(1),
        })
        .await;

    tokio::time::advance(Duration::from_secs(10)).await;
    harness.manager.expire_stale_negotiations().await;
    assert_eq!(harness.manager.early_candidate_count(&peer("ghost")), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(harness.manager.expire_stale_negotiations().await, 0);
    assert_eq!(harness.manager.early_candidate_count(&peer("ghost")), 0);
}

#[tokio::test]
async fn test_screen_track_renegotiates_connected_links() {
    let harness = Harness::new("alice", &["bob"]);
    let capture = harness.join().await;
    harness
        .server(ServerEvent::Answer {
            peer_id: peer("bob"),
            sdp: SessionDescription::answer("v=0 bob"),
        })
        .await;

    let devices = FakeMediaDevices::new();
    let screen = devices.get_display_media().await.unwrap();
    harness.manager.add_track(screen.clone()).await.unwrap();

    let negotiator = harness.factory.latest("bob").unwrap();
    assert_eq!(negotiator.offer_count(), 2);
    assert!(negotiator.track_ids().contains(screen.id()));
    assert_eq!(
        harness.manager.link_state(&peer("bob")),
        Some(PeerLinkState::Negotiating)
    );

    harness.manager.remove_track(screen.id()).await.unwrap();
    assert!(!negotiator.track_ids().contains(screen.id()));
    assert_eq!(capture.tracks().len(), 2);
}

#[tokio::test]
async fn test_screen_added_mid_negotiation_is_offered_after_answer() {
    let harness = Harness::new("alice", &["bob"]);
    harness.join().await;

    let devices = FakeMediaDevices::new();
    let screen = devices.get_display_media().await.unwrap();
    harness.manager.add_track(screen.clone()).await.unwrap();

    let negotiator = harness.factory.latest("bob").unwrap();
    assert_eq!(negotiator.offer_count(), 1);
    assert!(harness.manager.link_info(&peer("bob")).unwrap().renegotiation_pending);

    harness
        .server(ServerEvent::Answer {
            peer_id: peer("bob"),
            sdp: SessionDescription::answer("v=0 bob"),
        })
        .await;

    assert_eq!(negotiator.offer_count(), 2);
    let offers = harness.signaling.requests_named("offer");
    assert_eq!(offers.len(), 2);
    match offers.last() {
        Some(SignalRequest::Offer { peer_id, sdp }) => {
            assert_eq!(peer_id, &peer("bob"));
            assert!(sdp.sdp.contains("tracks=3"));
        }
        other => panic!("expected an offer, got {:?}", other),
    }
    assert_eq!(
        harness.manager.link_state(&peer("bob")),
        Some(PeerLinkState::Negotiating)
    );
    assert!(!harness.manager.link_info(&peer("bob")).unwrap().renegotiation_pending);
}

#[tokio::test]
async fn test_replace_track_rolls_back_when_a_peer_refuses() {
    let harness = Harness::new("alice", &["bob", "carol"]);
    harness.factory.reject_replace_for("carol");
    let capture = harness.join().await;

    let old = capture.camera().unwrap().clone();
    let devices = FakeMediaDevices::new();
    let replacement = devices
        .get_user_media(&CaptureRequest::video_only(QualityLevel::Medium.constraints()))
        .await
        .unwrap()
        .remove(0);

    let result = harness
        .manager
        .replace_track(old.id(), replacement.clone())
        .await;
    assert!(result.is_err());

    let bob = harness.factory.latest("bob").unwrap();
    assert!(bob.track_ids().contains(old.id()));
    assert!(!bob.track_ids().contains(replacement.id()));
}

#[tokio::test]
async fn test_leave_closes_links_and_announces() {
    let harness = Harness::new("alice", &["bob", "carol"]);
    harness.join().await;

    harness.manager.leave().await;

    assert_eq!(harness.manager.state(), MeshState::Closed);
    assert_eq!(harness.manager.link_count(), 0);
    assert!(harness.factory.latest("bob").unwrap().is_closed());
    assert!(harness.factory.latest("carol").unwrap().is_closed());
    assert_eq!(
        harness.signaling.emitted_named("leave-room"),
        vec![SignalRequest::LeaveRoom {
            room_id: RoomId::from("standup")
        }]
    );

    // Anything arriving afterwards is a no-op.
    harness
        .server(ServerEvent::PeerJoined {
            peer_id: peer("dave"),
        })
        .await;
    assert!(harness.factory.created_for("dave").is_empty());
}
