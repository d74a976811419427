//! Top-level media session façade
//!
//! [`MediaSessionController`] owns local capture, picks the session mode and
//! delegates transport work to the mesh or forwarding manager. All inputs
//! (server events, engine callbacks, track "ended" interrupts) arrive on one
//! queue and are handled one at a time through [`MediaSessionController::dispatch`].

use crate::capture::{CaptureRequest, LocalCapture, MediaDevices, MediaTrack};
use crate::config::CrabMeetConfig;
use crate::errors::{ErrorScope, Result, SessionError};
use crate::events::{
    EngineEvent, EventEmitter, InputReceiver, InputSender, SessionEvent, SessionInput,
};
use crate::forwarding::{ForwardingEngine, ForwardingSessionManager, ForwardingSnapshot};
use crate::mesh::{MeshSessionManager, MeshSnapshot};
use crate::quality::QualityLevel;
use crate::rtc::PeerNegotiatorFactory;
use crate::signaling::{ServerEvent, Signaling, SignalingChannel};
use crate::types::{FacingMode, MediaKind, MediaSource, RoomId, SessionMode, TrackId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

/// The manager running the active session.
#[derive(Clone)]
pub enum SessionManager {
    Mesh(Arc<MeshSessionManager>),
    Forwarding(Arc<ForwardingSessionManager>),
}

impl SessionManager {
    pub fn mode(&self) -> SessionMode {
        match self {
            SessionManager::Mesh(_) => SessionMode::Mesh,
            SessionManager::Forwarding(_) => SessionMode::Forwarding,
        }
    }

    async fn join(&self, room_id: RoomId, capture: &LocalCapture) -> Result<()> {
        match self {
            SessionManager::Mesh(mesh) => mesh.join(room_id, capture).await,
            SessionManager::Forwarding(forwarding) => forwarding.join(room_id, capture).await,
        }
    }

    async fn leave(&self) {
        match self {
            SessionManager::Mesh(mesh) => mesh.leave().await,
            SessionManager::Forwarding(forwarding) => forwarding.leave().await,
        }
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match self {
            SessionManager::Mesh(mesh) => mesh.handle_server_event(event).await,
            SessionManager::Forwarding(forwarding) => forwarding.handle_server_event(event).await,
        }
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        match self {
            SessionManager::Mesh(mesh) => mesh.handle_engine_event(event).await,
            SessionManager::Forwarding(forwarding) => forwarding.handle_engine_event(event).await,
        }
    }

    async fn replace_track(&self, old: &TrackId, new: MediaTrack) -> Result<()> {
        match self {
            SessionManager::Mesh(mesh) => mesh.replace_track(old, new).await,
            SessionManager::Forwarding(forwarding) => forwarding.replace_track(old, new).await,
        }
    }

    async fn add_screen(&self, track: MediaTrack) -> Result<()> {
        match self {
            SessionManager::Mesh(mesh) => mesh.add_track(track).await,
            SessionManager::Forwarding(forwarding) => forwarding
                .add_producer(track, MediaSource::Screen)
                .await
                .map(|_| ()),
        }
    }

    /// Stop sending a local track that is going away.
    async fn drop_track(&self, track_id: &TrackId) -> Result<()> {
        match self {
            SessionManager::Mesh(mesh) => mesh.remove_track(track_id).await,
            SessionManager::Forwarding(forwarding) => forwarding.on_track_ended(track_id).await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            SessionManager::Mesh(_) => false,
            SessionManager::Forwarding(forwarding) => forwarding.is_closed(),
        }
    }
}

struct ActiveSession {
    room_id: RoomId,
    manager: SessionManager,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSnapshot {
    pub audio: bool,
    pub audio_enabled: bool,
    pub video: bool,
    pub video_enabled: bool,
    pub screen: bool,
}

/// Point-in-time view of the controller and its active session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub room_id: Option<RoomId>,
    pub mode: SessionMode,
    pub started_at: Option<DateTime<Utc>>,
    pub quality: QualityLevel,
    pub facing_mode: FacingMode,
    pub capture: CaptureSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarding: Option<ForwardingSnapshot>,
}

/// Wires the collaborators a controller needs.
pub struct ControllerBuilder {
    config: CrabMeetConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    channel: Option<Arc<dyn SignalingChannel>>,
    negotiators: Option<Arc<dyn PeerNegotiatorFactory>>,
    forwarding_engine: Option<Arc<dyn ForwardingEngine>>,
}

impl ControllerBuilder {
    pub fn new(config: CrabMeetConfig) -> Self {
        Self {
            config,
            devices: None,
            channel: None,
            negotiators: None,
            forwarding_engine: None,
        }
    }

    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn signaling(mut self, channel: Arc<dyn SignalingChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Engine for mesh sessions.
    pub fn mesh_engine(mut self, factory: Arc<dyn PeerNegotiatorFactory>) -> Self {
        self.negotiators = Some(factory);
        self
    }

    /// Engine for forwarding sessions.
    pub fn forwarding_engine(mut self, engine: Arc<dyn ForwardingEngine>) -> Self {
        self.forwarding_engine = Some(engine);
        self
    }

    pub fn build(self) -> Result<MediaSessionController> {
        self.config.validate()?;

        let devices = self
            .devices
            .ok_or_else(|| SessionError::Config("no capture devices configured".to_string()))?;
        let channel = self
            .channel
            .ok_or_else(|| SessionError::Config("no signaling channel configured".to_string()))?;

        let controller = MediaSessionController {
            signaling: Signaling::new(channel, self.config.session.signaling_timeout()),
            emitter: EventEmitter::new(self.config.session.event_capacity),
            quality: self.config.capture.default_quality,
            facing: self.config.capture.facing_mode,
            mode: self.config.session.mode,
            inputs: mpsc::unbounded_channel(),
            capture: LocalCapture::new(),
            session: None,
            negotiators: self.negotiators,
            forwarding_engine: self.forwarding_engine,
            devices,
            config: self.config,
        };
        controller.ensure_engine(controller.mode)?;
        Ok(controller)
    }
}

pub struct MediaSessionController {
    config: CrabMeetConfig,
    devices: Arc<dyn MediaDevices>,
    signaling: Signaling,
    negotiators: Option<Arc<dyn PeerNegotiatorFactory>>,
    forwarding_engine: Option<Arc<dyn ForwardingEngine>>,
    emitter: EventEmitter,
    inputs: (InputSender, InputReceiver),
    capture: LocalCapture,
    session: Option<ActiveSession>,
    mode: SessionMode,
    quality: QualityLevel,
    facing: FacingMode,
}

impl MediaSessionController {
    pub fn builder(config: CrabMeetConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    pub fn config(&self) -> &CrabMeetConfig {
        &self.config
    }

    /// Where server events and engine callbacks must be delivered.
    pub fn input_sender(&self) -> InputSender {
        self.inputs.0.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.emitter.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.session.as_ref().map(|s| &s.room_id)
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn capture(&self) -> &LocalCapture {
        &self.capture
    }

    pub fn quality(&self) -> QualityLevel {
        self.quality
    }

    pub fn facing_mode(&self) -> FacingMode {
        self.facing
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.capture.screen().is_some()
    }

    pub fn manager(&self) -> Option<SessionManager> {
        self.session.as_ref().map(|s| s.manager.clone())
    }

    pub fn mesh(&self) -> Option<Arc<MeshSessionManager>> {
        match self.manager() {
            Some(SessionManager::Mesh(mesh)) => Some(mesh),
            _ => None,
        }
    }

    pub fn forwarding(&self) -> Option<Arc<ForwardingSessionManager>> {
        match self.manager() {
            Some(SessionManager::Forwarding(forwarding)) => Some(forwarding),
            _ => None,
        }
    }

    fn ensure_engine(&self, mode: SessionMode) -> Result<()> {
        let present = match mode {
            SessionMode::Mesh => self.negotiators.is_some(),
            SessionMode::Forwarding => self.forwarding_engine.is_some(),
        };
        if present {
            Ok(())
        } else {
            Err(SessionError::Config(format!(
                "no {:?} engine configured",
                mode
            )))
        }
    }

    /// Mode used by the next `start`.
    pub fn set_mode(&mut self, mode: SessionMode) -> Result<()> {
        if self.session.is_some() {
            return Err(SessionError::InvalidState(
                "cannot change mode during a session".to_string(),
            ));
        }
        self.ensure_engine(mode)?;
        self.mode = mode;
        Ok(())
    }

    fn create_manager(&self) -> Result<SessionManager> {
        let session = &self.config.session;
        match self.mode {
            SessionMode::Mesh => {
                let factory = self.negotiators.clone().ok_or_else(|| {
                    SessionError::Config("no mesh engine configured".to_string())
                })?;
                Ok(SessionManager::Mesh(Arc::new(MeshSessionManager::new(
                    self.signaling.clone(),
                    factory,
                    self.config.rtc.clone(),
                    self.emitter.clone(),
                    self.input_sender(),
                    session.negotiation_timeout(),
                ))))
            }
            SessionMode::Forwarding => {
                let engine = self.forwarding_engine.clone().ok_or_else(|| {
                    SessionError::Config("no forwarding engine configured".to_string())
                })?;
                Ok(SessionManager::Forwarding(Arc::new(
                    ForwardingSessionManager::new(
                        self.signaling.clone(),
                        engine,
                        self.emitter.clone(),
                        self.input_sender(),
                        self.config.forwarding.simulcast.clone(),
                        session.transport_connect_timeout(),
                    ),
                )))
            }
        }
    }

    /// Start a session in `room_id`, restarting if one is already running.
    ///
    /// Capture failures surface as [`SessionError::Device`] and are never
    /// retried. A failed join tears everything down again.
    pub async fn start(&mut self, room_id: impl Into<RoomId>) -> Result<()> {
        let room_id = room_id.into();
        if let Some(active) = &self.session {
            log::info!("Restarting: leaving room {} first", active.room_id);
            self.stop().await;
        }

        let manager = self.create_manager()?;

        let request = CaptureRequest {
            audio: self.config.capture.audio,
            video: Some(self.quality.constraints().with_facing(self.facing)),
        };
        let capture = match self.acquire(&request).await {
            Ok(capture) => capture,
            Err(e) => {
                self.emitter.error(&e, ErrorScope::Session);
                return Err(e);
            }
        };
        capture.subscribe_ended(&self.inputs.0);
        self.emitter.emit(SessionEvent::LocalStreamReady {
            audio: capture.audio().is_some(),
            video: capture.camera().is_some(),
        });
        self.capture = capture;

        log::info!("Starting {:?} session in room {}", self.mode, room_id);
        self.session = Some(ActiveSession {
            room_id: room_id.clone(),
            manager: manager.clone(),
            started_at: Utc::now(),
        });

        if let Err(e) = manager.join(room_id, &self.capture).await {
            self.stop().await;
            self.emitter.error(&e, ErrorScope::Session);
            return Err(e);
        }
        self.reap_if_closed().await;
        Ok(())
    }

    async fn acquire(&self, request: &CaptureRequest) -> Result<LocalCapture> {
        let tracks = self.devices.get_user_media(request).await?;
        let issued = tracks.clone();
        LocalCapture::from_tracks(tracks).map_err(|e| {
            for track in &issued {
                track.stop();
            }
            e
        })
    }

    /// Leave the session and release every local track. No-op when idle.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            log::debug!("stop() without an active session");
            return;
        };

        session.manager.leave().await;

        let was_sharing = self.capture.screen().is_some();
        self.capture.stop_all();
        if was_sharing {
            self.emitter
                .emit(SessionEvent::ScreenShareChanged { active: false });
        }

        let mut discarded = 0;
        while self.inputs.1.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            log::debug!("Discarded {} input(s) of the finished session", discarded);
        }
        log::info!("Session in room {} stopped", session.room_id);
    }

    fn require_manager(&self) -> Result<SessionManager> {
        self.manager()
            .ok_or_else(|| SessionError::InvalidState("no active session".to_string()))
    }

    /// Swap to the camera facing the other way without renegotiating.
    ///
    /// The new track is acquired before anything is touched; on any failure
    /// the current camera track keeps running.
    pub async fn switch_camera(&mut self) -> Result<()> {
        let manager = self.require_manager()?;
        let current = self
            .capture
            .camera()
            .cloned()
            .ok_or_else(|| SessionError::Device("no camera track to switch".to_string()))?;

        let cameras = self.devices.video_input_count().await?;
        if cameras < 2 {
            return Err(SessionError::Device(format!(
                "cannot switch cameras with {} camera(s) available",
                cameras
            )));
        }

        let facing = self.facing.opposite();
        let request = CaptureRequest::video_only(self.quality.constraints().with_facing(facing));
        let mut tracks = self.devices.get_user_media(&request).await?;
        let position = tracks.iter().position(|t| t.kind() == MediaKind::Video);
        let replacement = match position {
            Some(index) => tracks.remove(index),
            None => {
                for track in &tracks {
                    track.stop();
                }
                return Err(SessionError::Device(
                    "camera returned no video track".to_string(),
                ));
            }
        };
        for extra in &tracks {
            extra.stop();
        }

        if let Err(e) = manager
            .replace_track(current.id(), replacement.clone())
            .await
        {
            replacement.stop();
            self.reap_if_closed().await;
            return Err(e);
        }

        replacement.set_enabled(current.is_enabled());
        replacement.subscribe_ended(self.input_sender());
        self.capture.replace_camera(replacement);
        current.stop();
        self.facing = facing;
        log::info!("Switched camera to {:?}", facing);
        Ok(())
    }

    /// Apply a quality preset to the camera track in place.
    ///
    /// A rejected constraint keeps the previous quality and is reported as an
    /// operation warning; the session carries on.
    pub async fn change_quality(&mut self, level: QualityLevel) -> Result<()> {
        let Some(camera) = self.capture.camera().cloned() else {
            self.quality = level;
            return Ok(());
        };

        let constraints = level.constraints().with_facing(self.facing);
        match camera.apply_constraints(constraints).await {
            Ok(()) => {
                log::info!("Quality changed from {:?} to {:?}", self.quality, level);
                self.quality = level;
                Ok(())
            }
            Err(e) => {
                self.emitter.error(&e, ErrorScope::Operation);
                Err(e)
            }
        }
    }

    pub async fn start_screen_share(&mut self) -> Result<()> {
        let manager = self.require_manager()?;
        if self.capture.screen().is_some() {
            return Err(SessionError::InvalidState(
                "screen sharing is already active".to_string(),
            ));
        }

        let track = self.devices.get_display_media().await?;
        if let Err(e) = manager.add_screen(track.clone()).await {
            track.stop();
            self.reap_if_closed().await;
            return Err(e);
        }

        track.subscribe_ended(self.input_sender());
        self.capture.set_screen(track)?;
        log::info!("Screen sharing started");
        self.emitter
            .emit(SessionEvent::ScreenShareChanged { active: true });
        Ok(())
    }

    /// Stop sharing. A no-op when nothing is being shared.
    pub async fn stop_screen_share(&mut self) -> Result<()> {
        match self.capture.take_screen() {
            Some(track) => self.release_screen(track).await,
            None => Ok(()),
        }
    }

    async fn release_screen(&mut self, track: MediaTrack) -> Result<()> {
        let result = match self.manager() {
            Some(manager) => manager.drop_track(track.id()).await,
            None => Ok(()),
        };
        track.stop();
        log::info!("Screen sharing stopped");
        self.emitter
            .emit(SessionEvent::ScreenShareChanged { active: false });
        self.reap_if_closed().await;
        result
    }

    pub async fn set_microphone_enabled(&mut self, enabled: bool) -> Result<()> {
        let track = self
            .capture
            .audio()
            .cloned()
            .ok_or_else(|| SessionError::Device("no microphone track".to_string()))?;
        self.set_track_enabled(track, enabled).await
    }

    pub async fn set_camera_enabled(&mut self, enabled: bool) -> Result<()> {
        let track = self
            .capture
            .camera()
            .cloned()
            .ok_or_else(|| SessionError::Device("no camera track".to_string()))?;
        self.set_track_enabled(track, enabled).await
    }

    async fn set_track_enabled(&mut self, track: MediaTrack, enabled: bool) -> Result<()> {
        track.set_enabled(enabled);
        if let Some(forwarding) = self.forwarding() {
            if let Err(e) = forwarding.set_track_paused(track.id(), !enabled).await {
                track.set_enabled(!enabled);
                self.reap_if_closed().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Handle one input from the queue.
    pub async fn dispatch(&mut self, input: SessionInput) {
        let Some(manager) = self.manager() else {
            log::debug!("Dropping input without a session: {:?}", input);
            return;
        };

        match input {
            SessionInput::Server(event) => manager.handle_server_event(event).await,
            SessionInput::Engine(event) => manager.handle_engine_event(event).await,
            SessionInput::TrackEnded { track_id } => self.on_track_ended(&manager, &track_id).await,
        }
        self.reap_if_closed().await;
    }

    async fn on_track_ended(&mut self, manager: &SessionManager, track_id: &TrackId) {
        match self.capture.source_of(track_id) {
            Some(MediaSource::Screen) => {
                if let Some(track) = self.capture.take_screen() {
                    if let Err(e) = self.release_screen(track).await {
                        log::warn!("Releasing ended screen track failed: {}", e);
                    }
                }
            }
            Some(source) => {
                self.capture.remove(track_id);
                let error = SessionError::Device(format!("{} track ended", source));
                self.emitter.error(&error, ErrorScope::Operation);
                if let Err(e) = manager.drop_track(track_id).await {
                    log::warn!("Dropping ended {} track failed: {}", source, e);
                }
            }
            None => log::debug!("Ended track {} is no longer captured", track_id),
        }
    }

    /// A forwarding session that failed on its own takes local capture with it.
    async fn reap_if_closed(&mut self) {
        let closed = self
            .session
            .as_ref()
            .is_some_and(|s| s.manager.is_closed());
        if closed {
            log::warn!("Session closed underneath the controller; releasing capture");
            self.stop().await;
        }
    }

    /// Dispatch everything already queued. Returns how many inputs were handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inputs.1.try_recv() {
            self.dispatch(input).await;
            handled += 1;
        }
        handled
    }

    /// Periodic housekeeping: fails mesh links stuck in negotiation.
    pub async fn tick(&mut self) -> usize {
        match self.mesh() {
            Some(mesh) => mesh.expire_stale_negotiations().await,
            None => 0,
        }
    }

    /// Drive the input queue and the watchdog until `shutdown` resolves, then stop.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        enum Wake {
            Input(SessionInput),
            Tick,
            Shutdown,
        }

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.session.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                input = self.inputs.1.recv() => match input {
                    Some(input) => Wake::Input(input),
                    None => Wake::Shutdown,
                },
                _ = ticker.tick() => Wake::Tick,
            };
            match wake {
                Wake::Input(input) => self.dispatch(input).await,
                Wake::Tick => {
                    self.tick().await;
                }
                Wake::Shutdown => break,
            }
        }
        self.stop().await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let audio = self.capture.audio();
        let camera = self.capture.camera();
        let manager = self.manager();

        SessionSnapshot {
            taken_at: Utc::now(),
            room_id: self.session.as_ref().map(|s| s.room_id.clone()),
            mode: manager.as_ref().map(SessionManager::mode).unwrap_or(self.mode),
            started_at: self.session.as_ref().map(|s| s.started_at),
            quality: self.quality,
            facing_mode: self.facing,
            capture: CaptureSnapshot {
                audio: audio.is_some(),
                audio_enabled: audio.is_some_and(MediaTrack::is_enabled),
                video: camera.is_some(),
                video_enabled: camera.is_some_and(MediaTrack::is_enabled),
                screen: self.capture.screen().is_some(),
            },
            mesh: match &manager {
                Some(SessionManager::Mesh(mesh)) => Some(mesh.snapshot()),
                _ => None,
            },
            forwarding: match &manager {
                Some(SessionManager::Forwarding(forwarding)) => Some(forwarding.snapshot()),
                _ => None,
            },
        }
    }
}
