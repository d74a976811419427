use crate::errors::{Result, SessionError};
use crate::forwarding::capabilities::RtpCapabilities;
use crate::signaling::{SignalRequest, SignalingChannel};
use crate::testing::engines::default_capabilities;
use crate::types::{MediaKind, PeerId, ProducerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Scripted answer to one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    Ack(Value),
    Reject(String),
    /// Never answer; the caller's timeout decides.
    NoReply,
    Delayed(Duration, Value),
}

/// Signaling channel that acks like a cooperative server.
///
/// Replies can be overridden per request name with [`MockSignaling::respond`].
pub struct MockSignaling {
    requests: Mutex<Vec<SignalRequest>>,
    emitted: Mutex<Vec<SignalRequest>>,
    overrides: Mutex<HashMap<&'static str, MockReply>>,
    self_id: Mutex<PeerId>,
    peers: Mutex<Vec<PeerId>>,
    capabilities: Mutex<RtpCapabilities>,
    remote_kinds: Mutex<HashMap<ProducerId, MediaKind>>,
    next_producer: AtomicUsize,
    next_consumer: AtomicUsize,
}

impl Default for MockSignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSignaling {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
            overrides: Mutex::new(HashMap::new()),
            self_id: Mutex::new(PeerId::from("local")),
            peers: Mutex::new(Vec::new()),
            capabilities: Mutex::new(default_capabilities()),
            remote_kinds: Mutex::new(HashMap::new()),
            next_producer: AtomicUsize::new(1),
            next_consumer: AtomicUsize::new(1),
        }
    }

    /// Identity and room members returned by `join-room`.
    pub fn set_room(&self, self_id: &str, peers: &[&str]) {
        *self.self_id.lock() = PeerId::from(self_id);
        *self.peers.lock() = peers.iter().map(|p| PeerId::from(*p)).collect();
    }

    /// Capabilities returned by `get-capabilities`.
    pub fn set_capabilities(&self, capabilities: RtpCapabilities) {
        *self.capabilities.lock() = capabilities;
    }

    /// Kind reported by `consume` for a remote producer (video by default).
    pub fn set_remote_kind(&self, producer_id: &str, kind: MediaKind) {
        self.remote_kinds
            .lock()
            .insert(ProducerId::from(producer_id), kind);
    }

    pub fn respond(&self, request_name: &'static str, reply: MockReply) {
        self.overrides.lock().insert(request_name, reply);
    }

    pub fn clear_override(&self, request_name: &str) {
        self.overrides.lock().remove(request_name);
    }

    pub fn requests(&self) -> Vec<SignalRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_named(&self, name: &str) -> Vec<SignalRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.name() == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.name() == name).count()
    }

    pub fn emitted(&self) -> Vec<SignalRequest> {
        self.emitted.lock().clone()
    }

    pub fn emitted_named(&self, name: &str) -> Vec<SignalRequest> {
        self.emitted
            .lock()
            .iter()
            .filter(|r| r.name() == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
        self.emitted.lock().clear();
    }

    fn reply_for(&self, request: &SignalRequest) -> MockReply {
        if let Some(reply) = self.overrides.lock().get(request.name()) {
            return reply.clone();
        }
        MockReply::Ack(self.default_reply(request))
    }

    fn default_reply(&self, request: &SignalRequest) -> Value {
        match request {
            SignalRequest::JoinRoom { .. } => json!({
                "selfId": *self.self_id.lock(),
                "peers": *self.peers.lock(),
            }),
            SignalRequest::GetCapabilities { .. } => {
                serde_json::to_value(&*self.capabilities.lock()).unwrap_or(Value::Null)
            }
            SignalRequest::CreateTransport { direction, .. } => json!({
                "id": format!("{}-transport", direction),
                "iceParameters": { "usernameFragment": "frag", "password": "secret" },
                "iceCandidates": [],
                "dtlsParameters": {
                    "role": "auto",
                    "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }]
                },
            }),
            SignalRequest::Produce { .. } => {
                let n = self.next_producer.fetch_add(1, Ordering::SeqCst);
                json!({ "id": format!("producer-{}", n) })
            }
            SignalRequest::Consume { producer_id, .. } => {
                let n = self.next_consumer.fetch_add(1, Ordering::SeqCst);
                let kind = self
                    .remote_kinds
                    .lock()
                    .get(producer_id)
                    .copied()
                    .unwrap_or(MediaKind::Video);
                let codec = match kind {
                    MediaKind::Audio => json!({
                        "mimeType": "audio/opus",
                        "payloadType": 111,
                        "clockRate": 48000,
                        "channels": 2,
                    }),
                    MediaKind::Video => json!({
                        "mimeType": "video/VP8",
                        "payloadType": 96,
                        "clockRate": 90000,
                    }),
                };
                json!({
                    "id": format!("consumer-{}", n),
                    "producerId": producer_id,
                    "kind": kind,
                    "rtpParameters": { "codecs": [codec], "encodings": [] },
                })
            }
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl SignalingChannel for MockSignaling {
    async fn request(&self, request: SignalRequest) -> Result<Value> {
        let reply = self.reply_for(&request);
        self.requests.lock().push(request);
        match reply {
            MockReply::Ack(value) => Ok(value),
            MockReply::Reject(reason) => Err(SessionError::Signaling(reason)),
            MockReply::NoReply => futures::future::pending().await,
            MockReply::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        }
    }

    async fn emit(&self, event: SignalRequest) -> Result<()> {
        self.emitted.lock().push(event);
        Ok(())
    }
}
