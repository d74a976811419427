//! Signaling channel seam
//!
//! The transport itself (a socket connection) lives outside this crate and
//! implements [`SignalingChannel`]. [`Signaling`] wraps it with the bounded
//! round-trip timeout and typed ack decoding every manager relies on.

pub mod messages;

pub use messages::{JoinAck, ProduceAck, ServerEvent, SignalRequest};

use crate::errors::{Result, SessionError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Ordered, at-most-once request/ack channel with fire-and-forget events.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a request and wait for its acknowledgement payload.
    async fn request(&self, request: SignalRequest) -> Result<serde_json::Value>;

    /// Send without waiting for an acknowledgement.
    async fn emit(&self, event: SignalRequest) -> Result<()>;
}

#[derive(Clone)]
pub struct Signaling {
    channel: Arc<dyn SignalingChannel>,
    timeout: Duration,
}

impl Signaling {
    pub fn new(channel: Arc<dyn SignalingChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Round-trip bounded by the default timeout, ack decoded into `T`.
    pub async fn call<T: DeserializeOwned>(&self, request: SignalRequest) -> Result<T> {
        self.call_within(request, self.timeout).await
    }

    pub async fn call_within<T: DeserializeOwned>(
        &self,
        request: SignalRequest,
        timeout: Duration,
    ) -> Result<T> {
        let name = request.name();
        log::debug!("-> {}", name);

        let ack = match tokio::time::timeout(timeout, self.channel.request(request)).await {
            Ok(ack) => ack?,
            Err(_) => {
                log::warn!("Signaling request '{}' timed out after {:?}", name, timeout);
                return Err(SessionError::timeout(name, timeout.as_millis() as u64));
            }
        };

        serde_json::from_value(ack).map_err(|e| {
            SessionError::Signaling(format!("malformed '{}' acknowledgement: {}", name, e))
        })
    }

    /// Round-trip whose ack payload carries nothing we need.
    pub async fn send(&self, request: SignalRequest) -> Result<()> {
        self.call::<serde::de::IgnoredAny>(request).await.map(|_| ())
    }

    pub async fn notify(&self, event: SignalRequest) -> Result<()> {
        log::debug!("-> {} (no ack)", event.name());
        self.channel.emit(event).await
    }
}
