use crate::capture::MediaTrack;
use crate::errors::{Result, SessionError};
use crate::forwarding::capabilities::RtpCodecCapability;
use crate::forwarding::consumer::Consumer;
use crate::forwarding::engine::{ConsumerOptions, TransportEngine, TransportOptions};
use crate::forwarding::producer::Producer;
use crate::quality::RtpEncoding;
use crate::signaling::{ProduceAck, SignalRequest, Signaling};
use crate::types::{MediaSource, TransportDirection, TransportId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// A callback that may fire once; a second firing is rejected.
#[derive(Debug)]
pub struct OnceHook {
    name: &'static str,
    fired: AtomicBool,
}

impl OnceHook {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fired: AtomicBool::new(false),
        }
    }

    pub fn fire(&self) -> Result<()> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return Err(SessionError::HookAlreadyFired(self.name));
        }
        Ok(())
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// One direction of the forwarding-server connection.
pub struct Transport {
    id: TransportId,
    direction: TransportDirection,
    engine: Arc<dyn TransportEngine>,
    signaling: Signaling,
    connect_timeout: Duration,
    state: Mutex<TransportState>,
    connect_hook: OnceHook,
    connected: OnceCell<()>,
}

impl Transport {
    pub fn new(
        options: &TransportOptions,
        direction: TransportDirection,
        engine: Arc<dyn TransportEngine>,
        signaling: Signaling,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            id: options.id.clone(),
            direction,
            engine,
            signaling,
            connect_timeout,
            state: Mutex::new(TransportState::New),
            connect_hook: OnceHook::new("connect"),
            connected: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &TransportId {
        &self.id
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn engine(&self) -> &Arc<dyn TransportEngine> {
        &self.engine
    }

    /// Record a state change. `closed` is final; `failed` only moves to `closed`.
    pub fn set_state(&self, next: TransportState) -> TransportState {
        let mut state = self.state.lock();
        let previous = *state;
        let allowed = match previous {
            TransportState::Closed => false,
            TransportState::Failed => next == TransportState::Closed,
            _ => true,
        };
        if allowed && previous != next {
            log::info!(
                "{} transport {}: {:?} -> {:?}",
                self.direction,
                self.id,
                previous,
                next
            );
            *state = next;
        }
        previous
    }

    pub fn connect_fired(&self) -> bool {
        self.connect_hook.has_fired()
    }

    /// Relay DTLS parameters to the server the first time they are needed.
    ///
    /// Concurrent callers share the single in-flight handshake.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Err(SessionError::TransportFailed(format!(
                "{} transport {} is {:?}",
                self.direction,
                self.id,
                self.state()
            )));
        }
        self.connected
            .get_or_try_init(|| self.run_connect_hook())
            .await
            .map(|_| ())
    }

    async fn run_connect_hook(&self) -> Result<()> {
        self.connect_hook.fire()?;
        self.set_state(TransportState::Connecting);

        let request = SignalRequest::ConnectTransport {
            transport_id: self.id.clone(),
            dtls_parameters: self.engine.dtls_parameters(),
        };
        match self
            .signaling
            .call_within::<serde::de::IgnoredAny>(request, self.connect_timeout)
            .await
        {
            Ok(_) => {
                if self.state() == TransportState::Connecting {
                    self.set_state(TransportState::Connected);
                }
                Ok(())
            }
            Err(e) => {
                self.set_state(TransportState::Failed);
                if e.is_timeout() {
                    return Err(e);
                }
                Err(SessionError::TransportFailed(format!(
                    "{} transport {} connect rejected: {}",
                    self.direction, self.id, e
                )))
            }
        }
    }

    /// Start sending `track` and register it with the server (the produce hook).
    pub async fn produce(
        &self,
        track: &MediaTrack,
        source: MediaSource,
        codec: &RtpCodecCapability,
        encodings: &[RtpEncoding],
    ) -> Result<Producer> {
        if self.direction != TransportDirection::Send {
            return Err(SessionError::InvalidState(
                "producers live on the send transport".to_string(),
            ));
        }
        self.ensure_connected().await?;

        let rtp_parameters = self.engine.send(track, codec, encodings).await?;
        let request = SignalRequest::Produce {
            transport_id: self.id.clone(),
            kind: track.kind(),
            rtp_parameters: rtp_parameters.clone(),
            source,
        };
        let ack: ProduceAck = match self.signaling.call(request).await {
            Ok(ack) => ack,
            Err(e) => {
                let _ = self.engine.stop_sending(track.id()).await;
                return Err(e);
            }
        };

        Ok(Producer::new(
            ack.id,
            source,
            self.id.clone(),
            track.clone(),
            rtp_parameters.encodings,
        ))
    }

    pub async fn consume(&self, options: &ConsumerOptions) -> Result<Consumer> {
        if self.direction != TransportDirection::Receive {
            return Err(SessionError::InvalidState(
                "consumers live on the receive transport".to_string(),
            ));
        }
        self.ensure_connected().await?;

        let track = self.engine.receive(options).await?;
        Ok(Consumer::new(
            options.id.clone(),
            options.producer_id.clone(),
            options.kind,
            self.id.clone(),
            track,
        ))
    }

    pub async fn close(&self) {
        if self.set_state(TransportState::Closed) != TransportState::Closed {
            self.engine.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_hook_rejects_second_fire() {
        let hook = OnceHook::new("connect");
        assert!(!hook.has_fired());
        assert!(hook.fire().is_ok());
        assert_eq!(hook.fire(), Err(SessionError::HookAlreadyFired("connect")));
        assert!(hook.has_fired());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransportState::Failed.is_terminal());
        assert!(TransportState::Closed.is_terminal());
        assert!(!TransportState::Connecting.is_terminal());
    }
}
