use serde::{Deserialize, Serialize};

/// Errors produced by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Capture permission denied or no matching device.
    #[error("Device error: {0}")]
    Device(String),
    #[error("Signaling request '{request}' timed out after {timeout_ms}ms")]
    SignalingTimeout { request: String, timeout_ms: u64 },
    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),
    #[error("Negotiation error: {0}")]
    Negotiation(String),
    /// The channel rejected a request, is closed, or acked with a malformed payload.
    #[error("Signaling error: {0}")]
    Signaling(String),
    #[error("Transport failed: {0}")]
    TransportFailed(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Hook '{0}' already fired")]
    HookAlreadyFired(&'static str),
    #[error("Constraint rejected: {0}")]
    ConstraintRejected(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionErrorKind {
    Device,
    SignalingTimeout,
    IncompatibleCapabilities,
    Negotiation,
    Signaling,
    TransportFailed,
    InvalidState,
    Constraint,
    Config,
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorScope {
    /// One remote peer; the rest of the session continues.
    Peer,
    /// One local operation (a producer, a constraint change); the session continues.
    Operation,
    /// The whole session is torn down.
    Session,
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::Device(_) => SessionErrorKind::Device,
            SessionError::SignalingTimeout { .. } => SessionErrorKind::SignalingTimeout,
            SessionError::IncompatibleCapabilities(_) => SessionErrorKind::IncompatibleCapabilities,
            SessionError::Negotiation(_) => SessionErrorKind::Negotiation,
            SessionError::Signaling(_) => SessionErrorKind::Signaling,
            SessionError::TransportFailed(_) => SessionErrorKind::TransportFailed,
            SessionError::InvalidState(_) | SessionError::HookAlreadyFired(_) => {
                SessionErrorKind::InvalidState
            }
            SessionError::ConstraintRejected(_) => SessionErrorKind::Constraint,
            SessionError::Config(_) => SessionErrorKind::Config,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::SignalingTimeout { .. })
    }

    pub fn timeout(request: impl Into<String>, timeout_ms: u64) -> Self {
        SessionError::SignalingTimeout {
            request: request.into(),
            timeout_ms,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
