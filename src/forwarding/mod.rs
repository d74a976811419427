//! Forwarding-server (SFU) session mode
//!
//! A single send and a single receive [`Transport`] carry every
//! [`Producer`] and [`Consumer`] of the session.

pub mod capabilities;
pub mod consumer;
pub mod engine;
pub mod manager;
pub mod producer;
pub mod transport;

pub use capabilities::{
    CapabilityNegotiator, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
pub use consumer::{Consumer, ConsumerInfo};
pub use engine::{
    ConsumerOptions, DtlsFingerprint, DtlsParameters, ForwardingEngine, TransportEngine,
    TransportOptions,
};
pub use manager::{ForwardingSessionManager, ForwardingSnapshot, ForwardingState, TransportInfo};
pub use producer::{Producer, ProducerInfo};
pub use transport::{OnceHook, Transport, TransportState};
