//! In-process fakes for exercising sessions without a network or devices
//!
//! Every fake records what it was asked to do so tests can assert on the
//! exact signaling traffic and engine calls.

pub mod devices;
pub mod engines;
pub mod signaling;

pub use devices::{FakeMediaDevices, FakeTrackBackend};
pub use engines::{
    audio_only_capabilities, default_capabilities, FakeForwardingEngine, FakeNegotiator,
    FakeNegotiatorFactory, FakeTransportEngine,
};
pub use signaling::{MockReply, MockSignaling};
