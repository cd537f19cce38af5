//! ModelPort Common Types
//!
//! Shared wire-protocol types used by both the tunnel agent and the backend
//! tunnel server.

pub mod protocol;

pub use protocol::{
    guest_identity, AgentErrorKind, AgentFrame, InferenceCall, InferenceReply,
    ModelAdvertisement, Registration, ServerFrame, PROTOCOL_VERSION,
};
