//! WebSocket frame types for agent-server tunnel communication.
//!
//! This module defines the message format for the persistent tunnel between
//! a local agent and the backend tunnel server.
//!
//! # Protocol Overview
//!
//! The protocol uses JSON-encoded frames over WebSocket. Each frame has a
//! `type` field that determines its structure, and frames that belong to an
//! in-flight inference carry a top-level `correlation_id` so the receiving
//! side can route them without touching the payload.
//!
//! ## Connection Flow
//!
//! 1. Agent connects to the server WebSocket endpoint
//! 2. Agent sends `Register` with its identity, endpoint descriptor and the
//!    full list of locally available models
//! 3. Server responds with `RegisterAck` on success or `Error` on failure
//! 4. Agent sends periodic `Heartbeat` frames
//! 5. Server sends `InferenceRequest` frames; the agent answers each one with
//!    exactly one `InferenceResponse` carrying the same correlation id
//! 6. Whenever the local model list changes, the agent re-sends a full
//!    `Register`; registration is always a complete replace, never a delta
//!
//! Responses may arrive in any order; only correlation ids pair them with
//! their requests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames sent from agent to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Initial registration, and full model-list replacement thereafter.
    Register(Registration),
    /// Periodic liveness signal; carries no payload.
    Heartbeat,
    /// Answer to an `InferenceRequest` with the same correlation id.
    InferenceResponse {
        correlation_id: Uuid,
        payload: InferenceReply,
    },
}

/// Frames sent from server to agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledgment of successful registration.
    RegisterAck { identity: String },
    /// Dispatch of one inference call to the agent's local runtime.
    InferenceRequest {
        correlation_id: Uuid,
        payload: InferenceCall,
    },
    /// Best-effort notice that the caller gave up on a request. The agent
    /// drops its tracking entry but is not required to interrupt the local
    /// call; a late response is discarded server-side anyway.
    CancelRequest { correlation_id: Uuid },
    /// Fatal handshake or protocol error, sent before the server closes
    /// the connection.
    Error { code: String, message: String },
}

impl AgentFrame {
    /// Correlation id of the in-flight request this frame belongs to, if any.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            AgentFrame::InferenceResponse { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }
}

impl ServerFrame {
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            ServerFrame::InferenceRequest { correlation_id, .. }
            | ServerFrame::CancelRequest { correlation_id } => Some(*correlation_id),
            _ => None,
        }
    }
}

/// Registration data sent when connecting, and re-sent in full whenever the
/// agent's local model list changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Logical owner of the connection: a user id, or a generated
    /// `guest:<uuid>` identity.
    pub identity: String,
    /// Opaque locator for the agent's local model runtime.
    pub endpoint_descriptor: String,
    /// Protocol version for compatibility checking.
    pub protocol_version: u32,
    /// Complete list of locally available models. Replaces any previously
    /// advertised list wholesale.
    pub models: Vec<ModelAdvertisement>,
}

impl Registration {
    pub fn new(
        identity: String,
        endpoint_descriptor: String,
        models: Vec<ModelAdvertisement>,
    ) -> Self {
        Self {
            identity,
            endpoint_descriptor,
            protocol_version: PROTOCOL_VERSION,
            models,
        }
    }
}

/// A single model advertised by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAdvertisement {
    /// Model identifier (e.g., "llama3.2:3b").
    pub model_name: String,
    /// Model size in bytes, if known.
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Capability tags (e.g., "chat", "embeddings").
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ModelAdvertisement {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            size_bytes: None,
            capabilities: vec![],
        }
    }
}

/// Payload of an `InferenceRequest` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceCall {
    /// Target model; must be advertised by the receiving agent.
    pub model_name: String,
    /// Opaque task payload, forwarded to the local runtime as-is.
    pub input: serde_json::Value,
    /// Deadline budget for the local call, in milliseconds.
    pub timeout_ms: u64,
}

/// Payload of an `InferenceResponse` frame.
///
/// Exactly one of `result` (when `ok`) or `error_kind`/`error_message`
/// (when not) is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceReply {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_kind: Option<AgentErrorKind>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl InferenceReply {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failure(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }
}

/// Agent-local failure categories, reported back through the tunnel instead
/// of being retried or swallowed on the agent side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The local model runtime did not accept the connection.
    RuntimeUnreachable,
    /// The requested model is not available locally.
    ModelNotFound,
    /// The local call exceeded the request's deadline budget.
    RuntimeTimeout,
    /// The local runtime returned an error.
    RuntimeError,
}

impl AgentErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentErrorKind::RuntimeUnreachable => "runtime_unreachable",
            AgentErrorKind::ModelNotFound => "model_not_found",
            AgentErrorKind::RuntimeTimeout => "runtime_timeout",
            AgentErrorKind::RuntimeError => "runtime_error",
        }
    }
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a guest identity for agents running without a configured user id.
pub fn guest_identity() -> String {
    format!("guest:{}", Uuid::new_v4())
}

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;
