//! Local model runtime abstraction.
//!
//! The runtime is a black box running next to the agent (an Ollama-style
//! HTTP server); the tunnel only needs to list its models and execute one
//! call at a time against it.

mod http;

pub use http::HttpRuntime;

use async_trait::async_trait;

use tunnel_common::{AgentErrorKind, ModelAdvertisement};

/// Failures calling the local runtime. These are wrapped into response
/// frames and relayed to the caller, never retried by the tunnel.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("local runtime unreachable: {0}")]
    Unreachable(String),

    #[error("model '{0}' not found locally")]
    ModelNotFound(String),

    #[error("local call exceeded its deadline")]
    Timeout,

    #[error("local runtime error: {0}")]
    Failed(String),
}

impl RuntimeError {
    /// Wire-level category reported back through the tunnel.
    pub fn kind(&self) -> AgentErrorKind {
        match self {
            RuntimeError::Unreachable(_) => AgentErrorKind::RuntimeUnreachable,
            RuntimeError::ModelNotFound(_) => AgentErrorKind::ModelNotFound,
            RuntimeError::Timeout => AgentErrorKind::RuntimeTimeout,
            RuntimeError::Failed(_) => AgentErrorKind::RuntimeError,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Interface to the local model runtime.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// List the models currently available locally, as advertisements.
    async fn list_models(&self) -> Result<Vec<ModelAdvertisement>>;

    /// Run one inference call against a local model.
    async fn invoke(
        &self,
        model_name: &str,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            RuntimeError::Unreachable("refused".to_string()).kind(),
            AgentErrorKind::RuntimeUnreachable
        );
        assert_eq!(
            RuntimeError::ModelNotFound("m".to_string()).kind(),
            AgentErrorKind::ModelNotFound
        );
        assert_eq!(RuntimeError::Timeout.kind(), AgentErrorKind::RuntimeTimeout);
        assert_eq!(
            RuntimeError::Failed("boom".to_string()).kind(),
            AgentErrorKind::RuntimeError
        );
    }
}
