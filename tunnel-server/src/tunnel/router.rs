//! Inference router: the dispatch entry point used by the analysis pipeline.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use tunnel_common::{AgentErrorKind, InferenceCall, InferenceReply, ServerFrame};

use super::{PendingRequests, ReachableModel, TunnelState};

/// Caller-visible dispatch failures. None of these is fatal to the server;
/// protocol violations close the offending connection and never surface here.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No live connection advertises the model. Not retried; the caller is
    /// expected to pick another model or surface "not connected".
    #[error("no connected agent advertises model '{0}'")]
    ModelUnavailable(String),
    /// The deadline elapsed with no response. The caller may retry with a
    /// fresh dispatch.
    #[error("inference request timed out")]
    Timeout,
    /// The owning connection died mid-flight. The caller may retry once a
    /// new registration appears.
    #[error("tunnel connection closed before a response arrived")]
    TunnelDisconnected,
    /// The agent's local runtime failed; relayed verbatim, never retried by
    /// the tunnel itself.
    #[error("local runtime failed ({kind}): {message}")]
    LocalRuntime {
        kind: AgentErrorKind,
        message: String,
    },
}

/// Router dispatching inference calls to whichever agent advertises the
/// requested model. The only entry point the rest of the product calls.
pub struct InferenceRouter {
    tunnel: Arc<TunnelState>,
}

impl InferenceRouter {
    pub fn new(tunnel: Arc<TunnelState>) -> Self {
        Self { tunnel }
    }

    /// Dispatch one inference call and suspend until it resolves.
    ///
    /// Resolution is exactly-once: a matching response, the deadline, or the
    /// owning connection's loss, whichever happens first. Dropping the
    /// returned future removes the pending entry and sends a best-effort
    /// cancellation notice to the agent.
    pub async fn dispatch_inference(
        &self,
        model_name: &str,
        input: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, DispatchError> {
        let conn = self
            .tunnel
            .registry
            .resolve(model_name)
            .await
            .ok_or_else(|| DispatchError::ModelUnavailable(model_name.to_string()))?;

        let (correlation_id, rx) = self.tunnel.pending.register(conn.connection_id);
        let frame = ServerFrame::InferenceRequest {
            correlation_id,
            payload: InferenceCall {
                model_name: model_name.to_string(),
                input,
                timeout_ms,
            },
        };

        if conn.tx.send(frame).await.is_err() {
            self.tunnel.pending.cancel(correlation_id);
            return Err(DispatchError::TunnelDisconnected);
        }
        tracing::debug!(
            %correlation_id,
            model = model_name,
            identity = %conn.identity,
            "Dispatched inference request"
        );

        let mut guard = CancelGuard {
            pending: &self.tunnel.pending,
            tx: conn.tx,
            correlation_id,
            armed: true,
        };
        let outcome = timeout(Duration::from_millis(timeout_ms), rx).await;
        guard.armed = false;

        match outcome {
            // Deadline elapsed; a late response now falls into the
            // unknown-correlation drop path.
            Err(_) => {
                self.tunnel.pending.cancel(correlation_id);
                Err(DispatchError::Timeout)
            }
            // Sink dropped without a verdict; only connection teardown can
            // cause this.
            Ok(Err(_)) => Err(DispatchError::TunnelDisconnected),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(reply))) => {
                if reply.ok {
                    Ok(reply.result.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(DispatchError::LocalRuntime {
                        kind: reply.error_kind.unwrap_or(AgentErrorKind::RuntimeError),
                        message: reply.error_message.unwrap_or_default(),
                    })
                }
            }
        }
    }

    /// Read-only snapshot of every model currently reachable through the
    /// tunnel, for the availability query.
    pub async fn reachable_models(&self) -> Vec<ReachableModel> {
        self.tunnel.registry.reachable_models().await
    }
}

/// Removes the pending entry when a dispatch future is dropped mid-await and
/// tells the agent not to bother finishing.
struct CancelGuard<'a> {
    pending: &'a PendingRequests,
    tx: mpsc::Sender<ServerFrame>,
    correlation_id: Uuid,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.cancel(self.correlation_id) {
            let _ = self.tx.try_send(ServerFrame::CancelRequest {
                correlation_id: self.correlation_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Notify};
    use tunnel_common::ModelAdvertisement;

    async fn tunnel_with_agent(
        model: &str,
    ) -> (Arc<TunnelState>, Uuid, mpsc::Receiver<ServerFrame>) {
        let tunnel = Arc::new(TunnelState::new(TunnelConfig::default()));
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(32);
        tunnel
            .registry
            .register(
                "agent-1".to_string(),
                connection_id,
                "http://localhost:11434".to_string(),
                vec![ModelAdvertisement::new(model)],
                tx,
                Arc::new(Notify::new()),
            )
            .await;
        (tunnel, connection_id, rx)
    }

    fn correlation_of(frame: &ServerFrame) -> Uuid {
        frame.correlation_id().expect("frame without correlation id")
    }

    #[tokio::test]
    async fn test_dispatch_unknown_model_fails_immediately() {
        let (tunnel, _, mut rx) = tunnel_with_agent("alpha-7b").await;
        let router = InferenceRouter::new(tunnel);

        let result = router
            .dispatch_inference("missing-model", json!({}), 5000)
            .await;
        assert!(matches!(result, Err(DispatchError::ModelUnavailable(_))));

        // No frame went out.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_happy_path() {
        let (tunnel, _, mut rx) = tunnel_with_agent("alpha-7b").await;
        let router = InferenceRouter::new(tunnel.clone());

        let responder = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let correlation_id = correlation_of(&frame);
            tunnel
                .pending
                .resolve(correlation_id, InferenceReply::success(json!("R")));
        });

        let result = router
            .dispatch_inference("alpha-7b", json!({"prompt": "hi"}), 5000)
            .await
            .unwrap();
        assert_eq!(result, json!("R"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_local_runtime_error_is_relayed() {
        let (tunnel, _, mut rx) = tunnel_with_agent("alpha-7b").await;
        let router = InferenceRouter::new(tunnel.clone());

        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            tunnel.pending.resolve(
                correlation_of(&frame),
                InferenceReply::failure(AgentErrorKind::ModelNotFound, "gone"),
            );
        });

        let result = router.dispatch_inference("alpha-7b", json!({}), 5000).await;
        match result {
            Err(DispatchError::LocalRuntime { kind, message }) => {
                assert_eq!(kind, AgentErrorKind::ModelNotFound);
                assert_eq!(message, "gone");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_timeout_drops_late_response() {
        let (tunnel, _, mut rx) = tunnel_with_agent("alpha-7b").await;
        let router = InferenceRouter::new(tunnel.clone());

        let result = router.dispatch_inference("alpha-7b", json!({}), 50).await;
        assert!(matches!(result, Err(DispatchError::Timeout)));

        // The request frame did go out, but the late response is a no-op.
        let frame = rx.recv().await.unwrap();
        assert!(!tunnel
            .pending
            .resolve(correlation_of(&frame), InferenceReply::success(json!("late"))));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_before_deadline() {
        let (tunnel, connection_id, mut rx) = tunnel_with_agent("alpha-7b").await;
        let router = InferenceRouter::new(tunnel.clone());

        let closer = tokio::spawn(async move {
            let _ = rx.recv().await;
            tunnel.close_connection("agent-1", connection_id).await;
        });

        let started = std::time::Instant::now();
        let result = router
            .dispatch_inference("alpha-7b", json!({}), 30_000)
            .await;
        assert!(matches!(result, Err(DispatchError::TunnelDisconnected)));
        assert!(started.elapsed() < Duration::from_secs(5));
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_with_reverse_order_responses() {
        let (tunnel, _, mut rx) = tunnel_with_agent("alpha-7b").await;
        let router = Arc::new(InferenceRouter::new(tunnel.clone()));

        let count = 8;
        let responder = tokio::spawn(async move {
            let mut frames = vec![];
            for _ in 0..count {
                frames.push(rx.recv().await.unwrap());
            }
            // Answer in reverse arrival order; correlation ids still pair
            // every response with its caller.
            for frame in frames.iter().rev() {
                if let ServerFrame::InferenceRequest {
                    correlation_id,
                    payload,
                } = frame
                {
                    tunnel.pending.resolve(
                        *correlation_id,
                        InferenceReply::success(payload.input.clone()),
                    );
                }
            }
        });

        let mut handles = vec![];
        for i in 0..count {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router
                    .dispatch_inference("alpha-7b", json!(i), 5000)
                    .await
                    .unwrap()
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), json!(i));
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_removes_pending_and_notifies_agent() {
        let (tunnel, _, mut rx) = tunnel_with_agent("alpha-7b").await;
        let router = Arc::new(InferenceRouter::new(tunnel.clone()));

        let dispatch = {
            let router = router.clone();
            tokio::spawn(async move {
                let _ = router
                    .dispatch_inference("alpha-7b", json!({}), 30_000)
                    .await;
            })
        };

        let request = rx.recv().await.unwrap();
        let correlation_id = correlation_of(&request);

        dispatch.abort();
        let _ = dispatch.await;

        assert!(tunnel.pending.is_empty());
        match rx.recv().await.unwrap() {
            ServerFrame::CancelRequest {
                correlation_id: cancelled,
            } => assert_eq!(cancelled, correlation_id),
            other => panic!("expected cancel notice, got {:?}", other),
        }
    }
}
