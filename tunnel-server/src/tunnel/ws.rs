//! WebSocket handler for agent connections.
//!
//! Each accepted socket walks a strict lifecycle: it must register before
//! anything else, serves frames while registered, and is closed exactly once
//! - by the peer, by a protocol violation, by supersession or by liveness
//! eviction.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use uuid::Uuid;

use tunnel_common::{AgentFrame, Registration, ServerFrame, PROTOCOL_VERSION};

use super::TunnelState;

/// Outbound frame buffer per connection.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<TunnelState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::info!("Agent connection attempt from {}", addr);
    ws.on_upgrade(move |socket| handle_agent(socket, state, addr))
}

/// Handle an individual agent connection.
async fn handle_agent(socket: WebSocket, state: Arc<TunnelState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The first application frame must be a registration. Heartbeats in the
    // window are tolerated; anything else closes the connection.
    let registration = match timeout(
        state.config.handshake_timeout(),
        await_registration(&mut ws_rx),
    )
    .await
    {
        Ok(Ok(Some(registration))) => registration,
        Ok(Ok(None)) => {
            tracing::info!("Connection from {} closed before registering", addr);
            return;
        }
        Ok(Err(violation)) => {
            tracing::warn!("Protocol violation from {}: {}", addr, violation);
            let _ = send_error(&mut ws_tx, "protocol_error", &violation).await;
            return;
        }
        Err(_) => {
            tracing::warn!("Registration timeout from {}", addr);
            let _ = send_error(&mut ws_tx, "timeout", "registration timeout").await;
            return;
        }
    };

    if let Err(msg) = validate_registration(&registration) {
        tracing::warn!(
            "Registration rejected for {} from {}: {}",
            registration.identity,
            addr,
            msg
        );
        let _ = send_error(&mut ws_tx, "registration_rejected", &msg).await;
        return;
    }

    let identity = registration.identity.clone();
    let connection_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(FRAME_CHANNEL_CAPACITY);
    let closed = Arc::new(Notify::new());

    let superseded = state
        .registry
        .register(
            identity.clone(),
            connection_id,
            registration.endpoint_descriptor.clone(),
            registration.models,
            tx.clone(),
            closed.clone(),
        )
        .await;
    if let Some(old) = superseded {
        state.drop_superseded(&old);
    }

    tracing::info!("Agent {} registered from {}", identity, addr);

    let ack = ServerFrame::RegisterAck {
        identity: identity.clone(),
    };
    if let Err(e) = send_frame(&mut ws_tx, &ack).await {
        tracing::error!("Failed to send RegisterAck to {}: {}", identity, e);
        state.close_connection(&identity, connection_id).await;
        return;
    }

    // Main frame loop
    loop {
        tokio::select! {
            // Outbound frames (router -> agent)
            Some(frame) = rx.recv() => {
                if let Err(e) = send_frame(&mut ws_tx, &frame).await {
                    tracing::error!("Failed to send frame to {}: {}", identity, e);
                    break;
                }
            }

            // Woken when this connection is superseded or evicted.
            _ = closed.notified() => {
                tracing::debug!("Connection for {} shutting down", identity);
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            // Inbound frames (agent -> server)
            Some(result) = ws_rx.next() => {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<AgentFrame>(&text) {
                            Ok(frame) => {
                                if handle_agent_frame(frame, &identity, connection_id, &state)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "Closing connection for {}: unparseable frame: {}",
                                    identity,
                                    e
                                );
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Agent {} sent close frame", identity);
                        break;
                    }
                    Ok(_) => {} // Ignore binary, pong, etc.
                    Err(e) => {
                        tracing::error!("WebSocket error from {}: {}", identity, e);
                        break;
                    }
                }
            }

            else => break,
        }
    }

    state.close_connection(&identity, connection_id).await;
    tracing::info!("Agent {} disconnected", identity);
}

/// Wait for the registration frame that must open every connection.
///
/// `Ok(None)` means the peer went away first; `Err` is a protocol violation.
async fn await_registration(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<Option<Registration>, String> {
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<AgentFrame>(&text) {
                Ok(AgentFrame::Register(registration)) => return Ok(Some(registration)),
                Ok(AgentFrame::Heartbeat) => continue,
                Ok(_) => return Err("expected register as first frame".to_string()),
                Err(e) => return Err(format!("unparseable frame: {}", e)),
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => return Err("expected text frame".to_string()),
            Err(e) => return Err(format!("websocket error: {}", e)),
        }
    }
    Ok(None)
}

/// Validate a registration frame.
fn validate_registration(registration: &Registration) -> Result<(), String> {
    if registration.protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION, registration.protocol_version
        ));
    }

    if registration.identity.is_empty() {
        return Err("identity cannot be empty".to_string());
    }

    Ok(())
}

/// Handle a frame from a registered agent. An `Err` closes the connection.
async fn handle_agent_frame(
    frame: AgentFrame,
    identity: &str,
    connection_id: Uuid,
    state: &TunnelState,
) -> Result<(), ()> {
    match frame {
        AgentFrame::Heartbeat => {
            if !state.registry.heartbeat(identity, connection_id).await {
                tracing::debug!(
                    "Heartbeat from {} after eviction; entry refreshes on re-register",
                    identity
                );
            }
            Ok(())
        }
        AgentFrame::Register(registration) => {
            if registration.identity != identity {
                tracing::warn!(
                    "Agent {} attempted to re-register as {}",
                    identity,
                    registration.identity
                );
                return Err(());
            }
            let count = registration.models.len();
            let entry = state.registry.get(identity).await;
            let (tx, closed) = match entry {
                Some(e) if e.connection_id == connection_id => (e.tx, e.closed),
                // Evicted between frames; close and let the agent reconnect
                // with a fresh registration.
                _ => return Err(()),
            };
            state
                .registry
                .register(
                    identity.to_string(),
                    connection_id,
                    registration.endpoint_descriptor,
                    registration.models,
                    tx,
                    closed,
                )
                .await;
            tracing::info!("Agent {} re-registered {} model(s)", identity, count);
            Ok(())
        }
        AgentFrame::InferenceResponse {
            correlation_id,
            payload,
        } => {
            if !state.pending.resolve(correlation_id, payload) {
                tracing::debug!(
                    %correlation_id,
                    "Dropping response with unknown or already-resolved correlation id"
                );
            }
            Ok(())
        }
    }
}

/// Send a ServerFrame over the WebSocket.
async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

/// Send an error frame over the WebSocket.
async fn send_error(
    sink: &mut SplitSink<WebSocket, Message>,
    code: &str,
    message: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let frame = ServerFrame::Error {
        code: code.to_string(),
        message: message.to_string(),
    };
    send_frame(sink, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use serde_json::json;
    use tunnel_common::{InferenceReply, ModelAdvertisement};

    fn registration(identity: &str) -> Registration {
        Registration::new(
            identity.to_string(),
            "http://localhost:11434".to_string(),
            vec![ModelAdvertisement::new("llama3.2:3b")],
        )
    }

    #[test]
    fn test_validate_registration_success() {
        assert!(validate_registration(&registration("agent-1")).is_ok());
    }

    #[test]
    fn test_validate_registration_empty_identity() {
        let result = validate_registration(&registration(""));
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("identity cannot be empty"));
    }

    #[test]
    fn test_validate_registration_version_mismatch() {
        let mut reg = registration("agent-1");
        reg.protocol_version = PROTOCOL_VERSION + 1;
        let result = validate_registration(&reg);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("protocol version mismatch"));
    }

    async fn registered_state(identity: &str) -> (Arc<TunnelState>, Uuid) {
        let state = Arc::new(TunnelState::new(TunnelConfig::default()));
        let connection_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        state
            .registry
            .register(
                identity.to_string(),
                connection_id,
                "desc".to_string(),
                vec![ModelAdvertisement::new("llama3.2:3b")],
                tx,
                Arc::new(Notify::new()),
            )
            .await;
        (state, connection_id)
    }

    #[tokio::test]
    async fn test_handle_heartbeat_frame() {
        let (state, connection_id) = registered_state("agent-1").await;
        let result =
            handle_agent_frame(AgentFrame::Heartbeat, "agent-1", connection_id, &state).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_handle_heartbeat_after_eviction_is_noop() {
        let (state, connection_id) = registered_state("agent-1").await;
        state.close_connection("agent-1", connection_id).await;
        // The connection is gone but a straggler heartbeat does not error.
        let result =
            handle_agent_frame(AgentFrame::Heartbeat, "agent-1", connection_id, &state).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_handle_reregister_replaces_model_list() {
        let (state, connection_id) = registered_state("agent-1").await;

        let mut reg = registration("agent-1");
        reg.models = vec![ModelAdvertisement::new("qwen2.5:7b")];
        let result = handle_agent_frame(
            AgentFrame::Register(reg),
            "agent-1",
            connection_id,
            &state,
        )
        .await;
        assert!(result.is_ok());

        assert!(state.registry.resolve("qwen2.5:7b").await.is_some());
        assert!(state.registry.resolve("llama3.2:3b").await.is_none());
    }

    #[tokio::test]
    async fn test_handle_reregister_with_foreign_identity_closes() {
        let (state, connection_id) = registered_state("agent-1").await;
        let result = handle_agent_frame(
            AgentFrame::Register(registration("agent-2")),
            "agent-1",
            connection_id,
            &state,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handle_response_resolves_pending() {
        let (state, connection_id) = registered_state("agent-1").await;
        let (correlation_id, rx) = state.pending.register(connection_id);

        let frame = AgentFrame::InferenceResponse {
            correlation_id,
            payload: InferenceReply::success(json!("R")),
        };
        let result = handle_agent_frame(frame, "agent-1", connection_id, &state).await;
        assert!(result.is_ok());

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.result, Some(json!("R")));
    }

    #[tokio::test]
    async fn test_handle_unknown_correlation_response_is_dropped() {
        let (state, connection_id) = registered_state("agent-1").await;
        let frame = AgentFrame::InferenceResponse {
            correlation_id: Uuid::new_v4(),
            payload: InferenceReply::success(json!("stray")),
        };
        // Stray responses never close the connection.
        let result = handle_agent_frame(frame, "agent-1", connection_id, &state).await;
        assert!(result.is_ok());
    }
}
