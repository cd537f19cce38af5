//! WebSocket client owning the outbound connection to the backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use tunnel_common::{
    AgentErrorKind, AgentFrame, InferenceCall, InferenceReply, Registration, ServerFrame,
};

use crate::config::Config;
use crate::runtime::ModelRuntime;

use super::ReconnectBackoff;

/// Outbound frame buffer shared by heartbeats, the model poller and request
/// workers.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Active,
}

/// Tunnel client.
///
/// Runs an explicit state machine - Disconnected -> Connecting ->
/// Registering -> Active - with one authoritative current state; any error
/// from any state drops back to Disconnected, followed by a retry with
/// capped exponential backoff.
pub struct TunnelClient {
    config: Config,
    identity: String,
    endpoint_descriptor: String,
    runtime: Arc<dyn ModelRuntime>,
    state_tx: watch::Sender<ConnectionState>,
}

impl TunnelClient {
    pub fn new(config: Config, identity: String, runtime: Arc<dyn ModelRuntime>) -> Self {
        let endpoint_descriptor = config.endpoint_descriptor();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            identity,
            endpoint_descriptor,
            runtime,
            state_tx,
        }
    }

    /// Observe connection state transitions.
    #[allow(dead_code)]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Tunnel state {:?} -> {:?}", previous, state);
        }
    }

    /// Start the client with automatic reconnection.
    ///
    /// This runs indefinitely, reconnecting on connection loss.
    pub async fn run(&self) {
        let mut backoff = ReconnectBackoff::new(
            Duration::from_secs(self.config.tunnel.reconnect_initial_secs),
            Duration::from_secs(self.config.tunnel.reconnect_max_secs),
        );

        loop {
            tracing::info!("Connecting to tunnel at {}", self.config.tunnel.ws_url);

            match self.connect_and_run(&mut backoff).await {
                Ok(()) => {
                    tracing::info!("Tunnel connection closed normally");
                }
                Err(e) => {
                    tracing::error!("Tunnel connection error: {}", e);
                }
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting in {:.1}s", delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }
    }

    /// Connect, register and run the frame loop until the connection drops.
    async fn connect_and_run(
        &self,
        backoff: &mut ReconnectBackoff,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.set_state(ConnectionState::Connecting);
        let (ws_stream, _) = connect_async(&self.config.tunnel.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        self.set_state(ConnectionState::Registering);
        let models = match self.runtime.list_models().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(
                    "Local runtime unavailable at registration ({}); advertising no models",
                    e
                );
                vec![]
            }
        };
        let registration = Registration::new(
            self.identity.clone(),
            self.endpoint_descriptor.clone(),
            models.clone(),
        );
        let json = serde_json::to_string(&AgentFrame::Register(registration))?;
        write.send(Message::Text(json)).await?;
        tracing::info!("Sent registration with {} model(s)", models.len());

        // Wait for the registration acknowledgment
        let ack_timeout = Duration::from_secs(self.config.tunnel.ack_timeout_secs);
        match timeout(ack_timeout, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ServerFrame>(&text)? {
                    ServerFrame::RegisterAck { identity } => {
                        tracing::info!("Registration acknowledged for {}", identity);
                    }
                    ServerFrame::Error { code, message } => {
                        return Err(format!("registration failed: {} - {}", code, message).into());
                    }
                    _ => {
                        return Err("unexpected frame before registration ack".into());
                    }
                }
            }
            Ok(Some(Ok(_))) => {
                return Err("expected text frame for registration ack".into());
            }
            Ok(Some(Err(e))) => {
                return Err(format!("websocket error during registration: {}", e).into());
            }
            Ok(None) => {
                return Err("connection closed during registration".into());
            }
            Err(_) => {
                return Err("registration acknowledgment timeout".into());
            }
        }

        self.set_state(ConnectionState::Active);
        backoff.reset();

        // Channel for outbound frames
        let (tx, mut rx) = mpsc::channel::<AgentFrame>(FRAME_CHANNEL_CAPACITY);

        // Spawn heartbeat task
        let heartbeat_tx = tx.clone();
        let heartbeat_interval = Duration::from_secs(self.config.tunnel.heartbeat_interval_secs);
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = interval(heartbeat_interval);
            // The registration itself just proved liveness.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(AgentFrame::Heartbeat).await.is_err() {
                    break;
                }
            }
        });

        // Spawn local model poll task; a changed list triggers a full
        // re-registration, never a delta.
        let poll_tx = tx.clone();
        let poll_runtime = self.runtime.clone();
        let poll_identity = self.identity.clone();
        let poll_descriptor = self.endpoint_descriptor.clone();
        let poll_interval =
            Duration::from_secs(self.config.runtime.models_poll_interval_secs);
        let mut last_models = models;
        let poll_handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match poll_runtime.list_models().await {
                    Ok(current) => {
                        if current != last_models {
                            tracing::info!(
                                "Local model list changed ({} model(s)); re-registering",
                                current.len()
                            );
                            let registration = Registration::new(
                                poll_identity.clone(),
                                poll_descriptor.clone(),
                                current.clone(),
                            );
                            if poll_tx
                                .send(AgentFrame::Register(registration))
                                .await
                                .is_err()
                            {
                                break;
                            }
                            last_models = current;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Local model poll failed: {}", e);
                    }
                }
            }
        });

        // Correlation ids of requests still being worked on; a cancellation
        // removes the id so the worker drops its result.
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        // Main frame loop
        let result = self
            .message_loop(&mut write, &mut read, &mut rx, tx.clone(), in_flight)
            .await;

        // Clean up
        heartbeat_handle.abort();
        poll_handle.abort();

        result
    }

    async fn message_loop<S, R>(
        &self,
        write: &mut S,
        read: &mut R,
        rx: &mut mpsc::Receiver<AgentFrame>,
        tx: mpsc::Sender<AgentFrame>,
        in_flight: Arc<Mutex<HashSet<Uuid>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                // Handle outbound frames
                Some(frame) = rx.recv() => {
                    let json = serde_json::to_string(&frame)?;
                    write.send(Message::Text(json)).await?;
                }

                // Handle inbound frames
                Some(result) = read.next() => {
                    match result {
                        Ok(Message::Text(text)) => {
                            if let Err(e) = self.handle_server_frame(&text, &tx, &in_flight).await {
                                tracing::error!("Error handling server frame: {}", e);
                            }
                        }
                        Ok(Message::Ping(data)) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Ok(Message::Close(_)) => {
                            tracing::info!("Server sent close frame");
                            return Ok(());
                        }
                        Ok(_) => {} // Ignore binary, pong, etc.
                        Err(e) => {
                            return Err(format!("websocket error: {}", e).into());
                        }
                    }
                }

                else => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_server_frame(
        &self,
        text: &str,
        tx: &mpsc::Sender<AgentFrame>,
        in_flight: &Arc<Mutex<HashSet<Uuid>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let frame: ServerFrame = serde_json::from_str(text)?;

        match frame {
            ServerFrame::InferenceRequest {
                correlation_id,
                payload,
            } => {
                in_flight.lock().await.insert(correlation_id);
                // One worker per request: a slow local call must not stall
                // heartbeats or other in-flight requests.
                tokio::spawn(handle_inference_request(
                    self.runtime.clone(),
                    correlation_id,
                    payload,
                    tx.clone(),
                    in_flight.clone(),
                ));
            }

            ServerFrame::CancelRequest { correlation_id } => {
                if in_flight.lock().await.remove(&correlation_id) {
                    tracing::debug!(
                        %correlation_id,
                        "Caller cancelled; the local result will be discarded"
                    );
                }
            }

            ServerFrame::RegisterAck { identity } => {
                tracing::warn!(
                    "Received unexpected RegisterAck for {} while already active",
                    identity
                );
            }

            ServerFrame::Error { code, message } => {
                tracing::error!("Server error: {} - {}", code, message);
            }
        }

        Ok(())
    }
}

/// Execute one inference call and emit exactly one response frame, wrapping
/// every local failure into an error reply. A request cancelled while the
/// local call ran produces no frame at all.
async fn handle_inference_request(
    runtime: Arc<dyn ModelRuntime>,
    correlation_id: Uuid,
    call: InferenceCall,
    tx: mpsc::Sender<AgentFrame>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
) {
    let budget = Duration::from_millis(call.timeout_ms);
    let payload = match timeout(budget, runtime.invoke(&call.model_name, &call.input)).await {
        Ok(Ok(result)) => InferenceReply::success(result),
        Ok(Err(e)) => InferenceReply::failure(e.kind(), e.to_string()),
        Err(_) => InferenceReply::failure(
            AgentErrorKind::RuntimeTimeout,
            format!("local call exceeded {}ms", call.timeout_ms),
        ),
    };

    if !in_flight.lock().await.remove(&correlation_id) {
        tracing::debug!(%correlation_id, "Dropping result for cancelled request");
        return;
    }

    if tx
        .send(AgentFrame::InferenceResponse {
            correlation_id,
            payload,
        })
        .await
        .is_err()
    {
        tracing::debug!(
            %correlation_id,
            "Connection closed before the response could be sent"
        );
    }
}
