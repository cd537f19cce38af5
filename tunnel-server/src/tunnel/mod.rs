//! Tunnel module for managing agent connections.
//!
//! This module provides:
//! - WebSocket endpoint for persistent agent connections
//! - Model registry tracking which models are reachable through which agent
//! - Pending-request table pairing response frames with waiting callers
//! - Request router dispatching inference calls over the tunnel

mod pending;
mod registry;
pub mod router;
mod ws;

pub use pending::{DispatchOutcome, PendingRequests};
pub use registry::{ModelRegistry, ReachableModel, RegistryEntry, ResolvedConnection};
pub use router::{DispatchError, InferenceRouter};
pub use ws::ws_handler;

use std::sync::Arc;

use tokio::time::interval;
use uuid::Uuid;

use crate::config::TunnelConfig;

/// Shared tunnel state: the registry and the pending-request table, plus the
/// single teardown path that keeps them coupled. A connection that goes away
/// - socket close, supersession or liveness eviction - always fails its
/// in-flight requests through here.
pub struct TunnelState {
    pub registry: ModelRegistry,
    pub pending: PendingRequests,
    pub config: TunnelConfig,
}

impl TunnelState {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            registry: ModelRegistry::new(),
            pending: PendingRequests::new(),
            config,
        }
    }

    /// Close an agent connection: evict it from the registry and fail every
    /// pending request bound to it. Safe to call from any of the teardown
    /// paths; later callers find nothing left to do.
    pub async fn close_connection(&self, identity: &str, connection_id: Uuid) {
        if let Some(entry) = self.registry.evict(identity, connection_id).await {
            entry.closed.notify_one();
        }
        let failed = self.pending.fail_connection(connection_id);
        if failed > 0 {
            tracing::warn!(
                "Failed {} pending request(s) after agent {} disconnected",
                failed,
                identity
            );
        }
    }

    /// Tear down a connection replaced by a newer one from the same
    /// identity. The registry entry is already gone; wake the old socket
    /// task and fail its in-flight requests.
    pub fn drop_superseded(&self, entry: &RegistryEntry) {
        entry.closed.notify_one();
        let failed = self.pending.fail_connection(entry.connection_id);
        tracing::info!(
            "Connection for {} superseded by a newer registration ({} pending failed)",
            entry.identity,
            failed
        );
    }

    /// Background sweep evicting agents whose heartbeats went silent. Runs
    /// at half the liveness timeout.
    pub async fn run_liveness_sweep(self: Arc<Self>) {
        let mut ticker = interval(self.config.sweep_interval());
        loop {
            ticker.tick().await;
            let removed = self
                .registry
                .remove_stale(self.config.liveness_timeout_secs as i64)
                .await;
            for entry in removed {
                entry.closed.notify_one();
                let failed = self.pending.fail_connection(entry.connection_id);
                if failed > 0 {
                    tracing::warn!(
                        "Failed {} pending request(s) for evicted agent {}",
                        failed,
                        entry.identity
                    );
                }
            }
        }
    }
}
