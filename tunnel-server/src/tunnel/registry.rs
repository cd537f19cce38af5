//! Model registry tracking connected agents and their advertised models.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use tunnel_common::{ModelAdvertisement, ServerFrame};

/// A connected agent's entry in the registry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Logical owner of the connection (user id or guest identity).
    pub identity: String,
    /// Unique id of the underlying socket. Distinct from the identity so a
    /// superseded connection's cleanup can never touch its successor.
    pub connection_id: Uuid,
    /// Opaque locator for the agent's local runtime.
    pub endpoint_descriptor: String,
    /// Currently advertised models; replaced wholesale on every registration.
    pub models: Vec<ModelAdvertisement>,
    /// When the connection registered for the first time.
    pub established_at: DateTime<Utc>,
    /// Last heartbeat received.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Monotonic registration counter used for resolve tie-breaking.
    registration_seq: u64,
    /// Channel to send frames to this agent.
    pub tx: mpsc::Sender<ServerFrame>,
    /// Wakes the connection task when the entry is evicted or superseded.
    pub closed: Arc<Notify>,
}

impl RegistryEntry {
    /// Check if this agent advertises a specific model.
    pub fn has_model(&self, model_name: &str) -> bool {
        self.models.iter().any(|m| m.model_name == model_name)
    }
}

/// Connection handle returned by `resolve`, enough to dispatch a frame.
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub identity: String,
    pub connection_id: Uuid,
    pub tx: mpsc::Sender<ServerFrame>,
}

/// One row of the availability snapshot consumed by the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct ReachableModel {
    pub model_name: String,
    pub identity: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, RegistryEntry>,
    next_seq: u64,
}

/// Registry of connected agents, keyed by identity.
///
/// At most one live entry exists per identity; a new connection from the
/// same identity supersedes the previous one.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    inner: RwLock<Inner>,
}

impl ModelRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a registration.
    ///
    /// A frame from the connection that already owns the entry replaces the
    /// advertised model list wholesale. A frame from a new connection with
    /// the same identity replaces the entry, and the superseded entry is
    /// returned so the caller can close it and fail its in-flight requests.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        identity: String,
        connection_id: Uuid,
        endpoint_descriptor: String,
        models: Vec<ModelAdvertisement>,
        tx: mpsc::Sender<ServerFrame>,
        closed: Arc<Notify>,
    ) -> Option<RegistryEntry> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;

        if let Some(entry) = inner.entries.get_mut(&identity) {
            if entry.connection_id == connection_id {
                entry.models = models;
                entry.registration_seq = seq;
                entry.last_heartbeat_at = now;
                return None;
            }
        }

        let entry = RegistryEntry {
            identity: identity.clone(),
            connection_id,
            endpoint_descriptor,
            models,
            established_at: now,
            last_heartbeat_at: now,
            registration_seq: seq,
            tx,
            closed,
        };
        inner.entries.insert(identity, entry)
    }

    /// Refresh an agent's heartbeat timestamp.
    ///
    /// Returns false if the identity is unknown or the connection was
    /// superseded; the agent re-registers on its next reconnect.
    pub async fn heartbeat(&self, identity: &str, connection_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(identity) {
            Some(entry) if entry.connection_id == connection_id => {
                entry.last_heartbeat_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Find a live connection advertising `model_name`.
    ///
    /// When several identities advertise the same model, the most recently
    /// registered one wins: a fresh registration carries the freshest
    /// capability information. Round-robin would spread load more evenly
    /// but this resolution is deliberately stateless.
    pub async fn resolve(&self, model_name: &str) -> Option<ResolvedConnection> {
        let inner = self.inner.read().await;
        inner
            .entries
            .values()
            .filter(|e| e.has_model(model_name))
            .max_by_key(|e| e.registration_seq)
            .map(|e| ResolvedConnection {
                identity: e.identity.clone(),
                connection_id: e.connection_id,
                tx: e.tx.clone(),
            })
    }

    /// Remove an entry, but only if it is still owned by `connection_id`.
    pub async fn evict(&self, identity: &str, connection_id: Uuid) -> Option<RegistryEntry> {
        let mut inner = self.inner.write().await;
        let owns = inner
            .entries
            .get(identity)
            .is_some_and(|entry| entry.connection_id == connection_id);
        if owns {
            inner.entries.remove(identity)
        } else {
            None
        }
    }

    /// Remove entries whose heartbeat went silent for longer than
    /// `timeout_secs`. Returns the removed entries; the caller must fail
    /// every pending request bound to them.
    pub async fn remove_stale(&self, timeout_secs: i64) -> Vec<RegistryEntry> {
        let now = Utc::now();
        let mut removed = vec![];
        let mut inner = self.inner.write().await;

        inner.entries.retain(|identity, entry| {
            let age = (now - entry.last_heartbeat_at).num_seconds();
            if age > timeout_secs {
                tracing::warn!(
                    "Evicting stale agent {} (no heartbeat for {}s)",
                    identity,
                    age
                );
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Get an entry by identity.
    pub async fn get(&self, identity: &str) -> Option<RegistryEntry> {
        self.inner.read().await.entries.get(identity).cloned()
    }

    /// Read-only snapshot of every model currently reachable through a
    /// connected agent.
    pub async fn reachable_models(&self) -> Vec<ReachableModel> {
        let inner = self.inner.read().await;
        let mut models: Vec<ReachableModel> = inner
            .entries
            .values()
            .flat_map(|entry| {
                entry.models.iter().map(|m| ReachableModel {
                    model_name: m.model_name.clone(),
                    identity: entry.identity.clone(),
                    last_seen: entry.last_heartbeat_at,
                })
            })
            .collect();
        models.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        models
    }

    /// Count connected agents.
    pub async fn count(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}
