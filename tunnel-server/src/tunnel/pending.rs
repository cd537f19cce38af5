//! Pending-request table pairing in-flight dispatches with their responses.
//!
//! Each dispatch registers a correlation id and a oneshot sink here, then the
//! connection's receive loop resolves it when the matching response frame
//! arrives. Exactly one of {response, deadline, disconnect} resolves a given
//! id; every path goes through the same remove-first map operation, so the
//! losers see an unknown id and back off.

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use tunnel_common::InferenceReply;

use super::DispatchError;

/// Outcome delivered to a waiting dispatch.
pub type DispatchOutcome = Result<InferenceReply, DispatchError>;

struct PendingEntry {
    connection_id: Uuid,
    sender: oneshot::Sender<DispatchOutcome>,
}

/// Table of requests awaiting a response, keyed by correlation id.
#[derive(Default)]
pub struct PendingRequests {
    requests: DashMap<Uuid, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
        }
    }

    /// Allocate a correlation id and register a waiting caller bound to
    /// `connection_id`. The id is unique among outstanding requests; reuse
    /// after completion is harmless.
    pub fn register(&self, connection_id: Uuid) -> (Uuid, oneshot::Receiver<DispatchOutcome>) {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.requests.insert(
            correlation_id,
            PendingEntry {
                connection_id,
                sender: tx,
            },
        );
        tracing::debug!(%correlation_id, "Registered pending request");
        (correlation_id, rx)
    }

    /// Route a response to its waiting caller.
    ///
    /// Returns false for an unknown or already-resolved correlation id; the
    /// receive loop drops such responses without erroring back to the agent.
    pub fn resolve(&self, correlation_id: Uuid, reply: InferenceReply) -> bool {
        match self.requests.remove(&correlation_id) {
            Some((_, entry)) => entry.sender.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    /// Fail every request bound to a connection that closed or was evicted.
    /// Returns how many requests were failed.
    pub fn fail_connection(&self, connection_id: Uuid) -> usize {
        // Collect first: removing while holding the iterator's shard lock
        // would deadlock.
        let ids: Vec<Uuid> = self
            .requests
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.requests.remove(&id) {
                let _ = entry.sender.send(Err(DispatchError::TunnelDisconnected));
                failed += 1;
            }
        }
        failed
    }

    /// Drop a request the caller gave up on (deadline or cancellation). A
    /// late response then falls into the unknown-correlation path.
    pub fn cancel(&self, correlation_id: Uuid) -> bool {
        self.requests.remove(&correlation_id).is_some()
    }

    /// Count of currently outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
