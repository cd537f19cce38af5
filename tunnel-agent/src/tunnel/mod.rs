//! Tunnel connection to the backend.

mod backoff;
mod client;

pub use backoff::ReconnectBackoff;
pub use client::{ConnectionState, TunnelClient};
