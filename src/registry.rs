//! In-memory tunnel registry.
//!
//! Maps each hospital code to its live tunnel. Registration is an atomic
//! check-and-insert: the first session for a code wins and later attempts
//! see `AlreadyRegistered`. The registry holds references only; it never
//! closes sockets; shutdown walks the entries and signals each session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::error::AuthError;
use crate::tunnel::Tunnel;

/// Point-in-time view of one tunnel, for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub code: String,
    pub subdomain: String,
    pub last_seen: DateTime<Utc>,
    pub remote_addr: String,
}

/// `TunnelId → Tunnel` under concurrent access. Readers proceed without
/// blocking writers of other ids.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly authenticated tunnel. Fails if the code is taken.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Result<(), AuthError> {
        match self.tunnels.entry(tunnel.code.clone()) {
            Entry::Occupied(_) => Err(AuthError::AlreadyRegistered),
            Entry::Vacant(slot) => {
                slot.insert(tunnel);
                Ok(())
            }
        }
    }

    /// Non-blocking lookup.
    pub fn lookup(&self, code: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(code).map(|entry| Arc::clone(&entry))
    }

    /// Remove the entry for `tunnel.code`, but only while it still refers
    /// to this exact tunnel. A session that lost its slot to a racing
    /// re-registration must not evict its replacement.
    pub fn unregister(&self, tunnel: &Arc<Tunnel>) {
        self.tunnels
            .remove_if(&tunnel.code, |_, current| Arc::ptr_eq(current, tunnel));
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Point-in-time copy for the admin surfaces. Concurrent mutation while
    /// snapshotting is fine; the result is whatever was live at iteration.
    pub fn snapshot(&self) -> Vec<TunnelInfo> {
        self.tunnels
            .iter()
            .map(|entry| {
                let tunnel = entry.value();
                TunnelInfo {
                    code: tunnel.code.clone(),
                    subdomain: tunnel.subdomain.clone(),
                    last_seen: tunnel.last_seen(),
                    remote_addr: tunnel.remote_addr.to_string(),
                }
            })
            .collect()
    }

    /// Signal every session to close with a goodbye. Sockets are closed by
    /// their own session tasks, not here.
    pub async fn shutdown_all(&self, reason: &str) {
        let tunnels: Vec<Arc<Tunnel>> = self
            .tunnels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for tunnel in tunnels {
            let _ = tunnel
                .send_text(crate::tunnel::protocol::goodbye(reason))
                .await;
            tunnel.begin_close();
        }
    }
}
