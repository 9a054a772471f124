//! Registry of live push channels, keyed by user identity.
//!
//! Each accepted WebSocket hands the registry the sending half of an
//! unbounded channel; the socket task drains the receiving half into the
//! wire. connect/disconnect/broadcast race freely across handler tasks and
//! background jobs, so the two maps live behind one mutex and no await
//! happens while it is held.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::errors::AdmissionError;

/// Identifies one channel among the several an identity may hold, so a
/// reconnect can never displace or leak another channel's slot.
pub type ConnectionId = u64;

struct Channel {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<String>,
    #[allow(dead_code)]
    opened_at: Instant,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<String, Vec<Channel>>,
    total: usize,
    next_id: ConnectionId,
}

pub struct ConnectionRegistry {
    max_total_connections: usize,
    max_connections_per_user: usize,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new(max_total_connections: usize, max_connections_per_user: usize) -> Self {
        Self {
            max_total_connections,
            max_connections_per_user,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Admit a new channel for `identity`.
    ///
    /// Rejects with `ServerFull` when the global cap is reached and with
    /// `UserLimit` when this identity is at its per-user cap. On success
    /// the channel is registered and its connection id returned; the
    /// caller completes the handshake only after acceptance.
    pub fn connect(
        &self,
        identity: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<ConnectionId, AdmissionError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.total >= self.max_total_connections {
            return Err(AdmissionError::ServerFull);
        }
        let held = inner.channels.get(identity).map_or(0, Vec::len);
        if held >= self.max_connections_per_user {
            return Err(AdmissionError::UserLimit);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.channels.entry(identity.to_string()).or_default().push(Channel {
            id,
            tx,
            opened_at: Instant::now(),
        });
        inner.total += 1;
        Ok(id)
    }

    /// Remove one channel. Idempotent: unknown identities and already
    /// removed connection ids are no-ops. The identity's entry disappears
    /// entirely with its last channel.
    pub fn disconnect(&self, identity: &str, id: ConnectionId) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(channels) = inner.channels.get_mut(identity) else {
            return;
        };
        let before = channels.len();
        channels.retain(|c| c.id != id);
        let removed = before - channels.len();
        let now_empty = channels.is_empty();
        if now_empty {
            inner.channels.remove(identity);
        }
        inner.total -= removed;
    }

    /// Deliver a message to every channel the identity holds. Silently
    /// does nothing when the identity is absent; a channel whose receiver
    /// is already gone is skipped (cleanup happens via `disconnect` from
    /// the socket task, not here).
    pub fn send_personal(&self, identity: &str, message: &str) {
        let inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(channels) = inner.channels.get(identity) {
            for channel in channels {
                let _ = channel.tx.send(message.to_string());
            }
        }
    }

    /// Deliver a message to every registered channel. A dead channel never
    /// prevents delivery to the rest.
    pub fn broadcast(&self, message: &str) {
        let inner = self.inner.lock().expect("registry lock poisoned");
        for channels in inner.channels.values() {
            for channel in channels {
                let _ = channel.tx.send(message.to_string());
            }
        }
    }

    pub fn total_connections(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").total
    }

    pub fn connections_for(&self, identity: &str) -> usize {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .channels
            .get(identity)
            .map_or(0, Vec::len)
    }
}
