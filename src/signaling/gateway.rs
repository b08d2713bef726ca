#![forbid(unsafe_code)]

// Connection registry: the process-wide ConnID index. Holds each live
// socket's authenticated identity, its bounded send queue, its kill signal,
// and the ConnID -> (UserID, RoomID) reverse index. Written only at
// connect/disconnect/join; room workers just read and send.

use crate::auth::Identity;
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Live connection handle.
pub struct ConnHandle {
    pub identity: Identity,
    pub sender: mpsc::Sender<Arc<String>>,
    /// Force-close signal; fired when this connection's send queue
    /// overflows. The connection loop treats it as a disconnect.
    pub kill: Arc<Notify>,
    pub room_id: Option<String>,
}

/// Shared map of live connections.
#[derive(Clone)]
pub struct ConnRegistry {
    inner: Arc<StdRwLock<HashMap<String, ConnHandle>>>,
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdRwLock::new(HashMap::new())),
        }
    }

    /// Binds a ConnID to its authenticated identity and egress queue. Must
    /// happen before any event from the connection is dispatched.
    pub fn register(
        &self,
        conn_id: &str,
        identity: Identity,
        sender: mpsc::Sender<Arc<String>>,
        kill: Arc<Notify>,
    ) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(
            conn_id.to_string(),
            ConnHandle { identity, sender, kill, room_id: None },
        );
    }

    pub fn unregister(&self, conn_id: &str) -> Option<ConnHandle> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(conn_id)
    }

    pub fn set_room(&self, conn_id: &str, room_id: Option<&str>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = map.get_mut(conn_id) {
            handle.room_id = room_id.map(str::to_string);
        }
    }

    pub fn room_of(&self, conn_id: &str) -> Option<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(conn_id).and_then(|h| h.room_id.clone())
    }

    pub fn identity_of(&self, conn_id: &str) -> Option<Identity> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(conn_id).map(|h| h.identity.clone())
    }

    /// Egress queue and kill signal for a connection, for callers that hold
    /// onto them (room participants).
    pub fn sender_of(&self, conn_id: &str) -> Option<(mpsc::Sender<Arc<String>>, Arc<Notify>)> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(conn_id).map(|h| (h.sender.clone(), h.kill.clone()))
    }

    pub fn is_live(&self, conn_id: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(conn_id)
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends a message to one connection. Overflow force-closes the target
    /// connection (the one place the hub drops messages); a missing or
    /// closed connection is a silent no-op. Returns whether the frame was
    /// queued.
    pub fn send(&self, conn_id: &str, message: &ServerMessage) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", conn_id, e);
                return false;
            }
        };
        self.send_raw(conn_id, json)
    }

    /// Sends a pre-serialized frame to one connection.
    pub fn send_raw(&self, conn_id: &str, json: Arc<String>) -> bool {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = map.get(conn_id) else {
            debug!("Send to unknown connection {} dropped", conn_id);
            return false;
        };
        match handle.sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Send queue full for connection {}, force-closing", conn_id);
                handle.kill.notify_one();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Connection {} already closed", conn_id);
                false
            }
        }
    }
}
