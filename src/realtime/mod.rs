//! Realtime fan-out to connected WebSocket clients.
//!
//! Event handlers push frames through a [`ConnectionRegistry`] keyed by
//! scope: a conversation id for chat fan-out, a user id for notification
//! pushes. Delivery is best-effort; there is no buffering for absent or
//! slow clients, so a missed frame is simply missed. Durable state lives
//! in the stores the handlers write first.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[cfg(feature = "realtime")]
pub mod socket;

/// Handle for queueing outbound frames to one connected client.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Registry of live WebSocket connections, keyed by scope.
///
/// Holds open connections only: entries are pruned when their socket task
/// unregisters and when a broadcast finds the channel closed. A scope with
/// no connections has no entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Vec<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `scope`.
    pub fn register(&self, scope: &str, handle: ConnectionHandle) {
        let mut connections = self.connections.write();
        connections
            .entry(scope.to_string())
            .or_default()
            .push(handle);

        debug!(scope = scope, "WebSocket connection registered");
    }

    /// Remove the connection with `id` from `scope`, dropping any other
    /// closed handles found along the way.
    pub fn unregister(&self, scope: &str, id: Uuid) {
        let mut connections = self.connections.write();
        if let Some(handles) = connections.get_mut(scope) {
            handles.retain(|h| h.id != id && !h.is_closed());
            if handles.is_empty() {
                connections.remove(scope);
            }
        }

        debug!(scope = scope, connection = %id, "WebSocket connection unregistered");
    }

    /// Snapshot of the handles currently registered under `scope`.
    pub fn handles(&self, scope: &str) -> Vec<ConnectionHandle> {
        let connections = self.connections.read();
        connections.get(scope).cloned().unwrap_or_default()
    }

    /// Serialize `frame` once and queue it for every connection in `scope`.
    ///
    /// Clients whose outbound buffer is full are skipped rather than
    /// awaited, so a slow reader cannot stall the event handler. Closed
    /// connections found here are pruned. Returns the number of clients
    /// the frame was queued for.
    pub fn broadcast<T: Serialize>(&self, scope: &str, frame: &T) -> usize {
        let frame = match serde_json::to_string(frame) {
            Ok(frame) => frame,
            Err(e) => {
                error!(scope = scope, error = %e, "Failed to serialize frame");
                return 0;
            }
        };
        self.broadcast_text(scope, frame)
    }

    fn broadcast_text(&self, scope: &str, frame: String) -> usize {
        let handles = self.handles(scope);
        if handles.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut stale: Vec<Uuid> = Vec::new();

        for handle in &handles {
            match handle.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        scope = scope,
                        connection = %handle.id,
                        "Outbound buffer full, dropping frame for slow client"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stale.push(handle.id);
                }
            }
        }

        if !stale.is_empty() {
            let mut connections = self.connections.write();
            if let Some(handles) = connections.get_mut(scope) {
                handles.retain(|h| !stale.contains(&h.id) && !h.is_closed());
                if handles.is_empty() {
                    connections.remove(scope);
                }
            }
        }

        debug!(scope = scope, delivered = delivered, "Broadcast frame");
        delivered
    }

    /// Number of connections registered under `scope`.
    pub fn connection_count(&self, scope: &str) -> usize {
        let connections = self.connections.read();
        connections.get(scope).map(|h| h.len()).unwrap_or(0)
    }

    /// Number of connections across all scopes.
    pub fn total_connections(&self) -> usize {
        let connections = self.connections.read();
        connections.values().map(|h| h.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn connected_handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn test_empty_registry() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.total_connections(), 0);
        assert_eq!(registry.connection_count("conv-1"), 0);
        assert!(registry.handles("conv-1").is_empty());
    }

    #[test]
    fn test_register_and_count() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = connected_handle(8);
        let (second, _rx2) = connected_handle(8);
        let (other, _rx3) = connected_handle(8);

        registry.register("conv-1", first);
        registry.register("conv-1", second);
        registry.register("user-9", other);

        assert_eq!(registry.connection_count("conv-1"), 2);
        assert_eq!(registry.connection_count("user-9"), 1);
        assert_eq!(registry.total_connections(), 3);
    }

    #[test]
    fn test_broadcast_delivers_serialized_frame() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = connected_handle(8);
        registry.register("conv-1", handle);

        let delivered = registry.broadcast("conv-1", &json!({"type": "file", "url": "u"}));

        assert_eq!(delivered, 1);
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["url"], "u");
    }

    #[test]
    fn test_broadcast_respects_scope() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = connected_handle(8);
        registry.register("conv-1", handle);

        assert_eq!(registry.broadcast("conv-2", &json!({"n": 1})), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_reaches_all_connections_in_scope() {
        let registry = ConnectionRegistry::new();
        let (first, mut rx1) = connected_handle(8);
        let (second, mut rx2) = connected_handle(8);
        registry.register("conv-1", first);
        registry.register("conv-1", second);

        assert_eq!(registry.broadcast("conv-1", &json!({"n": 1})), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_prunes_closed_connections() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = connected_handle(8);
        registry.register("conv-1", handle);
        drop(rx);

        assert_eq!(registry.broadcast("conv-1", &json!({"n": 1})), 0);
        assert_eq!(registry.connection_count("conv-1"), 0);
        assert_eq!(registry.total_connections(), 0);
    }

    #[test]
    fn test_broadcast_skips_full_buffer_without_pruning() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = connected_handle(1);
        registry.register("conv-1", handle);

        assert_eq!(registry.broadcast("conv-1", &json!({"n": 1})), 1);
        // Buffer now full; the slow client misses this frame but stays live
        assert_eq!(registry.broadcast("conv-1", &json!({"n": 2})), 0);
        assert_eq!(registry.connection_count("conv-1"), 1);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("\"n\":1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_removes_single_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = connected_handle(8);
        let (second, _rx2) = connected_handle(8);
        let first_id = first.id();

        registry.register("conv-1", first);
        registry.register("conv-1", second);
        registry.unregister("conv-1", first_id);

        assert_eq!(registry.connection_count("conv-1"), 1);
    }

    #[test]
    fn test_unregister_drops_empty_scope() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = connected_handle(8);
        let id = handle.id();

        registry.register("conv-1", handle);
        registry.unregister("conv-1", id);

        assert_eq!(registry.connection_count("conv-1"), 0);
        assert_eq!(registry.total_connections(), 0);
    }
}
