//! The live-connection registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::connection::Connection;

/// Concurrent map of client id to connection. Only the accept loop
/// inserts; removal can come from any task and is idempotent. Readers
/// work on snapshots.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<FxHashMap<u64, Arc<Connection>>>,
    total_packets_sent: AtomicU64,
    total_bytes_sent: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        self.clients
            .write()
            .insert(connection.client_id(), connection);
    }

    /// Removes and disposes a connection, logging its session summary.
    /// Removing an absent id is a no-op.
    pub fn remove(&self, client_id: u64) -> Option<Arc<Connection>> {
        let connection = self.clients.write().remove(&client_id)?;
        connection.disconnect("Connection disposed");
        info!(
            client = client_id,
            addr = %connection.remote_addr(),
            duration_ms = connection.connected_at().elapsed().as_millis() as u64,
            packets_in = connection.packets_received(),
            packets_out = connection.packets_sent(),
            bytes_out = connection.bytes_sent(),
            "client removed"
        );
        Some(connection)
    }

    pub fn get(&self, client_id: u64) -> Option<Arc<Connection>> {
        self.clients.read().get(&client_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients.read().values().cloned().collect()
    }

    /// Queues `frame` on every connected client except `exclude`. Send
    /// failures are logged per client and never fail the broadcast.
    /// Returns the number of clients the frame was queued for.
    pub fn broadcast(&self, frame: &Bytes, exclude: Option<u64>) -> usize {
        let targets = self.snapshot();
        let mut delivered = 0usize;

        for connection in targets {
            if exclude == Some(connection.client_id()) || !connection.is_connected() {
                continue;
            }
            match connection.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.total_packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.total_bytes_sent
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        client = connection.client_id(),
                        "broadcast send failed: {e}"
                    );
                }
            }
        }
        delivered
    }

    pub fn total_packets_sent(&self) -> u64 {
        self.total_packets_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::connection::ConnectionState;
    use crate::NetworkConfig;

    fn connected_client(id: u64) -> (Arc<Connection>, flume::Receiver<Bytes>) {
        let (conn, rx) = Connection::accept(
            id,
            "127.0.0.1:9999".parse().unwrap(),
            CancellationToken::new(),
            &NetworkConfig::default(),
        );
        let _handshake_blob = rx.try_recv().unwrap();
        conn.advance(ConnectionState::DhKeyExchange);
        conn.advance(ConnectionState::Connected);
        (conn, rx)
    }

    #[test]
    fn add_get_remove() {
        let registry = ClientRegistry::new();
        let (a, _rx) = connected_client(1);
        registry.add(Arc::clone(&a));

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(1).unwrap().client_id(), 1);

        assert!(registry.remove(1).is_some());
        assert_eq!(registry.count(), 0);
        assert!(registry.remove(1).is_none());
    }

    #[test]
    fn broadcast_excludes_one_client() {
        let registry = ClientRegistry::new();
        let mut receivers = Vec::new();
        for id in 1..=3 {
            let (conn, rx) = connected_client(id);
            registry.add(conn);
            receivers.push((id, rx));
        }

        let frame = Bytes::from_static(b"hello world");
        let delivered = registry.broadcast(&frame, Some(2));
        assert_eq!(delivered, 2);

        for (id, rx) in &receivers {
            if *id == 2 {
                assert!(rx.try_recv().is_err());
            } else {
                assert_eq!(rx.try_recv().unwrap(), frame);
            }
        }
        assert_eq!(registry.total_packets_sent(), 2);
        assert_eq!(registry.total_bytes_sent(), 2 * frame.len() as u64);
    }

    #[test]
    fn broadcast_skips_unconnected_clients() {
        let registry = ClientRegistry::new();
        let (handshaking, hs_rx) = Connection::accept(
            7,
            "127.0.0.1:9999".parse().unwrap(),
            CancellationToken::new(),
            &NetworkConfig::default(),
        );
        let _blob = hs_rx.try_recv().unwrap();
        registry.add(handshaking);

        let (connected, rx) = connected_client(8);
        registry.add(connected);

        let delivered = registry.broadcast(&Bytes::from_static(b"x"), None);
        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
        assert!(hs_rx.try_recv().is_err());
    }
}
