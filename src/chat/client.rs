// Connected clients and the registry that tracks them

use crate::chat::error::{RelayError, RelayResult};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A connected client
///
/// The TLS stream itself lives in the connection handler; the client only
/// holds the sending side of its outbound queue. A single writer task drains
/// that queue, so at most one write is ever in flight on the channel.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ClientId,
    pub peer_addr: SocketAddr,
    pub connected_at: SystemTime,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Create a new client connection
    pub fn new(
        peer_addr: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: ClientId::new(),
            peer_addr,
            connected_at: SystemTime::now(),
            outbound,
            cancel,
        }
    }

    /// Create a client together with the receiving end of its outbound queue
    pub fn with_queue(
        peer_addr: SocketAddr,
        queue_len: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        (Self::new(peer_addr, tx, cancel), rx)
    }

    /// Queue a payload for this client without waiting
    pub fn enqueue(&self, payload: Bytes) -> RelayResult<()> {
        if self.cancel.is_cancelled() {
            return Err(self.write_error("connection is closing"));
        }

        self.outbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => self.write_error("outbound queue full"),
            TrySendError::Closed(_) => self.write_error("writer has stopped"),
        })
    }

    /// Ask the owning handler to close this connection
    pub fn evict(&self) {
        self.cancel.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn write_error(&self, reason: &str) -> RelayError {
        RelayError::ChannelWrite {
            client: self.id,
            reason: reason.to_string(),
        }
    }
}

/// Ordered, bounded set of connected clients
///
/// The lock is never held across I/O or an `.await`.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: RwLock<Vec<Arc<ClientConnection>>>,
    capacity: usize,
}

impl ClientRegistry {
    /// Create a registry that holds at most `capacity` clients
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Add a client
    pub fn register(&self, client: Arc<ClientConnection>) -> RelayResult<()> {
        let mut clients = self.clients.write();

        if clients.iter().any(|c| c.id == client.id) {
            return Err(RelayError::DuplicateClient(client.id));
        }
        if clients.len() >= self.capacity {
            return Err(RelayError::RegistryFull {
                capacity: self.capacity,
            });
        }

        clients.push(client.clone());
        let count = clients.len();
        drop(clients);

        tracing::info!(
            "Client {} connected from {} ({}/{})",
            client.id,
            client.peer_addr,
            count,
            self.capacity
        );
        Ok(())
    }

    /// Register a client and get a guard that deregisters it when dropped
    pub fn join(self: &Arc<Self>, client: Arc<ClientConnection>) -> RelayResult<Membership> {
        let id = client.id;
        self.register(client)?;
        Ok(Membership {
            registry: self.clone(),
            id,
        })
    }

    /// Remove a client; unknown ids are ignored
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        let removed = {
            let mut clients = self.clients.write();
            let index = clients.iter().position(|c| &c.id == id)?;
            clients.remove(index)
        };

        tracing::info!("Client {} disconnected", id);
        Some(removed)
    }

    /// Point-in-time copy of the registered clients, in registration order
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.clients.read().clone()
    }

    /// Remove every client and close its channel, returning how many were closed
    pub fn close_all(&self) -> usize {
        let clients = std::mem::take(&mut *self.clients.write());
        for client in &clients {
            client.evict();
        }
        clients.len()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.read().iter().any(|c| &c.id == id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Registry membership held by a connection handler
///
/// Dropping it deregisters the client, whichever way the handler exits.
#[derive(Debug)]
pub struct Membership {
    registry: Arc<ClientRegistry>,
    id: ClientId,
}

impl Membership {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn client(queue_len: usize) -> (Arc<ClientConnection>, mpsc::Receiver<Bytes>) {
        let (client, rx) =
            ClientConnection::with_queue(peer(), queue_len, CancellationToken::new());
        (Arc::new(client), rx)
    }

    #[test]
    fn test_register_until_full() {
        let registry = ClientRegistry::new(2);

        let (a, _rx_a) = client(4);
        let (b, _rx_b) = client(4);
        let (c, _rx_c) = client(4);

        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        assert!(registry.is_full());

        let err = registry.register(c.clone()).unwrap_err();
        assert!(matches!(err, RelayError::RegistryFull { capacity: 2 }));
        assert!(!registry.contains(&c.id));

        let ids: Vec<_> = registry.snapshot().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = ClientRegistry::new(4);
        let (a, _rx) = client(4);

        registry.register(a.clone()).unwrap();
        let err = registry.register(a.clone()).unwrap_err();
        assert!(matches!(err, RelayError::DuplicateClient(id) if id == a.id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ClientRegistry::new(4);
        let (a, _rx_a) = client(4);
        let (b, _rx_b) = client(4);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert!(registry.remove(&a.id).is_some());
        assert!(registry.remove(&a.id).is_none());
        assert!(registry.remove(&ClientId::new()).is_none());

        let ids: Vec<_> = registry.snapshot().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutation() {
        let registry = ClientRegistry::new(4);
        let (a, _rx_a) = client(4);
        let (b, _rx_b) = client(4);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        let snapshot = registry.snapshot();
        registry.remove(&a.id);
        registry.close_all();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, a.id);
        assert_eq!(snapshot[1].id, b.id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_membership_deregisters_on_drop() {
        let registry = Arc::new(ClientRegistry::new(1));
        let (a, _rx_a) = client(4);

        let membership = registry.join(a.clone()).unwrap();
        assert_eq!(membership.id(), a.id);
        assert!(registry.is_full());

        drop(membership);
        assert!(registry.is_empty());

        // The slot is free again
        let (b, _rx_b) = client(4);
        registry.join(b).unwrap();
    }

    #[test]
    fn test_close_all_evicts() {
        let registry = ClientRegistry::new(4);
        let (a, _rx_a) = client(4);
        let (b, _rx_b) = client(4);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closing());
        assert!(b.is_closing());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_enqueue_failures() {
        let (a, mut rx) = client(1);

        a.enqueue(Bytes::from_static(b"one")).unwrap();
        let err = a.enqueue(Bytes::from_static(b"two")).unwrap_err();
        assert!(matches!(
            err,
            RelayError::ChannelWrite { ref reason, .. } if reason == "outbound queue full"
        ));

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        drop(rx);
        let err = a.enqueue(Bytes::from_static(b"three")).unwrap_err();
        assert!(matches!(
            err,
            RelayError::ChannelWrite { ref reason, .. } if reason == "writer has stopped"
        ));

        let (b, _rx_b) = client(4);
        b.evict();
        assert!(b.enqueue(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations() {
        const CAPACITY: usize = 32;
        let registry = Arc::new(ClientRegistry::new(CAPACITY));

        let mut tasks = Vec::new();
        for _ in 0..CAPACITY {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (c, rx) = ClientConnection::with_queue(peer(), 4, CancellationToken::new());
                registry.register(Arc::new(c)).map(|_| rx)
            }));
        }

        let mut receivers = Vec::new();
        for task in tasks {
            receivers.push(task.await.unwrap().unwrap());
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), CAPACITY);
        let distinct: std::collections::HashSet<_> = snapshot.iter().map(|c| c.id).collect();
        assert_eq!(distinct.len(), CAPACITY);

        let (extra, _rx) = client(4);
        assert!(matches!(
            registry.register(extra),
            Err(RelayError::RegistryFull { .. })
        ));
    }
}
