//! Open client connections of one gateway

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identifies one client connection within a gateway
pub type ConnectionId = u64;

/// Outcome of offering a chunk to one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the client misses this chunk
    NotReady,
    /// Client is gone and was removed
    Closed,
}

/// Per-client send queues, keyed by connection id
///
/// Broadcasting works on a snapshot of the membership, so connects and
/// disconnects never block on or interfere with a broadcast in progress.
#[derive(Debug)]
pub struct ConnectionSet {
    queue_depth: usize,
    next_id: AtomicU64,
    clients: Mutex<HashMap<ConnectionId, mpsc::Sender<Bytes>>>,
}

impl ConnectionSet {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Add a client whose queue starts with `header`
    ///
    /// The header is queued before the client becomes visible to broadcasts,
    /// so it is always the first message the client receives.
    pub fn register(&self, header: Bytes) -> (ConnectionId, mpsc::Receiver<Bytes>) {
        // Room for the header on top of the payload queue
        let (tx, rx) = mpsc::channel(self.queue_depth + 1);
        let _ = tx.try_send(header);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Remove a client. Returns false if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of open clients
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every client queue
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Current members, cloned out of the lock
    pub fn snapshot(&self) -> Vec<(ConnectionId, mpsc::Sender<Bytes>)> {
        self.lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }

    /// Offer a chunk to one client without waiting
    pub fn deliver(&self, id: ConnectionId, tx: &mpsc::Sender<Bytes>, chunk: Bytes) -> Delivery {
        match tx.try_send(chunk) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::NotReady,
            Err(TrySendError::Closed(_)) => {
                self.remove(id);
                Delivery::Closed
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, mpsc::Sender<Bytes>>> {
        // The map stays consistent even if a holder panicked
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
