//! WebSocket broadcast gateway
//!
//! One listener per stream. Every client gets the 8-byte connection header
//! first, then each video chunk as one binary message, in production order.
//! A client whose queue is full misses the chunk; nothing is replayed.

pub mod connections;
pub mod header;

pub use connections::{ConnectionId, ConnectionSet, Delivery};
pub use header::{encode_header, HEADER_LEN, HEADER_MAGIC};

use crate::geometry::StreamGeometry;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can occur when opening a gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gateway already listening on {0}")]
    AlreadyOpen(SocketAddr),
}

/// Result of broadcasting one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the chunk was queued for
    pub delivered: usize,
    /// Clients that were not ready
    pub skipped: usize,
    /// Clients found closed and removed
    pub removed: usize,
}

/// Connection set plus the shared geometry new clients are greeted with
#[derive(Debug)]
pub struct GatewayHub {
    name: String,
    geometry: Arc<StreamGeometry>,
    connections: ConnectionSet,
    chunks_broadcast: AtomicU64,
    bytes_broadcast: AtomicU64,
}

impl GatewayHub {
    pub fn new(name: impl Into<String>, geometry: Arc<StreamGeometry>, queue_depth: usize) -> Self {
        Self {
            name: name.into(),
            geometry,
            connections: ConnectionSet::new(queue_depth),
            chunks_broadcast: AtomicU64::new(0),
            bytes_broadcast: AtomicU64::new(0),
        }
    }

    /// Register a new client, greeting it with the header for the geometry
    /// known right now (zeros if nothing has been discovered yet)
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Bytes>) {
        let (width, height) = self.geometry.dimensions();
        let registered = self.connections.register(encode_header(width, height));
        info!(
            stream = %self.name,
            clients = self.connections.len(),
            width,
            height,
            "New WebSocket connection"
        );
        registered
    }

    pub fn disconnect(&self, id: ConnectionId) {
        if self.connections.remove(id) {
            info!(
                stream = %self.name,
                clients = self.connections.len(),
                "WebSocket connection closed"
            );
        }
    }

    /// Send a chunk, unmodified, to every ready client
    pub fn broadcast(&self, chunk: Bytes) -> BroadcastReport {
        self.chunks_broadcast.fetch_add(1, Ordering::Relaxed);
        self.bytes_broadcast
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        let mut report = BroadcastReport::default();
        for (id, tx) in self.connections.snapshot() {
            match self.connections.deliver(id, &tx, chunk.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::NotReady => {
                    debug!(stream = %self.name, client = id, "Client not ready, skipping chunk");
                    report.skipped += 1;
                }
                Delivery::Closed => {
                    debug!(stream = %self.name, client = id, "Client gone, removed");
                    report.removed += 1;
                }
            }
        }
        report
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    pub fn chunks_broadcast(&self) -> u64 {
        self.chunks_broadcast.load(Ordering::Relaxed)
    }

    pub fn bytes_broadcast(&self) -> u64 {
        self.bytes_broadcast.load(Ordering::Relaxed)
    }

    pub fn geometry(&self) -> &Arc<StreamGeometry> {
        &self.geometry
    }

    /// Drop every client queue. Each client's socket task ends once it has
    /// flushed what was already queued.
    fn close_clients(&self) {
        self.connections.clear();
    }
}

struct OpenListener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// WebSocket listener of one stream
pub struct BroadcastGateway {
    hub: Arc<GatewayHub>,
    listener: Option<OpenListener>,
}

impl BroadcastGateway {
    pub fn new(name: impl Into<String>, geometry: Arc<StreamGeometry>, queue_depth: usize) -> Self {
        Self {
            hub: Arc::new(GatewayHub::new(name, geometry, queue_depth)),
            listener: None,
        }
    }

    /// Start accepting WebSocket connections on `addr`
    ///
    /// The upgrade is accepted on any request path. Returns the bound address,
    /// which differs from `addr` when port 0 was requested.
    pub async fn open(&mut self, addr: &str) -> Result<SocketAddr, GatewayError> {
        if let Some(open) = &self.listener {
            return Err(GatewayError::AlreadyOpen(open.addr));
        }

        let bind_err = |source| GatewayError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let app = Router::new()
            .fallback(ws_handler)
            .with_state(self.hub.clone());

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let name = self.hub.name.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = axum::serve(listener, app) => {
                    if let Err(e) = result {
                        warn!(stream = %name, error = %e, "WebSocket listener failed");
                    }
                }
            }
        });

        info!(stream = %self.hub.name, addr = %local_addr, "Awaiting WebSocket connections");
        self.listener = Some(OpenListener {
            addr: local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop listening and release the port
    ///
    /// Already-open clients are not sent a close frame; their queues are
    /// dropped and their sockets end when the socket tasks notice.
    pub async fn close(&mut self) {
        if let Some(open) = self.listener.take() {
            open.shutdown.cancel();
            let _ = open.task.await;
            info!(stream = %self.hub.name, addr = %open.addr, "WebSocket listener closed");
        }
        self.hub.close_clients();
    }

    /// Bound address while open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|open| open.addr)
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    pub fn hub(&self) -> Arc<GatewayHub> {
        self.hub.clone()
    }

    pub fn broadcast(&self, chunk: Bytes) -> BroadcastReport {
        self.hub.broadcast(chunk)
    }

    pub fn client_count(&self) -> usize {
        self.hub.client_count()
    }
}

impl Drop for BroadcastGateway {
    fn drop(&mut self) {
        if let Some(open) = &self.listener {
            open.shutdown.cancel();
        }
        // Socket tasks hold the hub, so their queues must be dropped here
        self.hub.close_clients();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<GatewayHub>>) -> Response {
    ws.on_upgrade(move |socket| serve_client(socket, hub))
}

/// Pump one client's queue into its socket until either side goes away
async fn serve_client(socket: WebSocket, hub: Arc<GatewayHub>) {
    let (id, mut queue) = hub.connect();
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            chunk = queue.recv() => match chunk {
                Some(chunk) => {
                    // axum's Message::Binary owns a Vec, so each client gets its own copy
                    if let Err(e) = sink.send(Message::Binary(chunk.to_vec())).await {
                        debug!(stream = %hub.name, client = id, error = %e, "Send failed");
                        break;
                    }
                }
                None => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(stream = %hub.name, client = id, error = %e, "Receive failed");
                    break;
                }
                // Inbound data is ignored
                Some(Ok(_)) => {}
            },
        }
    }

    hub.disconnect(id);
}
