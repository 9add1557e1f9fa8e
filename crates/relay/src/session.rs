//! Stream session
//!
//! One per configured stream. Owns the transcoder supervisor and the
//! broadcast gateway, and runs the pump task that connects them: video
//! chunks go to every client, diagnostic chunks feed the geometry scanner
//! and the log.

use crate::gateway::{BroadcastGateway, GatewayError, GatewayHub};
use crate::geometry::{GeometryScanner, StreamGeometry};
use crate::transcoder::{
    ProcessLauncher, RestartPolicy, StreamSource, StreamState, TranscoderOutputs,
    TranscoderSupervisor,
};
use bytes::Bytes;
use jsmpeg_relay_config::StreamConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The pump task died and took the output channels with it
    #[error("Transcoder output of stream {0} is no longer available")]
    OutputsLost(String),
}

/// Point-in-time view of one stream, as served by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub name: String,
    pub state: StreamState,
    pub width: u16,
    pub height: u16,
    pub clients: usize,
    pub launches: u64,
    pub chunks_broadcast: u64,
    pub bytes_broadcast: u64,
}

/// Read-only handle onto a running session
#[derive(Clone)]
pub struct SessionMonitor {
    name: String,
    hub: Arc<GatewayHub>,
    state: watch::Receiver<StreamState>,
    launches: Arc<AtomicU64>,
}

impl SessionMonitor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> StreamStats {
        let (width, height) = self.hub.geometry().dimensions();
        StreamStats {
            name: self.name.clone(),
            state: *self.state.borrow(),
            width,
            height,
            clients: self.hub.client_count(),
            launches: self.launches.load(Ordering::Relaxed),
            chunks_broadcast: self.hub.chunks_broadcast(),
            bytes_broadcast: self.hub.bytes_broadcast(),
        }
    }
}

struct Pump {
    stop: CancellationToken,
    task: JoinHandle<TranscoderOutputs>,
}

/// A relayed stream: transcoder, geometry and WebSocket listener
pub struct StreamSession {
    config: StreamConfig,
    geometry: Arc<StreamGeometry>,
    supervisor: TranscoderSupervisor,
    gateway: BroadcastGateway,
    outputs: Option<TranscoderOutputs>,
    pump: Option<Pump>,
}

impl StreamSession {
    pub fn new(config: StreamConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let geometry = Arc::new(StreamGeometry::new(config.width, config.height));
        let (supervisor, outputs) = TranscoderSupervisor::new(
            StreamSource::from(&config),
            RestartPolicy::from(&config),
            launcher,
        );
        let gateway = BroadcastGateway::new(
            config.name.clone(),
            geometry.clone(),
            config.client_queue_depth,
        );

        Self {
            config,
            geometry,
            supervisor,
            gateway,
            outputs: Some(outputs),
            pump: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Open the listener and launch the transcoder
    ///
    /// The listener is opened first so a bind failure leaves no process
    /// behind. Calling this on a started session relaunches the transcoder.
    pub async fn start(&mut self) -> Result<SocketAddr, SessionError> {
        let addr = match self.gateway.local_addr() {
            Some(addr) => addr,
            None => self.gateway.open(&self.config.ws_addr()).await?,
        };

        if self.pump.is_none() {
            let outputs = self
                .outputs
                .take()
                .ok_or_else(|| SessionError::OutputsLost(self.config.name.clone()))?;
            let stop = CancellationToken::new();
            let task = tokio::spawn(pump(
                self.config.name.clone(),
                outputs,
                self.gateway.hub(),
                self.geometry.clone(),
                stop.clone(),
            ));
            self.pump = Some(Pump { stop, task });
        }

        self.supervisor.start();
        info!(
            stream = %self.config.name,
            url = %self.config.url,
            addr = %addr,
            "Stream session started"
        );
        Ok(addr)
    }

    /// Stop the transcoder, then close the listener
    ///
    /// Returns once the transcoder has exited and its buffered output has
    /// been broadcast.
    pub async fn stop(&mut self) {
        self.supervisor.stop();
        self.supervisor.stopped().await;

        if let Some(pump) = self.pump.take() {
            pump.stop.cancel();
            match pump.task.await {
                Ok(outputs) => self.outputs = Some(outputs),
                Err(e) => warn!(stream = %self.config.name, error = %e, "Pump task failed"),
            }
        }

        self.gateway.close().await;
        info!(stream = %self.config.name, "Stream session stopped");
    }

    pub fn state(&self) -> StreamState {
        self.supervisor.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.gateway.local_addr()
    }

    pub fn geometry(&self) -> &Arc<StreamGeometry> {
        &self.geometry
    }

    pub fn client_count(&self) -> usize {
        self.gateway.client_count()
    }

    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            name: self.config.name.clone(),
            hub: self.gateway.hub(),
            state: self.supervisor.subscribe_state(),
            launches: self.supervisor.launch_counter(),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(pump) = &self.pump {
            pump.stop.cancel();
        }
    }
}

/// Move transcoder output to its consumers until cancelled or both channels close
///
/// Hands the output channels back so the session can be started again.
async fn pump(
    name: String,
    mut outputs: TranscoderOutputs,
    hub: Arc<GatewayHub>,
    geometry: Arc<StreamGeometry>,
    stop: CancellationToken,
) -> TranscoderOutputs {
    let mut scanner = GeometryScanner::new(&geometry);
    let mut video_open = true;
    let mut diagnostics_open = true;

    while video_open || diagnostics_open {
        tokio::select! {
            _ = stop.cancelled() => break,
            chunk = outputs.video.recv(), if video_open => match chunk {
                Some(chunk) => {
                    hub.broadcast(chunk);
                }
                None => video_open = false,
            },
            chunk = outputs.diagnostics.recv(), if diagnostics_open => match chunk {
                Some(chunk) => handle_diagnostic(&name, &chunk, &mut scanner, &geometry),
                None => diagnostics_open = false,
            },
        }
    }

    // Whatever the exited process left in the channels still goes out
    while let Ok(chunk) = outputs.diagnostics.try_recv() {
        handle_diagnostic(&name, &chunk, &mut scanner, &geometry);
    }
    while let Ok(chunk) = outputs.video.try_recv() {
        hub.broadcast(chunk);
    }

    outputs
}

fn handle_diagnostic(
    name: &str,
    chunk: &Bytes,
    scanner: &mut GeometryScanner,
    geometry: &StreamGeometry,
) {
    scanner.feed(chunk, geometry);

    let text = String::from_utf8_lossy(chunk);
    for line in text.split(['\r', '\n']) {
        let line = line.trim_end();
        if !line.is_empty() {
            debug!(target: "ffmpeg", stream = name, "{}", line);
        }
    }
}
