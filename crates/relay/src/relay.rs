//! Relay startup and main loop
//!
//! Owns one stream session per configured stream and the optional status
//! server, and tears everything down on shutdown.

use crate::config::{Config, ConfigError};
use crate::session::{SessionError, SessionMonitor, StreamSession};
use crate::status_server::{bind_status_listener, serve_status, StatusServerError};
use crate::transcoder::{FfmpegLauncher, ProcessLauncher};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stream could not be started
    #[error("Stream '{name}' failed to start: {source}")]
    Session {
        name: String,
        #[source]
        source: SessionError,
    },

    /// Status server error
    #[error("Status server error: {0}")]
    Status(#[from] StatusServerError),
}

struct StatusTask {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// All relayed streams of one process
pub struct Relay {
    config: Config,
    sessions: Vec<StreamSession>,
    status: Option<StatusTask>,
}

impl Relay {
    /// Create a relay that launches the real transcoder binary
    pub fn new(config: Config) -> Self {
        Self::with_launcher(config, Arc::new(FfmpegLauncher))
    }

    /// Load, override and validate the configuration file, then create the relay
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let config = Config::load(path)?;
        Ok(Self::new(config))
    }

    /// Create a relay with a custom process launcher
    pub fn with_launcher(config: Config, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let sessions = config
            .streams
            .iter()
            .map(|stream| StreamSession::new(stream.clone(), launcher.clone()))
            .collect();

        Self {
            config,
            sessions,
            status: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every stream, then the status server if one is configured
    ///
    /// If any stream fails to start, the ones already started are stopped
    /// again. Returns the WebSocket address of each stream, in config order.
    pub async fn start(&mut self) -> Result<Vec<SocketAddr>, RelayError> {
        let mut addrs = Vec::with_capacity(self.sessions.len());
        for index in 0..self.sessions.len() {
            match self.sessions[index].start().await {
                Ok(addr) => addrs.push(addr),
                Err(source) => {
                    let name = self.sessions[index].name().to_string();
                    error!(stream = %name, error = %source, "Failed to start stream");
                    self.stop().await;
                    return Err(RelayError::Session { name, source });
                }
            }
        }

        if let Err(e) = self.start_status_server().await {
            self.stop().await;
            return Err(e);
        }

        info!(streams = self.sessions.len(), "Relay started");
        Ok(addrs)
    }

    /// Stop every stream and the status server
    pub async fn stop(&mut self) {
        if let Some(status) = self.status.take() {
            status.shutdown.cancel();
            let _ = status.task.await;
        }
        for session in &mut self.sessions {
            session.stop().await;
        }
        info!("Relay stopped");
    }

    /// Start the relay, wait for `shutdown`, then stop it
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        info!("Shutdown requested");
        self.stop().await;
        Ok(())
    }

    /// Monitors for every stream, in config order
    pub fn monitors(&self) -> Vec<SessionMonitor> {
        self.sessions.iter().map(StreamSession::monitor).collect()
    }

    pub fn sessions(&self) -> &[StreamSession] {
        &self.sessions
    }

    /// Returns the bound address, or None when no status server is configured
    async fn start_status_server(&mut self) -> Result<Option<SocketAddr>, RelayError> {
        let Some(addr) = self.config.status.addr else {
            return Ok(None);
        };
        if self.status.is_some() {
            return Ok(None);
        }

        let listener = bind_status_listener(addr).await?;
        let local_addr = listener.local_addr().map_err(StatusServerError::BindError)?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let monitors = self.monitors();
        let task = tokio::spawn(async move {
            if let Err(e) = serve_status(listener, monitors, signal.cancelled_owned()).await {
                error!(error = %e, "Status server error");
            }
        });

        info!(addr = %local_addr, "Status server listening");
        self.status = Some(StatusTask { shutdown, task });
        Ok(Some(local_addr))
    }
}
