//! Status HTTP server for the relay
//!
//! Read-only JSON view of every stream for dashboards and health checks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::session::{SessionMonitor, StreamStats};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum StatusServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[source] std::io::Error),

    #[error("Status server failed: {0}")]
    ServeError(#[source] std::io::Error),
}

type Monitors = Arc<Vec<SessionMonitor>>;

/// Handler for GET /streams
async fn list_streams(State(monitors): State<Monitors>) -> Json<Vec<StreamStats>> {
    Json(monitors.iter().map(SessionMonitor::stats).collect())
}

/// Handler for GET /streams/:name
async fn get_stream(
    State(monitors): State<Monitors>,
    Path(name): Path<String>,
) -> Result<Json<StreamStats>, StatusCode> {
    monitors
        .iter()
        .find(|monitor| monitor.name() == name)
        .map(|monitor| Json(monitor.stats()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(monitors: Vec<SessionMonitor>) -> Router {
    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/:name", get(get_stream))
        .with_state(Arc::new(monitors))
}

/// Bind the status listener
pub async fn bind_status_listener(addr: SocketAddr) -> Result<TcpListener, StatusServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(StatusServerError::BindError)
}

/// Serve status requests on an already bound listener until `shutdown` resolves
pub async fn serve_status<F>(
    listener: TcpListener,
    monitors: Vec<SessionMonitor>,
    shutdown: F,
) -> Result<(), StatusServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_status_router(monitors);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(StatusServerError::ServeError)
}
