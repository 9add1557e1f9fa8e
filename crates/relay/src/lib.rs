//! JSMpeg Relay
//!
//! Pulls RTSP sources through an ffmpeg transcoder and fans the resulting
//! MPEG1 stream out to browser clients over WebSocket.

pub mod gateway;
pub mod geometry;
pub mod relay;
pub mod session;
pub mod status_server;
pub mod transcoder;

pub use gateway::{encode_header, BroadcastGateway, BroadcastReport, GatewayError, GatewayHub};
pub use geometry::{find_dimensions, GeometryScanner, ScanState, StreamGeometry};
pub use jsmpeg_relay_config as config;
pub use jsmpeg_relay_config::Config;
pub use relay::{Relay, RelayError};
pub use session::{SessionError, SessionMonitor, StreamSession, StreamStats};
pub use status_server::{
    bind_status_listener, create_status_router, serve_status, StatusServerError,
};
pub use transcoder::{
    build_transcoder_args, build_transcoder_command, FfmpegLauncher, Invocation, ProcessControl,
    ProcessExit, ProcessLauncher, RestartPolicy, SpawnedProcess, StreamSource, StreamState,
    TranscoderOutputs, TranscoderSupervisor, STOP_SIGNAL,
};
