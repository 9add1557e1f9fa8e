//! CLI entry point for the jsmpeg relay
//!
//! Loads the configuration (or builds a single ad-hoc stream from flags),
//! installs logging and runs the relay until Ctrl-C or SIGTERM.

use clap::Parser;
use jsmpeg_relay::config::{ConfigError, StreamConfig};
use jsmpeg_relay::{Config, Relay};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Relay RTSP cameras to browsers as MPEG1 over WebSocket
#[derive(Parser, Debug)]
#[command(name = "jsmpeg-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (ignored when --url is given)
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Relay a single RTSP source instead of reading the config file
    #[arg(short, long)]
    url: Option<String>,

    /// WebSocket port for --url
    #[arg(short, long, default_value_t = 9999)]
    port: u16,

    /// Stream name for --url
    #[arg(short, long, default_value = "stream")]
    name: String,

    /// Frame width for --url (discovered from ffmpeg output if omitted)
    #[arg(long)]
    width: Option<u16>,

    /// Frame height for --url (discovered from ffmpeg output if omitted)
    #[arg(long)]
    height: Option<u16>,

    /// Transcoder binary, for every stream
    #[arg(long)]
    ffmpeg_path: Option<String>,

    /// Do not restart the transcoder when it exits, for every stream
    #[arg(long)]
    no_restart: bool,

    /// Serve the JSON status endpoint on this address
    #[arg(long)]
    status_addr: Option<SocketAddr>,

    /// Extra transcoder arguments for --url, after `--`
    #[arg(last = true)]
    ffmpeg_args: Vec<String>,
}

/// Build the relay configuration: file or ad-hoc stream, then environment,
/// then command-line overrides
fn build_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.url {
        Some(url) => {
            let mut stream = StreamConfig::new(args.name.clone(), url.clone(), args.port);
            stream.width = args.width;
            stream.height = args.height;
            stream.ffmpeg_options = args.ffmpeg_args.clone();
            Config {
                streams: vec![stream],
                ..Config::default()
            }
        }
        None => Config::load_from_file(&args.config)?,
    };

    config.apply_env_overrides();

    for stream in &mut config.streams {
        if let Some(path) = &args.ffmpeg_path {
            stream.ffmpeg_path = path.clone();
        }
        if args.no_restart {
            stream.restart_on_close = false;
        }
    }
    if let Some(addr) = args.status_addr {
        config.status.addr = Some(addr);
    }

    config.validate()?;
    Ok(config)
}

/// RUST_LOG wins over the configured filter
fn init_tracing(configured: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging.filter);
    for stream in &config.streams {
        info!(
            stream = %stream.name,
            url = %stream.url,
            addr = %stream.ws_addr(),
            restart_on_close = stream.restart_on_close,
            "Configured stream"
        );
    }

    let mut relay = Relay::new(config);
    if let Err(e) = relay.run_until(shutdown_signal()).await {
        error!(error = %e, "Relay error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
