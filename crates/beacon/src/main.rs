use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use beacon::config::{FileSettings, Settings};
use beacon::{proxy, tap};
use clap::{Parser, Subcommand};
use tracing::error;

/// Measurement-transport demo: a TCP proxy (`serve`) and a stdin tap
/// (`tap`), both fronting a fixed downstream collector through a buffered
/// outbound writer.
#[derive(Parser)]
#[command(name = "beacon", version, about)]
struct Cli {
    /// Optional on-disk settings file, layered under CLI flags.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept TCP clients and forward their bytes into a per-client writer.
    Serve {
        /// Address to accept client connections on.
        #[arg(long, default_value = "127.0.0.1:9100")]
        listen: String,
        /// Downstream collector address each client's bytes are forwarded to.
        #[arg(long)]
        downstream: String,
        #[arg(long)]
        capacity_bytes: Option<usize>,
        #[arg(long)]
        chunk_bytes: Option<usize>,
        #[arg(long)]
        idle_threshold_secs: Option<u64>,
    },
    /// Feed a single writer from stdin, for piping local byte streams
    /// straight to a downstream collector without a proxy hop.
    Tap {
        /// Downstream collector address.
        #[arg(long)]
        downstream: String,
        #[arg(long)]
        capacity_bytes: Option<usize>,
        #[arg(long)]
        chunk_bytes: Option<usize>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut settings = Settings::default();
    if let Some(path) = &cli.settings {
        match FileSettings::load(path) {
            Ok(file) => settings = settings.merge_file(&file),
            Err(e) => {
                error!(error = %e, "failed to load settings file");
                return ExitCode::FAILURE;
            }
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    if signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone()).is_err()
        || signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone()).is_err()
    {
        error!("failed to register shutdown signal handlers");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Serve { listen, downstream, capacity_bytes, chunk_bytes, idle_threshold_secs } => {
            apply_overrides(&mut settings, capacity_bytes, chunk_bytes, idle_threshold_secs);
            run_serve(&listen, &downstream, settings, shutdown)
        }
        Command::Tap { downstream, capacity_bytes, chunk_bytes } => {
            apply_overrides(&mut settings, capacity_bytes, chunk_bytes, None);
            run_tap(&downstream, settings, shutdown)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "beacon exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn apply_overrides(
    settings: &mut Settings,
    capacity_bytes: Option<usize>,
    chunk_bytes: Option<usize>,
    idle_threshold_secs: Option<u64>,
) {
    if let Some(capacity_bytes) = capacity_bytes {
        settings.writer.capacity_bytes = capacity_bytes;
    }
    if let Some(chunk_bytes) = chunk_bytes {
        settings.writer.chunk_bytes = chunk_bytes;
    }
    if let Some(secs) = idle_threshold_secs {
        settings.idle_threshold = std::time::Duration::from_secs(secs);
    }
}

fn run_serve(
    listen: &str,
    downstream: &str,
    settings: Settings,
    shutdown: Arc<AtomicBool>,
) -> Result<(), beacon::BeaconError> {
    let listen_addr = listen
        .to_socket_addrs()
        .map_err(|source| beacon::BeaconError::Resolve { addr: listen.to_string(), source })?
        .next()
        .ok_or_else(|| beacon::BeaconError::Resolve {
            addr: listen.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
        })?;
    // Resolved up front so a bad downstream address fails fast rather than
    // surfacing only on each client's first reconnect attempt.
    downstream
        .to_socket_addrs()
        .map_err(|source| beacon::BeaconError::Resolve { addr: downstream.to_string(), source })?;

    proxy::run_serve(listen_addr, downstream.to_string(), settings, shutdown)
}

fn run_tap(
    downstream: &str,
    settings: Settings,
    shutdown: Arc<AtomicBool>,
) -> Result<(), beacon::BeaconError> {
    downstream
        .to_socket_addrs()
        .map_err(|source| beacon::BeaconError::Resolve { addr: downstream.to_string(), source })?;

    tap::run_tap(downstream.to_string(), settings, shutdown).map_err(beacon::BeaconError::Io)
}
