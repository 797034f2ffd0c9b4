//! `mbot-bridge` – the MBot LCM ↔ WebSocket bridge daemon.
//!
//! 1. Loads the TOML settings file (defaults when it is missing) and applies
//!    `MBOT_BRIDGE_*` environment overrides.
//! 2. Opens the LCM multicast bus and binds the configured topics.
//! 3. Serves WebSocket clients until SIGINT or SIGTERM, then closes every
//!    client, stops the bus loop and exits.
//!
//! ```bash
//! mbot-bridge --config /etc/mbot/bridge.toml --port 5005
//! MBOT_LOG_FORMAT=json RUST_LOG=mbot_middleware=debug mbot-bridge
//! ```

mod config;
mod telemetry;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use mbot_lcm::{TypeDirectory, TypeResolver};
use mbot_middleware::{spawn_bridge, Bridge, BusListener, UdpmBus};
use mbot_server::BridgeServer;
use mbot_types::BridgeError;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;

use crate::config::Settings;

/// MBot LCM ↔ WebSocket bridge
#[derive(Parser, Debug)]
#[command(name = "mbot-bridge")]
#[command(about = "Relays MBot LCM bus traffic to WebSocket clients and back")]
#[command(version)]
struct Args {
    /// Settings file path
    #[arg(short, long, default_value = "/etc/mbot/bridge.toml")]
    config: PathBuf,

    /// WebSocket port (overrides the settings file)
    #[arg(short, long)]
    port: Option<u16>,

    /// File holding the robot's hostname
    #[arg(long, default_value = "/etc/hostname")]
    hostname_file: PathBuf,

    /// Base log level (off, error, warn, info, debug, trace); RUST_LOG directives refine it
    #[arg(long, default_value = "info", value_parser = telemetry::parse_level)]
    log: LevelFilter,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = telemetry::init_tracing("mbot-bridge", args.log);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => {
            info!("MBot Bridge exited cleanly.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "MBot Bridge failed");
            ExitCode::FAILURE
        }
    }
}

fn load_settings(args: &Args) -> Result<Settings, BridgeError> {
    let mut settings = match config::load_from(&args.config)? {
        Some(settings) => {
            info!(path = %args.config.display(), "settings loaded");
            settings
        }
        None => {
            warn!(path = %args.config.display(), "settings file not found, using defaults");
            Settings::default()
        }
    };
    config::apply_env_overrides(&mut settings);
    if let Some(port) = args.port {
        settings.port = port;
    }
    settings.bridge.validate()?;
    Ok(settings)
}

async fn run(args: Args) -> Result<(), BridgeError> {
    let settings = load_settings(&args)?;
    let hostname = config::read_hostname(&args.hostname_file).unwrap_or_else(|e| {
        warn!(path = %args.hostname_file.display(), error = %e, "hostname file unreadable, using empty hostname");
        String::new()
    });

    let resolver = Arc::new(TypeResolver::new(
        Arc::new(TypeDirectory::builtin()?),
        &settings.bridge.lcm_type_modules,
    ));
    let bus = Arc::new(UdpmBus::open(&settings.bridge.lcm_address)?);
    let bridge = Bridge::new(&settings.bridge, resolver, bus.clone(), hostname)?;
    let (handle, bridge_task) = spawn_bridge(bridge);

    let server = match BridgeServer::new(handle.clone())
        .with_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .with_port(settings.port)
        .bind()
        .await
    {
        Ok(server) => server,
        Err(e) => {
            handle.shutdown().await;
            let _ = bridge_task.await;
            return Err(e);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let listener = BusListener::new(
        bus,
        handle.clone(),
        Arc::clone(&running),
        Duration::from_millis(settings.bridge.lcm_timeout_ms),
    )
    .spawn()
    .map_err(|e| BridgeError::Transport(format!("failed to start the bus thread: {e}")))?;

    // ── Signal handling ───────────────────────────────────────────────────
    let (stop, shutdown) = watch::channel(false);
    let running_for_signal = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("termination signal received, shutting down");
        running_for_signal.store(false, Ordering::Release);
        stop.send_replace(true);
    }) {
        warn!(error = %e, "failed to install the signal handler; shutdown on SIGINT/SIGTERM is unavailable");
    }

    let served = server.serve(shutdown).await;

    handle.shutdown().await;
    let _ = bridge_task.await;
    running.store(false, Ordering::Release);
    if !matches!(tokio::task::spawn_blocking(move || listener.join()).await, Ok(Ok(()))) {
        warn!("bus thread did not stop cleanly");
    }
    served
}
