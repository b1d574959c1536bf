//! hv_daq entry point
//!
//! Starts the bench on simulated instruments, connects every configured binding and
//! serves the HTTP control surface and, with `--console`, the stdin console until
//! Ctrl-C.
//!
//! ```bash
//! hv_daq --config config/hv_daq.toml --bind 0.0.0.0:8000 --log-level debug
//! hv_daq --no-server --console
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use clap::Parser;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use hv_daq::config::store::SettingsStore;
use hv_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use hv_daq::instrument::mock::SimulatedBench;
use hv_daq::{console, logging, AppResult, HvApp};

#[derive(Parser)]
#[command(name = "hv_daq")]
#[command(about = "High-voltage ramp and current-stabilization test bench", long_about = None)]
struct Cli {
    /// Configuration file (TOML); parameter changes are saved back to it
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides server.bind
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error), overrides application.log_level
    #[arg(long)]
    log_level: Option<String>,

    /// Do not serve the HTTP control surface
    #[arg(long)]
    no_server: bool,

    /// Read operator commands from stdin
    #[arg(long)]
    console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let stored = Settings::load(Some(&path))?;
    let mut settings = stored.clone();
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
    }
    if let Some(bind) = cli.bind {
        settings.server.bind = bind;
    }
    if cli.no_server {
        settings.server.enabled = false;
    }
    settings.validate()?;
    logging::init_from_settings(&settings)?;
    info!(config = %path.display(), "Starting {}", settings.application.name);

    let bench = SimulatedBench::new();
    let app = HvApp::start(SettingsStore::persistent(stored, &path), bench.instruments()).await?;
    for outcome in app.connect_all().await {
        if let Some(err) = outcome.error {
            warn!(slot = %outcome.slot, error = %err, "Instrument not connected");
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut server = spawn_server(&app, &settings, stop_rx);
    let mut console = cli.console.then(|| {
        tokio::spawn(console::run(
            Arc::clone(&app),
            BufReader::new(tokio::io::stdin()),
        ))
    });

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Interrupt received"),
            Err(err) => error!(error = %err, "Could not listen for Ctrl-C"),
        },
        result = finished(&mut server) => report("HTTP server", result),
        _ = finished(&mut console) => info!("Console closed"),
    }

    stop_tx.send_replace(true);
    if let Some(server) = server {
        report("HTTP server", Some(server.await));
    }
    app.shutdown().await;
    Ok(())
}

#[cfg(feature = "networking")]
fn spawn_server(
    app: &Arc<HvApp>,
    settings: &Settings,
    mut stop: watch::Receiver<bool>,
) -> Option<JoinHandle<AppResult<()>>> {
    if !settings.server.enabled {
        return None;
    }
    let shutdown = async move {
        let _ = stop.wait_for(|stop| *stop).await;
    };
    Some(tokio::spawn(hv_daq::api::serve(
        Arc::clone(app),
        settings.server.bind,
        shutdown,
    )))
}

#[cfg(not(feature = "networking"))]
fn spawn_server(
    _app: &Arc<HvApp>,
    settings: &Settings,
    _stop: watch::Receiver<bool>,
) -> Option<JoinHandle<AppResult<()>>> {
    if settings.server.enabled {
        warn!("Built without the networking feature; HTTP control surface disabled");
    }
    None
}

/// Resolves when the task finishes; never resolves for an absent task.
fn finished<T>(
    task: &mut Option<JoinHandle<T>>,
) -> impl Future<Output = Option<Result<T, JoinError>>> + '_ {
    async move {
        match task.as_mut() {
            Some(handle) => {
                let result = handle.await;
                *task = None;
                Some(result)
            }
            None => std::future::pending().await,
        }
    }
}

fn report(what: &str, result: Option<Result<AppResult<()>, JoinError>>) {
    match result {
        Some(Ok(Ok(()))) | None => info!("{} stopped", what),
        Some(Ok(Err(err))) => error!(error = %err, "{} failed", what),
        Some(Err(err)) => error!(error = %err, "{} task failed", what),
    }
}
