mod config;
mod handlers;
mod shutdown;
mod tail;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hostlink_core::host::HostEvent;
use hostlink_core::session::SessionStartReason;
use hostlink_runtime::{CaptureSlot, HostRuntime, MainContext};
use hostlink_store::{CoordinationStore, SideChannel};

/// hostlink daemon: runs the host side of the coordination engine next to
/// a host that only exposes a log file.
#[derive(Parser, Debug)]
#[command(name = "hostlinkd", version, about)]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "hostlink.toml")]
    config: PathBuf,

    /// Increase log verbosity (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Load and validate config
    // -----------------------------------------------------------------------
    let config = config::load_config(&cli.config)?;
    config::validate_config(&config)?;

    if cli.validate {
        println!("config is valid");
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 2. Initialize tracing
    // -----------------------------------------------------------------------
    let capture_slot = CaptureSlot::new();
    telemetry::init_telemetry(cli.verbose, capture_slot.clone())?;

    info!(
        instance_id = %config.global.instance_id,
        "hostlinkd starting"
    );

    // -----------------------------------------------------------------------
    // 3. Open the store and apply retention
    // -----------------------------------------------------------------------
    let layout = config::project_layout(&config, &cli.config)?;
    let store = CoordinationStore::open(&layout.database_path())
        .await
        .with_context(|| format!("opening {}", layout.database_path().display()))?;
    let keep = chrono::Duration::from_std(config.retention.keep).context("retention.keep")?;
    match store.prune(Utc::now() - keep).await {
        Ok(report) => info!(
            requests = report.requests,
            sessions = report.sessions,
            logs = report.logs,
            "retention_applied"
        ),
        Err(err) => warn!(error = %err, "retention_failed"),
    }

    // -----------------------------------------------------------------------
    // 4. Build the runtime
    // -----------------------------------------------------------------------
    let log_file = config::host_log_file(&config, &cli.config)?;
    let tailer = match log_file {
        Some(path) => Some(tail::LogTailer::open(path, store.clone(), &config.host).await?),
        None => None,
    };

    let context = MainContext::new();
    let mut builder = HostRuntime::builder(
        config.clone(),
        store.clone(),
        Arc::new(SideChannel::new(layout.side_channel_path())),
        context.handle(),
    )
    .handlers(handlers::registry())
    .capture_slot(capture_slot);
    if let Some(tailer) = &tailer {
        builder = builder.console_counter(tailer.counter());
    }
    let runtime = Arc::new(builder.build());
    runtime
        .start(SessionStartReason::HostStart)
        .await
        .context("starting host runtime")?;

    // -----------------------------------------------------------------------
    // 5. Spawn signal handler, reload handler and log tailer
    // -----------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, mut reload_rx) = watch::channel(());

    tokio::spawn(async move {
        if let Err(err) = shutdown::signal_listener(shutdown_tx, reload_tx).await {
            error!(error = %err, "signal_listener_failed");
        }
    });

    let reload_runtime = Arc::clone(&runtime);
    tokio::spawn(async move {
        while reload_rx.changed().await.is_ok() {
            if let Err(err) = reload_runtime.suspend() {
                warn!(error = %err, "suspend_before_reload_failed");
            }
            if let Err(err) = reload_runtime.handle_event(HostEvent::Reloaded).await {
                error!(error = %err, "host_reload_failed");
            }
        }
    });

    let tail_handle = tailer.map(|tailer| {
        let every = config.host.tail_interval;
        tokio::spawn(tailer.run(Arc::clone(&runtime), shutdown_rx.clone(), every))
    });

    // -----------------------------------------------------------------------
    // 6. Run the main context until shutdown
    // -----------------------------------------------------------------------
    info!("entering main loop");
    context.run(shutdown_rx).await;

    // -----------------------------------------------------------------------
    // 7. Graceful shutdown
    // -----------------------------------------------------------------------
    if let Some(handle) = tail_handle {
        info!("graceful shutdown: stopping log tail");
        let _ = handle.await;
    }
    info!("graceful shutdown: stopping runtime");
    runtime.shutdown().await;
    store.close().await;

    info!("hostlinkd stopped");
    Ok(())
}
