use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

/// Listen for OS signals and dispatch to the appropriate channel.
///
/// - SIGTERM / SIGINT -> sends on `shutdown_tx`
/// - SIGHUP -> sends on `reload_tx`, which the daemon treats as a host reload
///
/// This task runs until a shutdown signal is received.
pub async fn signal_listener(
    shutdown_tx: watch::Sender<bool>,
    reload_tx: watch::Sender<()>,
) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
                let _ = shutdown_tx.send(true);
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
                let _ = shutdown_tx.send(true);
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading host");
                let _ = reload_tx.send(());
            }
        }
    }
}
