use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hostlink_runtime::{CaptureLayer, CaptureSlot};

/// Initialize the tracing subscriber.
///
/// - Always installs a JSON-formatted stdout layer.
/// - Adds a capture layer so the daemon's own warnings and errors land in
///   the active session once the runtime attaches to `slot`.
/// - Respects `verbose` flag for log level (debug vs info).
pub fn init_telemetry(verbose: bool, slot: CaptureSlot) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let json_layer = tracing_subscriber::fmt::layer().json().flatten_event(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(CaptureLayer::new(slot))
        .try_init()?;
    Ok(())
}
