use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use hostlink_core::config::HostlinkConfig;
use hostlink_core::layout::{ProjectLayout, resolve_path};

/// Load and deserialize config from a TOML file.
pub fn load_config(path: &Path) -> Result<HostlinkConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config: HostlinkConfig =
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
    Ok(config)
}

/// Validate config for internal consistency:
/// - instance id is set
/// - every interval is non-zero
/// - the ring buffer can hold at least one entry
pub fn validate_config(config: &HostlinkConfig) -> Result<()> {
    if config.global.instance_id.trim().is_empty() {
        anyhow::bail!("global.instance_id must not be empty");
    }

    for (name, value) in [
        ("poller.interval", config.poller.interval),
        ("sessions.clear_check_interval", config.sessions.clear_check_interval),
        ("host.tail_interval", config.host.tail_interval),
    ] {
        if value.is_zero() {
            anyhow::bail!("{name} must be greater than zero");
        }
    }

    if config.capture.ring_capacity == 0 {
        anyhow::bail!("capture.ring_capacity must be greater than zero");
    }

    if config.host.compile_start_marker.trim().is_empty()
        || config.host.compile_finish_marker.trim().is_empty()
    {
        anyhow::bail!("host compile markers must not be empty");
    }

    info!("config validation passed");
    Ok(())
}

/// Project layout for a config file. `project_dir` resolves against the
/// directory holding the config file.
pub fn project_layout(config: &HostlinkConfig, config_path: &Path) -> Result<ProjectLayout> {
    let base_dir = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let root = resolve_path(&config.global.project_dir, &base_dir, home.as_deref())
        .with_context(|| format!("resolving project_dir '{}'", config.global.project_dir))?;
    Ok(ProjectLayout::new(root))
}

/// Host log file to tail, resolved the same way as `project_dir`.
pub fn host_log_file(config: &HostlinkConfig, config_path: &Path) -> Result<Option<PathBuf>> {
    let Some(raw) = config.host.log_file.as_ref() else {
        return Ok(None);
    };
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let path = resolve_path(&raw.to_string_lossy(), base_dir, home.as_deref())
        .with_context(|| format!("resolving host.log_file '{}'", raw.display()))?;
    Ok(Some(path))
}
