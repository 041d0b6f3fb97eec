use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level hostlink configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostlinkConfig {
    pub global: GlobalConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub host: HostConfig,
}

impl HostlinkConfig {
    /// Defaults for every section, for hosts that configure in code.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            global: GlobalConfig {
                instance_id: instance_id.into(),
                project_dir: default_project_dir(),
            },
            poller: PollerConfig::default(),
            capture: CaptureConfig::default(),
            sessions: SessionsConfig::default(),
            retention: RetentionConfig::default(),
            host: HostConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub instance_id: String,
    /// Project root. Relative paths resolve against the config file's
    /// directory.
    #[serde(default = "default_project_dir")]
    pub project_dir: String,
}

fn default_project_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_max_stack_frames")]
    pub max_stack_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            max_stack_frames: default_max_stack_frames(),
        }
    }
}

fn default_ring_capacity() -> usize {
    4096
}

fn default_max_stack_frames() -> usize {
    12
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsConfig {
    #[serde(default)]
    pub new_session_on_run_mode: bool,
    #[serde(default = "default_clear_check_interval", with = "humantime_serde")]
    pub clear_check_interval: Duration,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            new_session_on_run_mode: false,
            clear_check_interval: default_clear_check_interval(),
        }
    }
}

fn default_clear_check_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub keep: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep: default_retention(),
        }
    }
}

fn default_retention() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

/// How `hostlinkd` observes the host when it is not embedded in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_compile_start_marker")]
    pub compile_start_marker: String,
    #[serde(default = "default_compile_finish_marker")]
    pub compile_finish_marker: String,
    #[serde(default = "default_tail_interval", with = "humantime_serde")]
    pub tail_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            compile_start_marker: default_compile_start_marker(),
            compile_finish_marker: default_compile_finish_marker(),
            tail_interval: default_tail_interval(),
        }
    }
}

fn default_compile_start_marker() -> String {
    "Starting script compilation".into()
}

fn default_compile_finish_marker() -> String {
    "Finished script compilation".into()
}

fn default_tail_interval() -> Duration {
    Duration::from_millis(250)
}
