use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compilation::{CompilationState, Diagnostic};
use crate::log::RawLogEvent;
use crate::session::SessionId;

/// Lifecycle hooks and log emissions delivered by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    CompileStarted,
    CompileFinished { diagnostics: Vec<Diagnostic> },
    LogEmitted(RawLogEvent),
    RunModeChanged { entered: bool },
    ConsoleCleared,
    Reloaded,
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CompileStarted => "compile_started",
            Self::CompileFinished { .. } => "compile_finished",
            Self::LogEmitted(_) => "log_emitted",
            Self::RunModeChanged { .. } => "run_mode_changed",
            Self::ConsoleCleared => "console_cleared",
            Self::Reloaded => "reloaded",
        }
    }
}

/// Host state the driver reads to tell a blackout apart from a stalled host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostStatus {
    pub instance_id: String,
    pub compilation: CompilationState,
    pub in_run_mode: bool,
    pub active_session: Option<SessionId>,
    pub heartbeat: DateTime<Utc>,
}

impl HostStatus {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            compilation: CompilationState::default(),
            in_run_mode: false,
            active_session: None,
            heartbeat: Utc::now(),
        }
    }
}

/// Visible console entry count, when the host exposes one. Used to notice
/// clears that bypass the host's own hooks.
pub trait ConsoleCounter: Send + Sync {
    fn visible_count(&self) -> u64;
}
