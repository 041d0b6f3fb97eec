use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SessionId = uuid::Uuid;

/// A continuous stretch of console history. `end_time` is `None` while the
/// session is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub start_reason: SessionStartReason,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// True when the two sessions share any instant beyond a shared boundary.
    pub fn overlaps(&self, other: &Session) -> bool {
        let self_end = self.end_time.unwrap_or(DateTime::<Utc>::MAX_UTC);
        let other_end = other.end_time.unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.start_time < other_end && other.start_time < self_end
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStartReason {
    HostStart,
    Reload,
    CleanCompile,
    ManualClear,
    RunModeEntered,
    ExternalClear,
}

impl SessionStartReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HostStart => "host_start",
            Self::Reload => "reload",
            Self::CleanCompile => "clean_compile",
            Self::ManualClear => "manual_clear",
            Self::RunModeEntered => "run_mode_entered",
            Self::ExternalClear => "external_clear",
        }
    }
}

impl fmt::Display for SessionStartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SessionStartReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host_start" => Ok(Self::HostStart),
            "reload" => Ok(Self::Reload),
            "clean_compile" => Ok(Self::CleanCompile),
            "manual_clear" => Ok(Self::ManualClear),
            "run_mode_entered" => Ok(Self::RunModeEntered),
            "external_clear" => Ok(Self::ExternalClear),
            other => Err(format!("unknown session start reason '{other}'")),
        }
    }
}

/// Per-level counts for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Option<SessionId>,
    pub total: u64,
    pub info: u64,
    pub warning: u64,
    pub error: u64,
    pub exception: u64,
    pub assert: u64,
    pub first_log: Option<DateTime<Utc>>,
    pub last_log: Option<DateTime<Utc>>,
}
