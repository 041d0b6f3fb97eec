use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::request::RequestId;
use crate::session::SessionId;

/// Context tag carried by entries produced from compiler diagnostics.
pub const COMPILER_CONTEXT: &str = "compiler";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Exception,
    Assert,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Exception,
        Self::Assert,
    ];

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Error | Self::Exception | Self::Assert)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Exception => "Exception",
            Self::Assert => "Assert",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "log" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "exception" => Ok(Self::Exception),
            "assert" => Ok(Self::Assert),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// One log line as the host emitted it, before capture assigns a session and
/// sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawLogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub stack_trace: Option<String>,
    pub context: Option<String>,
}

impl RawLogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            stack_trace: None,
            context: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub session_id: SessionId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub stack_trace: Option<String>,
    pub truncated_stack: Option<String>,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
    pub context: Option<String>,
    pub request_id: Option<RequestId>,
}

impl LogEntry {
    pub fn is_critical(&self) -> bool {
        self.level.is_critical() || self.context.as_deref() == Some(COMPILER_CONTEXT)
    }
}

/// Filter for reading stored log entries. Results come back oldest first;
/// `limit` keeps the newest N.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogQuery {
    pub session_id: Option<SessionId>,
    pub levels: Vec<LogLevel>,
    pub critical_only: bool,
    pub request_id: Option<RequestId>,
    pub limit: Option<u32>,
}

impl LogQuery {
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical_only = true;
        self
    }

    pub fn with_levels(mut self, levels: Vec<LogLevel>) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Keep the first `max_frames` non-empty frames of a stack trace. Returns
/// `None` when the trace already fits.
pub fn truncate_stack(stack_trace: &str, max_frames: usize) -> Option<String> {
    let frames: Vec<&str> = stack_trace
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    if frames.len() <= max_frames {
        return None;
    }
    let mut kept = frames[..max_frames].join("\n");
    kept.push_str(&format!("\n... ({} more frames)", frames.len() - max_frames));
    Some(kept)
}

/// First `(at path:line)` frame of a stack trace.
pub fn extract_source_location(stack_trace: &str) -> Option<(String, u32)> {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    let frame = FRAME.get_or_init(|| {
        Regex::new(r"\(at (?P<path>[^():]+(?::[^():0-9][^():]*)?):(?P<line>\d+)\)")
            .expect("static frame regex")
    });
    let captures = frame.captures(stack_trace)?;
    let line = captures["line"].parse().ok()?;
    Some((captures["path"].to_string(), line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_levels() {
        assert!(!LogLevel::Info.is_critical());
        assert!(!LogLevel::Warning.is_critical());
        assert!(LogLevel::Error.is_critical());
        assert!(LogLevel::Exception.is_critical());
        assert!(LogLevel::Assert.is_critical());
    }

    #[test]
    fn level_parsing_accepts_aliases() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("Exception".parse::<LogLevel>(), Ok(LogLevel::Exception));
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn truncate_keeps_head_frames() {
        let stack = (1..=5)
            .map(|n| format!("Frame{n} (at Assets/F.cs:{n})"))
            .collect::<Vec<_>>()
            .join("\n");
        let truncated = truncate_stack(&stack, 2).expect("truncated");
        assert_eq!(
            truncated,
            "Frame1 (at Assets/F.cs:1)\nFrame2 (at Assets/F.cs:2)\n... (3 more frames)"
        );
        assert!(truncate_stack(&stack, 5).is_none());
    }

    #[test]
    fn source_location_from_first_frame() {
        let stack = "Player.Update () (at Assets/Scripts/Player.cs:45)\n\
                     UnityEngine.Debug:Log (at Assets/Other.cs:3)";
        assert_eq!(
            extract_source_location(stack),
            Some(("Assets/Scripts/Player.cs".to_string(), 45))
        );
        assert_eq!(extract_source_location("no frames here"), None);
    }

    #[test]
    fn source_location_handles_windows_drive() {
        let stack = "Foo () (at C:/Work/Game/Assets/Foo.cs:12)";
        assert_eq!(
            extract_source_location(stack),
            Some(("C:/Work/Game/Assets/Foo.cs".to_string(), 12))
        );
    }
}
