use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Code attached to the `Compilation failed: ...` summary line.
pub const COMPILATION_FAILED_CODE: &str = "COMPILATION_FAILED";

/// Process-wide compilation state, driven by compile start/finish events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilationState {
    pub is_compiling: bool,
    pub error_count: u32,
    pub warning_count: u32,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
}

impl CompilationState {
    pub fn start(&mut self, at: DateTime<Utc>) {
        self.is_compiling = true;
        self.last_started = Some(at);
    }

    /// Close the compile window and count what it produced. The summary
    /// line, when present, is authoritative over per-line counts.
    pub fn finish(&mut self, at: DateTime<Utc>, diagnostics: &[Diagnostic]) {
        self.is_compiling = false;
        self.last_finished = Some(at);

        let summary = diagnostics
            .iter()
            .find_map(|diag| parse_summary(&diag.message));
        let (errors, warnings) = match summary {
            Some(counts) => counts,
            None => diagnostics.iter().fold((0, 0), |(e, w), diag| match diag.severity {
                Severity::Error => (e + 1, w),
                Severity::Warning => (e, w + 1),
            }),
        };
        self.error_count = errors;
        self.warning_count = warnings;
    }

    pub fn is_clean(&self) -> bool {
        !self.is_compiling && self.error_count == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    fn from_label(label: &str) -> Self {
        if label == "warning" {
            Self::Warning
        } else {
            Self::Error
        }
    }
}

/// One compiler diagnostic, parsed out of whatever format the toolchain used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: None,
            file: None,
            line: None,
            column: None,
            message: message.into(),
        }
    }

    /// Canonical single-line form: `path(line,col): severity CODE: message`.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Parse one line. Continuation lines return `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let patterns = patterns();

        if let Some(caps) = patterns.csharp.captures(line) {
            return Some(Self {
                severity: Severity::from_label(&caps["sev"]),
                code: Some(caps["code"].to_string()),
                file: Some(caps["path"].to_string()),
                line: caps["line"].parse().ok(),
                column: caps.name("col").and_then(|col| col.as_str().parse().ok()),
                message: caps["msg"].to_string(),
            });
        }

        if let Some(caps) = patterns.gcc.captures(line) {
            return Some(Self {
                severity: Severity::from_label(&caps["sev"]),
                code: None,
                file: Some(caps["path"].to_string()),
                line: caps["line"].parse().ok(),
                column: caps["col"].parse().ok(),
                message: caps["msg"].to_string(),
            });
        }

        if let Some(caps) = patterns.generic.captures(line) {
            return Some(Self {
                severity: Severity::from_label(&caps["sev"]),
                code: None,
                file: Some(caps["path"].to_string()),
                line: None,
                column: None,
                message: caps["msg"].to_string(),
            });
        }

        if line.contains("Compilation failed:") {
            return Some(Self {
                code: Some(COMPILATION_FAILED_CODE.to_string()),
                ..Self::error(line)
            });
        }

        None
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            f.write_str(file)?;
            match (self.line, self.column) {
                (Some(line), Some(col)) => write!(f, "({line},{col})")?,
                (Some(line), None) => write!(f, "({line})")?,
                _ => {}
            }
            f.write_str(": ")?;
        }
        f.write_str(self.severity.label())?;
        if let Some(code) = &self.code {
            write!(f, " {code}")?;
        }
        write!(f, ": {}", self.message)
    }
}

struct Patterns {
    csharp: Regex,
    gcc: Regex,
    generic: Regex,
    summary: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        csharp: Regex::new(
            r"^(?P<path>.+?)\((?P<line>\d+)(?:,(?P<col>\d+))?\): (?P<sev>error|warning) (?P<code>[A-Z]+\d+): (?P<msg>.+)$",
        )
        .expect("static csharp regex"),
        gcc: Regex::new(
            r"^(?P<path>.+?):(?P<line>\d+):(?P<col>\d+): (?P<sev>error|warning): (?P<msg>.+)$",
        )
        .expect("static gcc regex"),
        generic: Regex::new(r"^(?P<path>.+?): (?P<sev>error|warning): (?P<msg>.+)$")
            .expect("static generic regex"),
        summary: Regex::new(r"Compilation failed: (?P<errors>\d+) error\(s\), (?P<warnings>\d+) warning\(s\)")
            .expect("static summary regex"),
    })
}

/// `(errors, warnings)` from a `Compilation failed: N error(s), M warning(s)`
/// line.
pub fn parse_summary(line: &str) -> Option<(u32, u32)> {
    let caps = patterns().summary.captures(line)?;
    Some((caps["errors"].parse().ok()?, caps["warnings"].parse().ok()?))
}

/// Parse a block of compiler output. Non-empty lines that do not start a new
/// diagnostic are appended to the previous one's message, space separated so
/// the canonical form stays on one line.
pub fn parse_diagnostics<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    for line in lines {
        if let Some(diag) = Diagnostic::parse(line) {
            diagnostics.push(diag);
        } else if let Some(last) = diagnostics.last_mut()
            && !line.trim().is_empty()
        {
            last.message.push(' ');
            last.message.push_str(line.trim());
        }
    }
    diagnostics
}

/// Quick check used by log tailers before running the full parser.
pub fn looks_like_diagnostic(line: &str) -> bool {
    const INDICATORS: [&str; 5] = [
        ": error ",
        ": warning ",
        ": error:",
        ": warning:",
        "Compilation failed:",
    ];
    INDICATORS.iter().any(|indicator| line.contains(indicator))
}
