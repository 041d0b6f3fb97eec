//! Follows the host's log file and turns it into host events.
//!
//! The read offset is kept in the store's cursor table so a restarted daemon
//! resumes where it left off. A file that shrinks was truncated by the host;
//! `TailCounter` then reports a zero count once, which the console clear
//! heuristic turns into a new session.
//!
//! The last line read is held back until a poll finds nothing new, so stack
//! frames written by a later flush of the host still attach to it.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use hostlink_core::compilation::{Diagnostic, Severity, looks_like_diagnostic, parse_diagnostics};
use hostlink_core::config::HostConfig;
use hostlink_core::error::{HostlinkError, InfraError};
use hostlink_core::host::{ConsoleCounter, HostEvent};
use hostlink_core::log::{LogLevel, RawLogEvent};
use hostlink_runtime::HostRuntime;
use hostlink_store::CoordinationStore;

/// Context tag on entries read from the host log file.
pub const HOST_LOG_CONTEXT: &str = "host_log";

/// Lines read since the file was last truncated.
#[derive(Debug, Default)]
pub struct TailCounter {
    lines: AtomicU64,
    /// Set on truncation until the next read, which then sees zero.
    cleared: AtomicBool,
}

impl TailCounter {
    fn line_read(&self) {
        self.lines.fetch_add(1, Ordering::SeqCst);
    }

    fn truncated(&self) {
        self.lines.store(0, Ordering::SeqCst);
        self.cleared.store(true, Ordering::SeqCst);
    }
}

impl ConsoleCounter for TailCounter {
    fn visible_count(&self) -> u64 {
        if self.cleared.swap(false, Ordering::SeqCst) {
            return 0;
        }
        self.lines.load(Ordering::SeqCst)
    }
}

/// Splits host log lines into compile markers, diagnostics and log entries.
pub struct LineClassifier {
    start_marker: String,
    finish_marker: String,
    compiling: bool,
    compile_lines: Vec<String>,
    pending: Option<RawLogEvent>,
}

impl LineClassifier {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            start_marker: config.compile_start_marker.clone(),
            finish_marker: config.compile_finish_marker.clone(),
            compiling: false,
            compile_lines: Vec::new(),
            pending: None,
        }
    }

    pub fn feed(&mut self, line: &str, out: &mut Vec<HostEvent>) {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.contains(&self.start_marker) {
            self.flush(out);
            self.compiling = true;
            self.compile_lines.clear();
            out.push(HostEvent::CompileStarted);
            return;
        }
        if line.contains(&self.finish_marker) {
            self.flush(out);
            let diagnostics = parse_diagnostics(self.compile_lines.iter().map(String::as_str));
            self.compiling = false;
            self.compile_lines.clear();
            out.push(HostEvent::CompileFinished { diagnostics });
            return;
        }
        if self.compiling && looks_like_diagnostic(line) {
            self.compile_lines.push(line.to_string());
            return;
        }
        if let Some(pending) = self.pending.as_mut()
            && is_stack_frame(line)
        {
            let stack = pending.stack_trace.get_or_insert_with(String::new);
            if !stack.is_empty() {
                stack.push('\n');
            }
            stack.push_str(line.trim());
            return;
        }

        self.flush(out);
        if line.trim().is_empty() {
            return;
        }
        self.pending = Some(
            RawLogEvent::new(infer_level(line), line.trim()).with_context(HOST_LOG_CONTEXT),
        );
    }

    pub fn flush(&mut self, out: &mut Vec<HostEvent>) {
        if let Some(event) = self.pending.take() {
            out.push(HostEvent::LogEmitted(event));
        }
    }

    pub fn is_compiling(&self) -> bool {
        self.compiling
    }
}

fn is_stack_frame(line: &str) -> bool {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    let frame = FRAME.get_or_init(|| {
        Regex::new(r"^\s*(?:at\s|[\w.<>`+\[\]]+:[\w.<>`+\[\]]+\s?\()").expect("static frame regex")
    });
    line.contains("(at ") || frame.is_match(line)
}

fn infer_level(line: &str) -> LogLevel {
    if let Some(diagnostic) = Diagnostic::parse(line) {
        return match diagnostic.severity {
            Severity::Error => LogLevel::Error,
            Severity::Warning => LogLevel::Warning,
        };
    }
    let trimmed = line.trim_start();
    let head = trimmed.split(':').next().unwrap_or_default();
    if head.ends_with("Exception") && !head.contains(' ') {
        LogLevel::Exception
    } else if trimmed.starts_with("Assertion failed") {
        LogLevel::Assert
    } else if head.eq_ignore_ascii_case("error") {
        LogLevel::Error
    } else if head.eq_ignore_ascii_case("warning") {
        LogLevel::Warning
    } else {
        LogLevel::Info
    }
}

pub struct LogTailer {
    path: PathBuf,
    store: CoordinationStore,
    cursor_key: String,
    offset: u64,
    partial: Vec<u8>,
    classifier: LineClassifier,
    counter: Arc<TailCounter>,
}

fn io_err(err: std::io::Error) -> HostlinkError {
    HostlinkError::Infra(InfraError::Io(err))
}

impl LogTailer {
    /// Resume from the stored cursor, or from the start of the file.
    pub async fn open(
        path: PathBuf,
        store: CoordinationStore,
        config: &HostConfig,
    ) -> Result<Self, HostlinkError> {
        let cursor_key = format!("tail:{}", path.display());
        let offset = store
            .get_cursor(&cursor_key)
            .await?
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        debug!(path = %path.display(), offset, "log_tail_opened");
        Ok(Self {
            path,
            store,
            cursor_key,
            offset,
            partial: Vec::new(),
            classifier: LineClassifier::new(config),
            counter: Arc::new(TailCounter::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counter(&self) -> Arc<TailCounter> {
        Arc::clone(&self.counter)
    }

    /// Read whatever was appended since the last call. A poll that finds
    /// nothing new releases the held-back line.
    pub async fn poll_once(&mut self) -> Result<Vec<HostEvent>, HostlinkError> {
        let mut events = Vec::new();
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.classifier.flush(&mut events);
                return Ok(events);
            }
            Err(err) => return Err(io_err(err)),
        };
        let committed = self.offset - self.partial.len() as u64;
        if len < committed {
            info!(path = %self.path.display(), previous = committed, len, "host_log_truncated");
            self.offset = 0;
            self.partial.clear();
            self.classifier.flush(&mut events);
            self.counter.truncated();
        }
        if len == self.offset {
            self.classifier.flush(&mut events);
            return Ok(events);
        }

        let mut file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(self.offset)).await.map_err(io_err)?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await.map_err(io_err)?;
        self.offset += chunk.len() as u64;

        let mut buffer = std::mem::take(&mut self.partial);
        buffer.extend_from_slice(&chunk);
        let mut start = 0;
        while let Some(newline) = buffer[start..].iter().position(|byte| *byte == b'\n') {
            let line = String::from_utf8_lossy(&buffer[start..start + newline]);
            self.classifier.feed(&line, &mut events);
            self.counter.line_read();
            start += newline + 1;
        }
        self.partial = buffer[start..].to_vec();

        let committed = self.offset - self.partial.len() as u64;
        self.store
            .set_cursor(&self.cursor_key, &committed.to_string())
            .await?;
        Ok(events)
    }

    /// Follow the file until shutdown, feeding events to the runtime.
    /// Filesystem notifications wake the loop early; the interval covers
    /// platforms where they are unavailable.
    pub async fn run(
        mut self,
        runtime: Arc<HostRuntime>,
        mut shutdown: watch::Receiver<bool>,
        every: Duration,
    ) {
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();
        let _watcher = match watch_file(&self.path, wake_tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "log_watch_unavailable");
                None
            }
        };
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(path = %self.path.display(), "log_tail_started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
                Some(()) = wake_rx.recv() => {}
            }
            match self.poll_once().await {
                Ok(events) => deliver(&runtime, events).await,
                Err(err) => warn!(path = %self.path.display(), error = %err, "log_tail_failed"),
            }
        }

        let mut held = Vec::new();
        self.classifier.flush(&mut held);
        deliver(&runtime, held).await;
        info!(path = %self.path.display(), "log_tail_stopped");
    }
}

async fn deliver(runtime: &HostRuntime, events: Vec<HostEvent>) {
    for event in events {
        let name = event.name();
        if let Err(err) = runtime.handle_event(event).await {
            warn!(event = name, error = %err, "host_event_failed");
        }
    }
}

/// Watch the file's directory so a file recreated by the host is noticed.
fn watch_file(path: &Path, wake: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
    let file_name = path.file_name().map(|name| name.to_os_string());
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else {
            return;
        };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        let ours = event
            .paths
            .iter()
            .any(|changed| changed.file_name().map(|name| name.to_os_string()) == file_name);
        if ours {
            let _ = wake.send(());
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
