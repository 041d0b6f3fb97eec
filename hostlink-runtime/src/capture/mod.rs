//! Log capture: sequencing, buffering and draining host log output.
//!
//! `record` is synchronous and safe to call from any thread, including from
//! inside a `tracing` subscriber. Entries wait in a bounded ring buffer until
//! `drain` writes them to the store outside a blackout. Critical entries are
//! also written to the side-channel immediately so they survive a crash,
//! a reload or eviction from a full ring; `drain` merges the side-channel
//! with the ring so those reach the store too.

pub mod fallback;
pub mod layer;
pub mod ring;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use hostlink_core::compilation::{Diagnostic, Severity};
use hostlink_core::config::CaptureConfig;
use hostlink_core::error::HostlinkError;
use hostlink_core::log::{
    COMPILER_CONTEXT, LogEntry, LogLevel, RawLogEvent, extract_source_location, truncate_stack,
};
use hostlink_core::request::RequestId;
use hostlink_core::session::SessionId;
use hostlink_store::{CoordinationStore, SideChannel};

use crate::compilation::{Blackout, CompilationTracker};

pub use layer::{CaptureLayer, CaptureSlot};
pub use ring::RingBuffer;

pub struct LogCapture {
    state: Mutex<CaptureState>,
    store: CoordinationStore,
    side_channel: Arc<SideChannel>,
    tracker: Arc<CompilationTracker>,
    max_stack_frames: usize,
    drain_lock: tokio::sync::Mutex<()>,
}

struct CaptureState {
    session: Option<SessionId>,
    next_sequence: u64,
    ring: RingBuffer<LogEntry>,
    /// Emissions seen before any session existed; replayed into the first.
    unsequenced: Vec<RawLogEvent>,
    running_request: Option<RequestId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub written: u64,
    pub remaining: usize,
    pub dropped: u64,
    pub skipped: Option<Blackout>,
}

impl LogCapture {
    pub fn new(
        config: &CaptureConfig,
        store: CoordinationStore,
        side_channel: Arc<SideChannel>,
        tracker: Arc<CompilationTracker>,
    ) -> Self {
        Self {
            state: Mutex::new(CaptureState {
                session: None,
                next_sequence: 1,
                ring: RingBuffer::new(config.ring_capacity),
                unsequenced: Vec::new(),
                running_request: None,
            }),
            store,
            side_channel,
            tracker,
            max_stack_frames: config.max_stack_frames,
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switch to a new session. Sequences restart at 1.
    pub fn begin_session(&self, session: SessionId) {
        let mut state = self.lock();
        state.session = Some(session);
        state.next_sequence = 1;
        let pending = std::mem::take(&mut state.unsequenced);
        for raw in pending {
            self.record_locked(&mut state, raw);
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.lock().session
    }

    pub fn set_running_request(&self, request: Option<RequestId>) {
        self.lock().running_request = request;
    }

    /// Sequence, tag and buffer one emission. Returns the buffered entry, or
    /// `None` when no session has started yet.
    pub fn record(&self, raw: RawLogEvent) -> Option<LogEntry> {
        let mut state = self.lock();
        if state.session.is_none() {
            let capacity = state.ring.capacity();
            if state.unsequenced.len() >= capacity {
                state.unsequenced.remove(0);
            }
            state.unsequenced.push(raw);
            return None;
        }
        self.record_locked(&mut state, raw)
    }

    /// Record a compiler diagnostic in canonical form. Always critical.
    pub fn record_diagnostic(&self, diagnostic: &Diagnostic) -> Option<LogEntry> {
        let level = match diagnostic.severity {
            Severity::Error => LogLevel::Error,
            Severity::Warning => LogLevel::Warning,
        };
        self.record(RawLogEvent::new(level, diagnostic.canonical()).with_context(COMPILER_CONTEXT))
    }

    fn record_locked(&self, state: &mut CaptureState, raw: RawLogEvent) -> Option<LogEntry> {
        let session_id = state.session?;
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let (source_file, source_line) = raw
            .stack_trace
            .as_deref()
            .and_then(extract_source_location)
            .map_or((None, None), |(file, line)| (Some(file), Some(line)));
        let truncated_stack = raw
            .stack_trace
            .as_deref()
            .and_then(|stack| truncate_stack(stack, self.max_stack_frames));

        let entry = LogEntry {
            session_id,
            sequence,
            timestamp: raw.timestamp,
            level: raw.level,
            message: raw.message,
            stack_trace: raw.stack_trace,
            truncated_stack,
            source_file,
            source_line,
            context: raw.context,
            request_id: state.running_request,
        };

        if entry.is_critical()
            && let Err(err) = self.side_channel.put(&entry)
        {
            fallback::report("side_channel_put", &err);
        }
        state.ring.push(entry.clone());
        Some(entry)
    }

    pub fn buffered(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn buffered_entries(&self) -> Vec<LogEntry> {
        self.lock().ring.iter().cloned().collect()
    }

    /// Write every buffered or side-channel entry above the stored drain
    /// marker, then drop what was persisted from the ring and the
    /// side-channel. A no-op during a blackout.
    pub async fn drain(&self) -> Result<DrainReport, HostlinkError> {
        if let Some(blackout) = self.tracker.blackout() {
            debug!(reason = blackout.label(), "log_drain_deferred");
            let state = self.lock();
            return Ok(DrainReport {
                remaining: state.ring.len(),
                dropped: state.ring.dropped(),
                skipped: Some(blackout),
                ..DrainReport::default()
            });
        }

        let _drain = self.drain_lock.lock().await;
        // Critical entries the ring already evicted only exist here.
        let staged = match self.side_channel.load() {
            Ok(staged) => staged,
            Err(err) => {
                fallback::report("side_channel_load", &err);
                return Err(err);
            }
        };
        let buffered = self.buffered_entries();

        let mut markers: HashMap<SessionId, u64> = HashMap::new();
        for entry in staged.iter().chain(&buffered) {
            if !markers.contains_key(&entry.session_id) {
                let marker = self.store.last_drained_sequence(entry.session_id).await?;
                markers.insert(entry.session_id, marker);
            }
        }
        let pending = merge_pending(staged.into_iter().chain(buffered), &markers);

        let written = match self.store.append_logs(&pending).await {
            Ok(written) => written,
            Err(err) => {
                fallback::report("log_drain", &err);
                return Err(err);
            }
        };
        for entry in &pending {
            let marker = markers.entry(entry.session_id).or_insert(0);
            *marker = (*marker).max(entry.sequence);
        }

        let (remaining, dropped) = {
            let mut state = self.lock();
            state.ring.retain(|entry| {
                markers
                    .get(&entry.session_id)
                    .is_none_or(|marker| entry.sequence > *marker)
            });
            (state.ring.len(), state.ring.dropped())
        };
        if let Err(err) = self.side_channel.retain_after(&markers) {
            fallback::report("side_channel_compact", &err);
        }

        if written > 0 {
            debug!(written, remaining, "logs_drained");
        }
        Ok(DrainReport {
            written,
            remaining,
            dropped,
            skipped: None,
        })
    }

    /// Load side-channel entries back into the ring. Called once at startup,
    /// before the first session begins.
    pub fn rehydrate(&self) -> Result<usize, HostlinkError> {
        let entries = self.side_channel.load()?;
        let count = entries.len();
        let mut state = self.lock();
        let known: std::collections::HashSet<(SessionId, u64)> = state
            .ring
            .iter()
            .map(|entry| (entry.session_id, entry.sequence))
            .collect();
        for entry in entries {
            if !known.contains(&(entry.session_id, entry.sequence)) {
                state.ring.push(entry);
            }
        }
        if count > 0 {
            info!(count, "side_channel_rehydrated");
        }
        Ok(count)
    }

    /// Stage everything still buffered in the side-channel before teardown.
    pub fn persist_buffer(&self) -> Result<usize, HostlinkError> {
        let state = self.lock();
        let entries: Vec<LogEntry> = state.ring.iter().cloned().collect();
        if !state.unsequenced.is_empty() {
            fallback::report(
                "persist_buffer",
                &format!("{} emissions arrived before any session", state.unsequenced.len()),
            );
        }
        drop(state);
        self.side_channel.put_all(&entries)?;
        if !entries.is_empty() {
            info!(count = entries.len(), "log_buffer_persisted");
        }
        Ok(entries.len())
    }
}

/// Entries above their session's marker, one per `(session, sequence)`,
/// sessions in first-seen order and sequences ascending within each.
fn merge_pending(
    entries: impl IntoIterator<Item = LogEntry>,
    markers: &HashMap<SessionId, u64>,
) -> Vec<LogEntry> {
    let mut order: Vec<SessionId> = Vec::new();
    let mut by_session: HashMap<SessionId, BTreeMap<u64, LogEntry>> = HashMap::new();
    for entry in entries {
        let session = entry.session_id;
        if entry.sequence <= markers.get(&session).copied().unwrap_or(0) {
            continue;
        }
        by_session
            .entry(session)
            .or_insert_with(|| {
                order.push(session);
                BTreeMap::new()
            })
            .insert(entry.sequence, entry);
    }
    order
        .into_iter()
        .filter_map(|session| by_session.remove(&session))
        .flat_map(BTreeMap::into_values)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_core::log::LogQuery;
    use hostlink_core::session::SessionStartReason;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: CoordinationStore,
        side_channel: Arc<SideChannel>,
        tracker: Arc<CompilationTracker>,
        capture: LogCapture,
    }

    async fn fixture(capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CoordinationStore::in_memory().await.expect("store");
        let side_channel = Arc::new(SideChannel::new(dir.path().join("side_channel.jsonl")));
        let tracker = Arc::new(CompilationTracker::new());
        tracker.set_store_ready(true);
        let config = CaptureConfig {
            ring_capacity: capacity,
            max_stack_frames: 2,
        };
        let capture = LogCapture::new(&config, store.clone(), side_channel.clone(), tracker.clone());
        Fixture {
            _dir: dir,
            store,
            side_channel,
            tracker,
            capture,
        }
    }

    #[tokio::test]
    async fn sequences_start_at_one_per_session() {
        let f = fixture(16).await;
        let first = SessionId::new_v4();
        f.capture.begin_session(first);
        let a = f.capture.record(RawLogEvent::new(LogLevel::Info, "a")).expect("entry");
        let b = f.capture.record(RawLogEvent::new(LogLevel::Info, "b")).expect("entry");
        assert_eq!((a.sequence, b.sequence), (1, 2));

        let second = SessionId::new_v4();
        f.capture.begin_session(second);
        let c = f.capture.record(RawLogEvent::new(LogLevel::Info, "c")).expect("entry");
        assert_eq!((c.session_id, c.sequence), (second, 1));
    }

    #[tokio::test]
    async fn early_emissions_replay_into_first_session() {
        let f = fixture(16).await;
        assert!(f.capture.record(RawLogEvent::new(LogLevel::Info, "boot")).is_none());
        let session = SessionId::new_v4();
        f.capture.begin_session(session);
        let buffered = f.capture.buffered_entries();
        assert_eq!(buffered.len(), 1);
        assert_eq!((buffered[0].session_id, buffered[0].sequence), (session, 1));
    }

    #[tokio::test]
    async fn record_fills_source_location_and_truncates() {
        let f = fixture(16).await;
        f.capture.begin_session(SessionId::new_v4());
        f.capture.set_running_request(Some(7));
        let stack = "A () (at Assets/A.cs:10)\nB () (at Assets/B.cs:20)\nC () (at Assets/C.cs:30)";
        let entry = f
            .capture
            .record(RawLogEvent::new(LogLevel::Exception, "boom").with_stack_trace(stack))
            .expect("entry");
        assert_eq!(entry.source_file.as_deref(), Some("Assets/A.cs"));
        assert_eq!(entry.source_line, Some(10));
        assert_eq!(
            entry.truncated_stack.as_deref(),
            Some("A () (at Assets/A.cs:10)\nB () (at Assets/B.cs:20)\n... (1 more frames)")
        );
        assert_eq!(entry.request_id, Some(7));
        assert_eq!(f.side_channel.load().expect("load").len(), 1);
    }

    #[tokio::test]
    async fn drain_is_deferred_during_blackout_then_exactly_once() {
        let f = fixture(64).await;
        let session = f
            .store
            .open_session(SessionStartReason::HostStart)
            .await
            .expect("session");
        f.capture.begin_session(session.id);

        f.tracker.start();
        for n in 0..5 {
            f.capture.record(RawLogEvent::new(LogLevel::Info, format!("line {n}")));
        }
        let deferred = f.capture.drain().await.expect("drain");
        assert_eq!(deferred.skipped, Some(Blackout::Compiling));
        assert_eq!(deferred.remaining, 5);

        f.tracker.finish(&[]);
        let report = f.capture.drain().await.expect("drain");
        assert_eq!(report.written, 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(f.capture.drain().await.expect("drain").written, 0);

        let stored = f
            .store
            .query_logs(&LogQuery::for_session(session.id))
            .await
            .expect("query");
        assert_eq!(stored.len(), 5);
    }

    #[tokio::test]
    async fn diagnostics_are_critical_and_compacted_after_drain() {
        let f = fixture(16).await;
        f.capture.begin_session(SessionId::new_v4());
        let diagnostic =
            Diagnostic::parse("Assets/A.cs(1,2): warning CS0168: unused").expect("parsed");
        let entry = f.capture.record_diagnostic(&diagnostic).expect("entry");
        assert!(entry.is_critical());
        assert_eq!(entry.message, "Assets/A.cs(1,2): warning CS0168: unused");
        assert_eq!(f.side_channel.load().expect("load").len(), 1);

        f.capture.drain().await.expect("drain");
        assert!(f.side_channel.load().expect("load").is_empty());
    }

    #[tokio::test]
    async fn persisted_buffer_survives_into_new_capture() {
        let f = fixture(16).await;
        let session = SessionId::new_v4();
        f.capture.begin_session(session);
        f.capture.record(RawLogEvent::new(LogLevel::Info, "kept across reload"));
        f.capture.record(RawLogEvent::new(LogLevel::Error, "critical"));
        assert_eq!(f.capture.persist_buffer().expect("persist"), 2);

        let config = CaptureConfig {
            ring_capacity: 16,
            max_stack_frames: 2,
        };
        let reloaded = LogCapture::new(
            &config,
            f.store.clone(),
            f.side_channel.clone(),
            f.tracker.clone(),
        );
        assert_eq!(reloaded.rehydrate().expect("rehydrate"), 2);
        let report = reloaded.drain().await.expect("drain");
        assert_eq!(report.written, 2);

        let stored = f
            .store
            .query_logs(&LogQuery::for_session(session))
            .await
            .expect("query");
        let messages: Vec<&str> = stored.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["kept across reload", "critical"]);
    }

    #[tokio::test]
    async fn critical_entry_evicted_during_blackout_still_reaches_store() {
        let f = fixture(2).await;
        let session = f
            .store
            .open_session(SessionStartReason::HostStart)
            .await
            .expect("session");
        f.capture.begin_session(session.id);

        f.tracker.start();
        f.capture.record(RawLogEvent::new(LogLevel::Error, "boom"));
        for n in 1..=3 {
            f.capture.record(RawLogEvent::new(LogLevel::Info, format!("i{n}")));
        }
        assert_eq!(f.capture.buffered(), 2);
        f.tracker.finish(&[]);

        f.capture.drain().await.expect("drain");
        let stored = f
            .store
            .query_logs(&LogQuery::for_session(session.id))
            .await
            .expect("query");
        let messages: Vec<&str> = stored.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["boom", "i2", "i3"]);
        assert!(f.side_channel.load().expect("load").is_empty());
        assert_eq!(f.capture.drain().await.expect("drain").written, 0);
    }

    #[tokio::test]
    async fn rehydrated_backlog_larger_than_ring_is_fully_drained() {
        let f = fixture(16).await;
        let session = SessionId::new_v4();
        f.capture.begin_session(session);
        for n in 0..6 {
            f.capture.record(RawLogEvent::new(LogLevel::Warning, format!("w{n}")));
        }
        f.capture.persist_buffer().expect("persist");

        let config = CaptureConfig {
            ring_capacity: 3,
            max_stack_frames: 2,
        };
        let reloaded = LogCapture::new(
            &config,
            f.store.clone(),
            f.side_channel.clone(),
            f.tracker.clone(),
        );
        assert_eq!(reloaded.rehydrate().expect("rehydrate"), 6);
        assert_eq!(reloaded.buffered(), 3);
        assert_eq!(reloaded.drain().await.expect("drain").written, 6);

        let stored = f
            .store
            .query_logs(&LogQuery::for_session(session))
            .await
            .expect("query");
        let sequences: Vec<u64> = stored.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
        assert!(f.side_channel.load().expect("load").is_empty());
    }
}
