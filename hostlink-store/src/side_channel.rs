//! Crash-surviving staging area for log entries that have not reached the
//! database yet.
//!
//! Entries are appended as JSON lines to a file next to the database and
//! keyed by `(session_id, sequence)`. The file is append-only between
//! compactions; a torn trailing line from a crash is skipped on load.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use hostlink_core::error::{HostlinkError, InfraError};
use hostlink_core::log::LogEntry;
use hostlink_core::session::SessionId;

pub struct SideChannel {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SideChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk before returning.
    pub fn put(&self, entry: &LogEntry) -> Result<(), HostlinkError> {
        let _guard = self.guard();
        append_entries(&self.path, std::slice::from_ref(entry))
    }

    pub fn put_all(&self, entries: &[LogEntry]) -> Result<(), HostlinkError> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.guard();
        append_entries(&self.path, entries)
    }

    /// Latest value per key. Sessions come back in the order they first
    /// appear in the file, sequences ascending within each.
    pub fn load(&self) -> Result<Vec<LogEntry>, HostlinkError> {
        let _guard = self.guard();
        read_entries(&self.path)
    }

    /// Drop every entry at or below its session's persisted marker.
    pub fn retain_after(&self, markers: &HashMap<SessionId, u64>) -> Result<usize, HostlinkError> {
        let _guard = self.guard();
        let entries = read_entries(&self.path)?;
        let before = entries.len();
        let kept: Vec<LogEntry> = entries
            .into_iter()
            .filter(|entry| {
                markers
                    .get(&entry.session_id)
                    .is_none_or(|marker| entry.sequence > *marker)
            })
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            rewrite_entries(&self.path, &kept)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), HostlinkError> {
        let _guard = self.guard();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(err)),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn io_err(err: std::io::Error) -> HostlinkError {
    HostlinkError::Infra(InfraError::Io(err))
}

fn append_entries(path: &Path, entries: &[LogEntry]) -> Result<(), HostlinkError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    // A crash can leave a torn line without its newline; start on a fresh one.
    if !ends_with_newline(path)? {
        file.write_all(b"\n").map_err(io_err)?;
    }
    for entry in entries {
        serde_json::to_writer(&mut file, entry).map_err(HostlinkError::encode)?;
        file.write_all(b"\n").map_err(io_err)?;
    }
    file.flush().map_err(io_err)?;
    file.sync_data().map_err(io_err)?;
    Ok(())
}

fn ends_with_newline(path: &Path) -> Result<bool, HostlinkError> {
    let mut file = fs::File::open(path).map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1)).map_err(io_err)?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).map_err(io_err)?;
    Ok(last[0] == b'\n')
}

fn read_entries(path: &Path) -> Result<Vec<LogEntry>, HostlinkError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(err)),
    };

    let mut session_order: HashMap<SessionId, usize> = HashMap::new();
    let mut latest: HashMap<(SessionId, u64), LogEntry> = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => {
                let next = session_order.len();
                session_order.entry(entry.session_id).or_insert(next);
                latest.insert((entry.session_id, entry.sequence), entry);
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "skipping_malformed_side_channel_entry"
                );
            }
        }
    }

    let mut entries: Vec<LogEntry> = latest.into_values().collect();
    entries.sort_by_key(|entry| {
        (
            session_order.get(&entry.session_id).copied().unwrap_or(usize::MAX),
            entry.sequence,
        )
    });
    Ok(entries)
}

fn rewrite_entries(path: &Path, entries: &[LogEntry]) -> Result<(), HostlinkError> {
    if entries.is_empty() {
        return match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(err)),
        };
    }
    let tmp = path.with_extension("jsonl.tmp");
    let _ = fs::remove_file(&tmp);
    append_entries(&tmp, entries)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hostlink_core::log::LogLevel;

    fn entry(session_id: SessionId, sequence: u64, message: &str) -> LogEntry {
        LogEntry {
            session_id,
            sequence,
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message: message.to_string(),
            stack_trace: None,
            truncated_stack: None,
            source_file: None,
            source_line: None,
            context: None,
            request_id: None,
        }
    }

    #[test]
    fn load_keeps_latest_value_per_key_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = SideChannel::new(dir.path().join("side_channel.jsonl"));
        let session = SessionId::new_v4();
        channel.put(&entry(session, 2, "second")).expect("put");
        channel.put(&entry(session, 1, "first")).expect("put");
        channel.put(&entry(session, 2, "second again")).expect("put");

        let loaded = channel.load().expect("load");
        let view: Vec<(u64, &str)> = loaded
            .iter()
            .map(|e| (e.sequence, e.message.as_str()))
            .collect();
        assert_eq!(view, vec![(1, "first"), (2, "second again")]);
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("side_channel.jsonl");
        let channel = SideChannel::new(&path);
        let session = SessionId::new_v4();
        channel.put(&entry(session, 1, "ok")).expect("put");
        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"session_id\":\"trunc").expect("write");

        let loaded = channel.load().expect("load");
        assert_eq!(loaded.len(), 1);

        channel.put(&entry(session, 2, "after crash")).expect("put");
        assert_eq!(channel.load().expect("load").len(), 2);
    }

    #[test]
    fn retain_after_compacts_persisted_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = SideChannel::new(dir.path().join("side_channel.jsonl"));
        let drained = SessionId::new_v4();
        let pending = SessionId::new_v4();
        channel
            .put_all(&[
                entry(drained, 1, "a"),
                entry(drained, 2, "b"),
                entry(drained, 3, "c"),
                entry(pending, 1, "d"),
            ])
            .expect("put");

        let markers = HashMap::from([(drained, 2)]);
        assert_eq!(channel.retain_after(&markers).expect("retain"), 2);
        let left: Vec<String> = channel
            .load()
            .expect("load")
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(left, vec!["c".to_string(), "d".to_string()]);

        let markers = HashMap::from([(drained, 3), (pending, 1)]);
        channel.retain_after(&markers).expect("retain");
        assert!(channel.load().expect("load").is_empty());
        assert!(!channel.path().exists());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = SideChannel::new(dir.path().join("side_channel.jsonl"));
        channel.clear().expect("clear missing");
        channel.put(&entry(SessionId::new_v4(), 1, "x")).expect("put");
        channel.clear().expect("clear");
        assert!(channel.load().expect("load").is_empty());
    }
}
