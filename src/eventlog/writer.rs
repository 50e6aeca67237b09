//! Append-only JSONL writer with restart-safe event ids and live tailing.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::Stream;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{LogEntry, LogRecord};
use crate::{AppError, Result};

/// Default sleep between polls while tailing.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Only the id is needed when seeding the sequence.
#[derive(Deserialize)]
struct EventIdOnly {
    event_id: i64,
}

/// Append handle and whether the file may end in a partial line.
struct Sink {
    file: Option<File>,
    torn: bool,
}

/// Single-file JSONL event log.
///
/// Writes are serialized by one mutex and flushed immediately. Ids are
/// assigned while the lock is held so file order always equals id order.
/// Snapshot and tail readers open their own handles and never take the lock.
///
/// Appends are small synchronous writes under a `std` mutex and are made
/// directly from async tasks.
pub struct StructuredEventLog {
    path: PathBuf,
    last_id: AtomicI64,
    writer: Mutex<Sink>,
    poll_interval: Duration,
}

impl StructuredEventLog {
    /// Open (or create) the log at `path`, resuming the id sequence.
    ///
    /// Creates parent directories as needed. The existing file is scanned
    /// for the highest `event_id`; malformed lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::EventLog` if the directory or file cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::EventLog(format!(
                    "failed to create event log directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let last_id = scan_highest_id(&path);
        let torn = ends_mid_line(&path);
        let file = open_append(&path)?;
        debug!(path = %path.display(), last_id, torn, "structured event log opened");

        Ok(Self {
            path,
            last_id: AtomicI64::new(last_id),
            writer: Mutex::new(Sink {
                file: Some(file),
                torn,
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the tail polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest id assigned so far (0 for an empty log).
    #[must_use]
    pub fn last_event_id(&self) -> i64 {
        self.last_id.load(Ordering::SeqCst)
    }

    /// Append `record` and return its assigned id.
    ///
    /// Failures are logged and swallowed: the log is observability, not
    /// session state. A failed writer is reopened on the next call, and the
    /// next line starts on a fresh line so a torn write stays isolated.
    pub fn write(&self, record: LogRecord) -> i64 {
        let mut guard = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let sink = &mut *guard;

        let event_id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = LogEntry {
            event_id,
            timestamp_utc: Utc::now(),
            level: record.level,
            event_type: record.event_type.as_str().to_owned(),
            message: record.message,
            component: record.component,
            session_id: record.session_id,
            correlation_id: record.correlation_id,
            details_json: record.details_json,
        };

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, event_id, "failed to serialize event log entry");
                return event_id;
            }
        };

        if sink.file.is_none() {
            match open_append(&self.path) {
                Ok(file) => sink.file = Some(file),
                Err(err) => {
                    warn!(%err, event_id, "event log unavailable, entry dropped");
                    return event_id;
                }
            }
        }

        if let Some(file) = sink.file.as_mut() {
            match append_line(file, &line, sink.torn) {
                Ok(()) => sink.torn = false,
                Err(err) => {
                    warn!(%err, event_id, "failed to write event log entry");
                    sink.file = None;
                    sink.torn = true;
                }
            }
        }

        event_id
    }

    /// Read entries with `event_id > from_offset` in file order.
    ///
    /// `limit <= 0` returns every matching entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::EventLog` if the file exists but cannot be read.
    pub fn snapshot(&self, from_offset: i64, limit: i64) -> Result<Vec<LogEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::EventLog(format!(
                    "failed to open {} for reading: {err}",
                    self.path.display()
                )))
            }
        };

        let max = usize::try_from(limit).ok().filter(|n| *n > 0);
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut entries = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| AppError::EventLog(format!("event log read failed: {e}")))?;
            if read == 0 {
                break;
            }
            let Some(entry) = parse_line(&buf) else {
                continue;
            };
            if entry.event_id <= from_offset {
                continue;
            }
            entries.push(entry);
            if max.is_some_and(|m| entries.len() >= m) {
                break;
            }
        }

        Ok(entries)
    }

    /// Tail the log, yielding every entry with `event_id > from_offset`.
    ///
    /// The stream polls the file with its own handle and ends when `cancel`
    /// fires. An incomplete trailing line is held until its newline lands.
    pub fn stream_from_offset(
        &self,
        from_offset: i64,
        cancel: CancellationToken,
    ) -> impl Stream<Item = LogEntry> + Send + 'static {
        let state = TailState {
            path: self.path.clone(),
            poll_interval: self.poll_interval,
            reader: None,
            pending: Vec::new(),
            offset: from_offset,
            cancel,
        };
        futures_util::stream::unfold(state, |mut state| async move {
            let entry = state.next_entry().await?;
            Some((entry, state))
        })
    }
}

/// Cursor over a growing log file.
struct TailState {
    path: PathBuf,
    poll_interval: Duration,
    reader: Option<tokio::io::BufReader<tokio::fs::File>>,
    pending: Vec<u8>,
    offset: i64,
    cancel: CancellationToken,
}

impl TailState {
    async fn next_entry(&mut self) -> Option<LogEntry> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            if self.reader.is_none() {
                match tokio::fs::File::open(&self.path).await {
                    Ok(file) => self.reader = Some(tokio::io::BufReader::new(file)),
                    Err(_) => {
                        if !self.sleep().await {
                            return None;
                        }
                        continue;
                    }
                }
            }

            let reader = self.reader.as_mut()?;
            match reader.read_until(b'\n', &mut self.pending).await {
                Ok(0) => {
                    if !self.sleep().await {
                        return None;
                    }
                }
                Ok(_) if self.pending.ends_with(b"\n") => {
                    let line = std::mem::take(&mut self.pending);
                    if let Some(entry) = parse_line(&line) {
                        if entry.event_id > self.offset {
                            self.offset = entry.event_id;
                            return Some(entry);
                        }
                    }
                }
                Ok(_) => {
                    // Writer is mid-line; wait for the rest.
                    if !self.sleep().await {
                        return None;
                    }
                }
                Err(err) => {
                    warn!(%err, path = %self.path.display(), "event log tail read failed, reopening");
                    self.reader = None;
                    self.pending.clear();
                    if !self.sleep().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep one poll interval; `false` when cancelled.
    async fn sleep(&self) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            AppError::EventLog(format!("failed to open event log {}: {e}", path.display()))
        })
}

/// Write `line` and its newline in one buffer. After a failed write the line
/// is preceded by a newline, terminating whatever partial line was left.
fn append_line<W: Write>(out: &mut W, line: &str, after_failure: bool) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(line.len() + 2);
    if after_failure {
        bytes.push(b'\n');
    }
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    out.write_all(&bytes)?;
    out.flush()
}

/// Whether a non-empty `path` lacks a trailing newline.
fn ends_mid_line(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    if file.seek(SeekFrom::End(-1)).is_err() {
        return false;
    }
    let mut last = [0u8; 1];
    matches!(file.read(&mut last), Ok(1) if last[0] != b'\n')
}

fn parse_line(raw: &[u8]) -> Option<LogEntry> {
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_slice::<LogEntry>(trimmed) {
        Ok(entry) => Some(entry),
        Err(err) => {
            debug!(%err, "skipping malformed event log line");
            None
        }
    }
}

/// Highest `event_id` present in `path`, or 0.
fn scan_highest_id(path: &Path) -> i64 {
    let Ok(file) = File::open(path) else {
        return 0;
    };
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut highest = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if let Ok(line) = serde_json::from_slice::<EventIdOnly>(buf.trim_ascii()) {
                    highest = highest.max(line.event_id);
                }
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "event log scan aborted");
                break;
            }
        }
    }
    highest
}
