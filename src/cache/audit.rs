//! Append-only decision log kept next to the cache entries.
//!
//! Each line is `[YYYY-MM-DD HH:MM:SS] message` in UTC. The file is never
//! rotated; operators read it newest-first through the admin surface.

use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tracing::{info, warn};

use super::lock::mutex_lock;
use super::store::{owner_only_options, restrict_mode};

const SOURCE: &str = "cache::audit";
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// One appended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub message: String,
}

impl LogEntry {
    fn new(message: impl Into<String>) -> Self {
        // Embedded newlines would split one record into several on read-back.
        let message = message.into().replace(['\r', '\n'], " ");
        Self {
            timestamp: OffsetDateTime::now_utc(),
            message,
        }
    }

    /// The persisted form, without the trailing newline.
    pub fn line(&self) -> String {
        let stamp = self
            .timestamp
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        format!("[{stamp}] {}", self.message)
    }
}

/// Records appended while handling a single request.
#[derive(Debug, Clone, Default)]
pub struct DecisionTrail {
    entries: Vec<LogEntry>,
}

impl DecisionTrail {
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|entry| entry.message.contains(needle))
    }
}

/// File-backed audit log.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_guard: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message`, returning the in-memory record.
    ///
    /// The file write runs on the blocking pool. Write failures are reported
    /// through tracing only; callers never see them.
    pub async fn append(&self, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(message);
        info!(target = "ppsc::audit", message = %entry.message);

        let path = self.path.clone();
        let guard = Arc::clone(&self.write_guard);
        let line = entry.line();
        let written = tokio::task::spawn_blocking(move || write_line(&path, &guard, &line))
            .await
            .unwrap_or_else(|err| Err(io::Error::other(err)));

        if let Err(err) = written {
            warn!(
                target = "ppsc::audit",
                path = %self.path.display(),
                error = %err,
                "failed to append audit log line"
            );
        }
        entry
    }

    /// Every persisted line, newest first.
    pub fn read_all_newest_first(&self) -> io::Result<Vec<String>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .rev()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn write_line(path: &Path, guard: &Mutex<()>, line: &str) -> io::Result<()> {
    let _guard = mutex_lock(guard, SOURCE, "append");

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent.filter(|p| !p.exists()) {
        fs::create_dir_all(parent)?;
        restrict_mode(parent, 0o700)?;
    }

    let mut file = owner_only_options().create(true).append(true).open(path)?;
    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');
    file.write_all(record.as_bytes())?;
    file.flush()?;

    // Mode is re-asserted on every append, not only at creation.
    restrict_mode(path, 0o600)
}
