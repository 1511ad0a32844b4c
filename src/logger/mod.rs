use crate::rules::Action;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One access-log record, a single connection decision.
#[derive(Debug, Clone)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub hostname: String,
    pub group: String,
    pub action: Action,
    pub machine: String,
    pub username: String,
    pub app: String,
}

impl Entry {
    /// Fixed column order: timestamp | src-ip | hostname | group | action |
    /// machine | user | app. Empty columns stay empty; the separator is
    /// invariant.
    fn format_line(&self) -> String {
        format!(
            "{} | {} | {} | {} | {} | {} | {} | {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.source_ip,
            self.hostname,
            self.group,
            self.action,
            self.machine,
            self.username,
            self.app,
        )
    }
}

/// Destination for access-log records. The connection handler only depends
/// on this trait, so tests can capture records in memory.
pub trait Sink: Send + Sync {
    fn log(&self, entry: &Entry);
    fn flush(&self) -> std::io::Result<()>;
}

struct Inner {
    writer: BufWriter<File>,
    path: PathBuf,
}

/// Append-only structured access log over a buffered file writer.
///
/// Writes are buffered; the supervisor flushes once a second and on
/// shutdown. `reopen` hands the inode over to an external log rotator.
pub struct AccessLog {
    inner: Mutex<Inner>,
}

impl AccessLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
            }),
        })
    }

    /// Flushes, closes and reopens the file at the same path.
    pub fn reopen(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let file = open_append(&inner.path)?;
        inner.writer = BufWriter::new(file);
        Ok(())
    }

    /// Flushes and releases the file handle.
    pub fn close(&self) -> std::io::Result<()> {
        self.inner.lock().writer.flush()
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Sink for AccessLog {
    fn log(&self, entry: &Entry) {
        let line = entry.format_line();
        let mut inner = self.inner.lock();
        // A failed buffered write is retried implicitly by the periodic
        // flush; the hot path does not surface it.
        let _ = inner.writer.write_all(line.as_bytes());
    }

    fn flush(&self) -> std::io::Result<()> {
        self.inner.lock().writer.flush()
    }
}

/// Discards every record.
pub struct NullSink;

impl Sink for NullSink {
    fn log(&self, _entry: &Entry) {}

    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captures records in memory, for tests.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl Sink for MemorySink {
    fn log(&self, entry: &Entry) {
        self.lines.lock().push(entry.format_line());
    }

    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}
