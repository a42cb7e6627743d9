//! Experiment journal: the write-only event sink for run data.
//!
//! Distinct from diagnostic logging. The engine supplies ordered string
//! fields (category, subject, value); timestamping and persistence belong to
//! the sink implementation.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::session::SessionRole;

pub trait EventSink: Send {
    fn append(&mut self, fields: &[&str]);
    fn flush(&mut self) {}
}

pub struct Journal {
    sink: Box<dyn EventSink>,
}

impl Journal {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(Box::new(FileSink::create(path)?)))
    }

    pub fn memory() -> (Self, MemoryHandle) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let handle = MemoryHandle {
            records: records.clone(),
        };
        (Self::new(Box::new(MemorySink { records })), handle)
    }

    /// Swallows everything; used when no journal was configured.
    pub fn sink_only() -> Self {
        Self::new(Box::new(NullSink))
    }

    pub fn record(&mut self, fields: &[&str]) {
        self.sink.append(fields);
    }

    pub fn flush(&mut self) {
        self.sink.flush();
    }
}

/// Tab-separated records prefixed with a wall-clock millisecond stamp.
pub struct FileSink {
    out: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
        })
    }
}

impl EventSink for FileSink {
    fn append(&mut self, fields: &[&str]) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut line = stamp.to_string();
        for field in fields {
            line.push('\t');
            line.push_str(field);
        }
        line.push('\n');
        let _ = self.out.write_all(line.as_bytes());
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

pub struct MemorySink {
    records: Arc<Mutex<Vec<Vec<String>>>>,
}

impl EventSink for MemorySink {
    fn append(&mut self, fields: &[&str]) {
        let record = fields.iter().map(|f| f.to_string()).collect();
        self.records.lock().unwrap().push(record);
    }
}

/// Test-side view into a [`MemorySink`].
#[derive(Clone)]
pub struct MemoryHandle {
    records: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MemoryHandle {
    pub fn records(&self) -> Vec<Vec<String>> {
        self.records.lock().unwrap().clone()
    }

    pub fn count_with_prefix(&self, prefix: &[&str]) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| {
                record.len() >= prefix.len()
                    && record.iter().zip(prefix.iter()).all(|(a, b)| a == b)
            })
            .count()
    }
}

struct NullSink;

impl EventSink for NullSink {
    fn append(&mut self, _fields: &[&str]) {}
}

/// Journal file name for a run: scenario stem, role, unix seconds.
pub fn journal_file_name(scenario: &str, role: SessionRole) -> String {
    let stem = Path::new(scenario)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("scenario")
        .replace(' ', "_");
    let role = match role {
        SessionRole::Host => "host",
        SessionRole::Participant => "participant",
        SessionRole::Local => "local",
    };
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{stem}_{role}_{stamp}.log")
}
