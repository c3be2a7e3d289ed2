//! Injected diagnostic sinks.
//!
//! Every pipeline and consumer receives a sink at construction and
//! writes line-oriented lifecycle and per-batch trace messages to it.
//! The sink is observational only; no behavior depends on its contents.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Append-only, line-oriented diagnostic sink.
pub trait DiagnosticSink: Send + Sync {
    /// Append one line.
    fn append(&self, line: &str);

    /// Flush buffered output, if any.
    fn flush(&self) {}
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn DiagnosticSink>;

/// Sink that keeps lines in memory; used in tests and tools.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any recorded line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl DiagnosticSink for MemorySink {
    fn append(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Sink appending to a file.
pub struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    /// Create or truncate the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl DiagnosticSink for FileSink {
    fn append(&self, line: &str) {
        let mut writer = self.writer.lock();
        // A failed diagnostic write must not fail the batch.
        let _ = writeln!(writer, "{line}");
    }

    fn flush(&self) {
        let _ = self.writer.lock().flush();
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn append(&self, _line: &str) {}
}
