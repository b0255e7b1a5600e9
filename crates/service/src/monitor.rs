//! Bounded in-memory buffer of monitor entries.

use sentra_core::monitor::MonitorEntry;
use std::collections::VecDeque;
use std::io::Write;
use tracing::warn;

/// Receives entries evicted from the buffer (overflow or shutdown).
pub trait MonitorSink: Send {
    fn flush(&mut self, entries: Vec<MonitorEntry>);
}

/// Default sink: one JSON object per line onto a writer (stderr unless told
/// otherwise).
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl JsonLinesSink<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> MonitorSink for JsonLinesSink<W> {
    fn flush(&mut self, entries: Vec<MonitorEntry>) {
        for entry in entries {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = writeln!(self.writer, "{line}") {
                        warn!(error = %e, "monitor sink write failed");
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "monitor entry serialization failed"),
            }
        }
    }
}

/// FIFO buffer of at most `capacity` entries; filling up flushes the whole
/// buffer to the sink.
pub struct MonitorBuffer {
    capacity: usize,
    entries: VecDeque<MonitorEntry>,
    sink: Box<dyn MonitorSink>,
}

impl MonitorBuffer {
    pub fn new(capacity: usize, sink: Box<dyn MonitorSink>) -> Self {
        Self { capacity: capacity.max(1), entries: VecDeque::new(), sink }
    }

    pub fn push(&mut self, entry: MonitorEntry) {
        self.entries.push_back(entry);
        if self.entries.len() >= self.capacity {
            let drained: Vec<MonitorEntry> = self.entries.drain(..).collect();
            self.sink.flush(drained);
        }
    }

    /// Drain up to `max` of the oldest buffered entries.
    pub fn take(&mut self, max: usize) -> Vec<MonitorEntry> {
        let n = max.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand everything still buffered to the sink.
    pub fn flush(&mut self) {
        if !self.entries.is_empty() {
            let drained: Vec<MonitorEntry> = self.entries.drain(..).collect();
            self.sink.flush(drained);
        }
    }
}
