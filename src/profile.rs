//! Per-node timing collector.
//!
//! Each thread records one span per node it executes into a local buffer and
//! hands the buffer over once at the end of its epoch. The result can be
//! exported as a Chrome Tracing JSON file (chrome://tracing or ui.perfetto.dev).

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A single trace event in Chrome Tracing "complete event" form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub ph: &'static str,
    /// Start, in microseconds since the profiler was created.
    pub ts: u64,
    pub dur: u64,
    pub pid: u32,
    /// Worker index.
    pub tid: usize,
    pub args: TraceArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceArgs {
    pub epoch: u64,
    pub node: usize,
}

/// Events kept by [`Profiler::new`] before new spans are dropped.
pub const DEFAULT_MAX_EVENTS: usize = 1 << 20;

/// Collects spans across epochs until [`Profiler::clear`] is called.
///
/// At most `max_events` spans are retained. Spans flushed past that limit
/// are discarded and counted in [`Profiler::dropped`].
pub struct Profiler {
    start: Instant,
    max_events: usize,
    events: Mutex<Vec<TraceEvent>>,
    dropped: AtomicU64,
}

impl Profiler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            start: Instant::now(),
            max_events,
            events: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn local(&self, tid: usize, epoch: u64) -> LocalTrace<'_> {
        LocalTrace {
            profiler: self,
            tid,
            epoch,
            events: Vec::new(),
        }
    }

    fn flush(&self, events: &mut Vec<TraceEvent>) {
        if events.is_empty() {
            return;
        }
        let mut global = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let room = self.max_events.saturating_sub(global.len());
        if events.len() > room {
            let over = events.len() - room;
            self.dropped.fetch_add(over as u64, Ordering::Relaxed);
            events.truncate(room);
        }
        global.append(events);
    }

    /// Spans discarded because the event limit was reached.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// All events recorded so far, ordered by start time.
    pub fn events(&self) -> Vec<TraceEvent> {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        events.sort_by_key(|e| (e.ts, e.tid));
        events
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dropped.store(0, Ordering::Relaxed);
    }

    pub fn to_chrome_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.events())
    }

    pub fn export_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.events())?;
        writer.flush()
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

/// One thread's buffer for one epoch. Flushes into the profiler on drop.
pub(crate) struct LocalTrace<'a> {
    profiler: &'a Profiler,
    tid: usize,
    epoch: u64,
    events: Vec<TraceEvent>,
}

impl LocalTrace<'_> {
    pub(crate) fn record(&mut self, name: &str, node: usize, start: Instant, duration: Duration) {
        let ts = start.saturating_duration_since(self.profiler.start).as_micros() as u64;
        self.events.push(TraceEvent {
            name: name.to_string(),
            ph: "X",
            ts,
            dur: duration.as_micros() as u64,
            pid: 1,
            tid: self.tid,
            args: TraceArgs {
                epoch: self.epoch,
                node,
            },
        });
    }
}

impl Drop for LocalTrace<'_> {
    fn drop(&mut self) {
        self.profiler.flush(&mut self.events);
    }
}
