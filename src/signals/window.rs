// =============================================================================
// Signal Window — per-instrument buffer with time-based eviction
// =============================================================================
//
// Signals are kept oldest-first in arrival order. Every operation captures
// a single `now` and compares each signal's age against it, so one pass
// never sees two different cutoffs. A signal whose age is >= the window is
// gone; survivors keep their arrival order.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::types::Signal;

pub struct SignalWindow {
    window: Duration,
    buffers: RwLock<HashMap<String, VecDeque<Signal>>>,
}

impl SignalWindow {
    /// Create a window that retains signals younger than `window_seconds`.
    pub fn new(window_seconds: f64) -> Self {
        let millis = (window_seconds.max(0.0) * 1_000.0).round() as i64;
        Self {
            window: Duration::milliseconds(millis),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Append `signal` to `instrument`'s buffer and evict expired entries.
    ///
    /// Returns the buffer length after eviction.
    pub fn append(&self, instrument: &str, signal: Signal) -> usize {
        self.append_at(instrument, signal, Utc::now())
    }

    pub fn append_at(&self, instrument: &str, signal: Signal, now: DateTime<Utc>) -> usize {
        let mut buffers = self.buffers.write();
        let buffer = buffers.entry(instrument.to_string()).or_default();

        if let Some(last) = buffer.back() {
            if signal.received_at < last.received_at {
                debug!(
                    instrument,
                    producer = %signal.producer_id,
                    "signal timestamp precedes buffer tail; keeping arrival order"
                );
            }
        }

        buffer.push_back(signal);
        let evicted = evict(buffer, now, self.window);
        let len = buffer.len();
        if len == 0 {
            buffers.remove(instrument);
        }

        trace!(instrument, len, evicted, "signal appended");
        len
    }

    /// Current signals for `instrument`, oldest first, with nothing aged
    /// past the window. Does not mutate the buffer.
    pub fn snapshot(&self, instrument: &str) -> Vec<Signal> {
        self.snapshot_at(instrument, Utc::now())
    }

    pub fn snapshot_at(&self, instrument: &str, now: DateTime<Utc>) -> Vec<Signal> {
        let buffers = self.buffers.read();
        match buffers.get(instrument) {
            Some(buffer) => buffer
                .iter()
                .filter(|s| now - s.received_at < self.window)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop every buffered signal for `instrument`.
    pub fn clear(&self, instrument: &str) {
        if let Some(buffer) = self.buffers.write().remove(instrument) {
            debug!(instrument, dropped = buffer.len(), "signal window cleared");
        }
    }

    /// Run an eviction pass over every instrument.
    pub fn evict_all_at(&self, now: DateTime<Utc>) -> usize {
        let mut buffers = self.buffers.write();
        let mut evicted = 0;
        for buffer in buffers.values_mut() {
            evicted += evict(buffer, now, self.window);
        }
        buffers.retain(|_, buffer| !buffer.is_empty());
        evicted
    }

    /// Raw buffer length, including anything not yet evicted.
    pub fn len(&self, instrument: &str) -> usize {
        self.buffers
            .read()
            .get(instrument)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn instruments(&self) -> Vec<String> {
        self.buffers.read().keys().cloned().collect()
    }
}

impl Default for SignalWindow {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl std::fmt::Debug for SignalWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWindow")
            .field("window_ms", &self.window.num_milliseconds())
            .field("instruments", &self.buffers.read().len())
            .finish()
    }
}

/// Drop expired signals. Returns how many were removed.
///
/// Arrival order normally matches `received_at`, so this is a pop from the
/// front; `retain` also catches entries stamped earlier than their
/// predecessors (clock steps, explicit `append_at` timestamps).
fn evict(buffer: &mut VecDeque<Signal>, now: DateTime<Utc>, window: Duration) -> usize {
    let before = buffer.len();
    buffer.retain(|s| now - s.received_at < window);
    before - buffer.len()
}
