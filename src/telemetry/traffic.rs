//! Traffic accounting.
//!
//! Data-path threads add byte counts at any time; the status reporter drains
//! them. Upload and download are kept under one lock so a drain never sees
//! half of a concurrent `add`.

use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::protocol::TrafficData;

/// Upload/download totals at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Uploaded bytes
    pub upload_bytes: u64,
    /// Downloaded bytes
    pub download_bytes: u64,
}

impl TrafficSnapshot {
    /// True when nothing was transferred
    pub fn is_empty(&self) -> bool {
        self.upload_bytes == 0 && self.download_bytes == 0
    }
}

impl From<TrafficSnapshot> for TrafficData {
    fn from(snapshot: TrafficSnapshot) -> Self {
        TrafficData {
            upload: snapshot.upload_bytes,
            download: snapshot.download_bytes,
        }
    }
}

/// Thread-safe traffic counters plus a session clock
#[derive(Debug)]
pub struct TrafficAccumulator {
    /// Bytes since the last drain
    counters: Mutex<TrafficSnapshot>,
    /// Session start, independent of the traffic counters
    started_at: RwLock<Instant>,
}

impl Default for TrafficAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficAccumulator {
    /// Create empty counters; the session clock starts now
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(TrafficSnapshot::default()),
            started_at: RwLock::new(Instant::now()),
        }
    }

    /// Record transferred bytes
    pub fn add(&self, upload: u64, download: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.upload_bytes = counters.upload_bytes.saturating_add(upload);
        counters.download_bytes = counters.download_bytes.saturating_add(download);
    }

    /// Current totals, without draining
    pub fn read(&self) -> TrafficSnapshot {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain the counters in one step
    pub fn snapshot_and_reset(&self) -> TrafficSnapshot {
        std::mem::take(&mut *self.counters.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Put a drained snapshot back, e.g. after its report failed to send
    pub fn restore(&self, snapshot: TrafficSnapshot) {
        self.add(snapshot.upload_bytes, snapshot.download_bytes);
    }

    /// Time since construction or the last [`reset_start_time`](Self::reset_start_time)
    pub fn duration(&self) -> Duration {
        self.started_at
            .read()
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    /// Whole seconds of [`duration`](Self::duration)
    pub fn duration_secs(&self) -> u64 {
        self.duration().as_secs()
    }

    /// Restart the session clock; traffic counters are untouched
    pub fn reset_start_time(&self) {
        if let Ok(mut started) = self.started_at.write() {
            *started = Instant::now();
        }
    }
}
