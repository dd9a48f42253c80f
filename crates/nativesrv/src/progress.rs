use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::messages::Progress;

/// Accumulates progress reported by the engine between progress packets.
#[derive(Debug)]
pub struct ProgressTracker {
    read_rows: AtomicU64,
    read_bytes: AtomicU64,
    total_rows_to_read: AtomicU64,
    total_bytes_to_read: AtomicU64,
    written_rows: AtomicU64,
    written_bytes: AtomicU64,
    started: Instant,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        ProgressTracker {
            read_rows: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            total_rows_to_read: AtomicU64::new(0),
            total_bytes_to_read: AtomicU64::new(0),
            written_rows: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl ProgressTracker {
    pub fn add_read(&self, rows: u64, bytes: u64) {
        self.read_rows.fetch_add(rows, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Report an estimate of how much is going to be read in total.
    pub fn add_total(&self, rows: u64, bytes: u64) {
        self.total_rows_to_read.fetch_add(rows, Ordering::Relaxed);
        self.total_bytes_to_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_written(&self, rows: u64, bytes: u64) {
        self.written_rows.fetch_add(rows, Ordering::Relaxed);
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Take everything accumulated since the previous call.
    pub fn fetch_and_reset(&self) -> Progress {
        Progress {
            read_rows: self.read_rows.swap(0, Ordering::Relaxed),
            read_bytes: self.read_bytes.swap(0, Ordering::Relaxed),
            total_rows_to_read: self.total_rows_to_read.swap(0, Ordering::Relaxed),
            total_bytes_to_read: self.total_bytes_to_read.swap(0, Ordering::Relaxed),
            written_rows: self.written_rows.swap(0, Ordering::Relaxed),
            written_bytes: self.written_bytes.swap(0, Ordering::Relaxed),
            elapsed_ns: self.started.elapsed().as_nanos() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_deltas() {
        let tracker = ProgressTracker::default();
        tracker.add_read(10, 80);
        tracker.add_read(5, 40);
        tracker.add_written(1, 8);

        let p = tracker.fetch_and_reset();
        assert_eq!((15, 120, 1, 8), (p.read_rows, p.read_bytes, p.written_rows, p.written_bytes));
        assert!(!p.is_empty());

        assert!(tracker.fetch_and_reset().is_empty());
    }
}
