//! Progress reporting hooks

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::Direction;

/// Receives transfer progress; implementations must be cheap and non-blocking
pub trait ProgressReporter: Send + Sync {
    fn on_start(&self, _direction: Direction, _total_bytes: u64, _object_count: usize) {}

    /// `bytes` more bytes were acknowledged (upload) or written (download)
    fn on_bytes(&self, bytes: u64);

    fn on_object_complete(&self, _object_index: usize) {}

    fn on_finish(&self, _success: bool) {}
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_bytes(&self, _bytes: u64) {}
}

/// Keeps running totals, for summaries and tests
#[derive(Debug, Default)]
pub struct ProgressCounter {
    bytes: AtomicU64,
    objects: AtomicUsize,
}

impl ProgressCounter {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn objects(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for ProgressCounter {
    fn on_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_object_complete(&self, _object_index: usize) {
        self.objects.fetch_add(1, Ordering::Relaxed);
    }
}
