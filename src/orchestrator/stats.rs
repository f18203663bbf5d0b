use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::store::BatchOutcome;

/// Counters shared by the stages of one chunk run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    bytes_read: AtomicU64,
    frames_read: AtomicU64,
    frames_skipped: AtomicU64,
    frames_processed: AtomicU64,
    frames_rejected: AtomicU64,
    detections: AtomicU64,
    results_persisted: AtomicU64,
    results_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub frames_read: u64,
    /// Dropped because the frame queue was full.
    pub frames_skipped: u64,
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub detections: u64,
    pub results_persisted: u64,
    pub results_dropped: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn frame_read(&self) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, outcome: BatchOutcome) {
        match outcome {
            BatchOutcome::Persisted(n) => {
                self.results_persisted.fetch_add(n as u64, Ordering::Relaxed);
            }
            BatchOutcome::Dropped(n) => {
                self.results_dropped.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            results_persisted: self.results_persisted.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
        }
    }
}
