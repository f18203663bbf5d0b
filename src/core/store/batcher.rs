//! 结果批量上传 - 分块清理、批次累积、指数退避重试

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::core::config::StoreConfig;
use crate::core::model::DetectionResult;
use crate::core::store::{BackingStore, DetectionRecord, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_base_delay())
    }

    /// Wait before retry number `retry` (0-based): base · 2^retry.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }

    pub fn run<T>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut failures = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    failures += 1;
                    if failures >= self.attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for(failures - 1);
                    warn!(
                        "⚠️ {} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation, failures, self.attempts, e, delay
                    );
                    thread::sleep(delay);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Persisted(usize),
    /// Retries exhausted; the batch is gone.
    Dropped(usize),
}

/// Summary of a pre-run purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeSummary {
    pub detections: usize,
    pub images: usize,
}

pub struct ResultBatcher {
    store: Arc<dyn BackingStore>,
    policy: RetryPolicy,
    batch_size: usize,
    pending: Vec<DetectionResult>,
    oldest: Option<Instant>,
}

impl ResultBatcher {
    pub fn new(store: Arc<dyn BackingStore>, config: &StoreConfig) -> Self {
        Self::with_policy(store, config.batch_size, RetryPolicy::from_config(config))
    }

    pub fn with_policy(store: Arc<dyn BackingStore>, batch_size: usize, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            oldest: None,
        }
    }

    /// Remove every detection (and its stored images) already recorded for
    /// the chunk, so the coming run replaces them wholesale.
    pub fn purge_chunk(&self, chunk_id: &str) -> Result<PurgeSummary, StoreError> {
        let existing = self
            .policy
            .run("list detections", || self.store.list_detections(chunk_id))?;

        let mut paths = Vec::new();
        for path in existing.into_iter().filter_map(|d| d.storage_path) {
            paths.push(ocr_debug_path(&path));
            paths.push(path);
        }
        if !paths.is_empty() {
            self.policy
                .run("delete images", || self.store.delete_images(&paths))?;
        }

        let detections = self
            .policy
            .run("delete detections", || self.store.delete_detections(chunk_id))?;

        let summary = PurgeSummary {
            detections,
            images: paths.len(),
        };
        info!(
            "🗑️ Purged chunk {}: {} detections, {} images",
            chunk_id, summary.detections, summary.images
        );
        Ok(summary)
    }

    /// Queue a result; persists and returns the outcome once the batch is full.
    pub fn push(&mut self, result: DetectionResult) -> Option<BatchOutcome> {
        if self.pending.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.pending.push(result);
        if self.pending.len() >= self.batch_size {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Persist a partial batch that has waited longer than `max_age`.
    pub fn flush_if_stale(&mut self, max_age: Duration) -> Option<BatchOutcome> {
        match self.oldest {
            Some(since) if since.elapsed() >= max_age => Some(self.flush()),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> BatchOutcome {
        self.oldest = None;
        let batch = std::mem::take(&mut self.pending);
        self.persist(&batch)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn persist(&self, batch: &[DetectionResult]) -> BatchOutcome {
        if batch.is_empty() {
            return BatchOutcome::Persisted(0);
        }

        let records: Vec<DetectionRecord> = batch
            .iter()
            .map(|result| DetectionRecord::from_result(result, self.upload_artifacts(result)))
            .collect();

        match self
            .policy
            .run("insert detections", || self.store.insert_detections(&records))
        {
            Ok(()) => {
                debug!("📤 Persisted batch of {}", records.len());
                BatchOutcome::Persisted(records.len())
            }
            Err(e) => {
                error!(
                    "❌ Dropping batch of {} detections after {} attempts: {}",
                    records.len(),
                    self.policy.attempts,
                    e
                );
                BatchOutcome::Dropped(records.len())
            }
        }
    }

    /// Upload debug images; returns the frame path when the frame made it.
    fn upload_artifacts(&self, result: &DetectionResult) -> Option<String> {
        let debug = result.debug.as_ref()?;
        let frame_path = frame_path(&result.source_id, result.timestamp);

        let crop_path = ocr_debug_path(&frame_path);
        if let Err(e) = self.policy.run("upload crop", || {
            self.store.upload_image(&crop_path, &debug.crop_png, "image/png")
        }) {
            warn!("⚠️ Crop upload failed for {}: {}", crop_path, e);
        }

        match self.policy.run("upload frame", || {
            self.store
                .upload_image(&frame_path, &debug.frame_jpeg, "image/jpeg")
        }) {
            Ok(()) => Some(frame_path),
            Err(e) => {
                warn!("⚠️ Frame upload failed for {}: {}", frame_path, e);
                None
            }
        }
    }
}

/// `{source_id}/{timestamp}.jpg`
pub fn frame_path(source_id: &str, timestamp: f64) -> String {
    format!("{}/{}.jpg", source_id, timestamp)
}

/// `a/b/120.jpg` -> `a/b/ocr_debug/120.png`
fn ocr_debug_path(frame_path: &str) -> String {
    let (dir, file) = match frame_path.rsplit_once('/') {
        Some((dir, file)) => (format!("{dir}/"), file),
        None => (String::new(), frame_path),
    };
    let stem = file.strip_suffix(".jpg").unwrap_or(file);
    format!("{dir}ocr_debug/{stem}.png")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DebugArtifacts, Rank, RightBound};
    use crate::core::store::MemoryStore;

    fn result(t: f64, debug: bool) -> DetectionResult {
        DetectionResult {
            chunk_id: "chunk-1".to_string(),
            vod_id: "vod-1".to_string(),
            source_id: "2451234567".to_string(),
            timestamp: t,
            rank: Rank::Gold,
            username: format!("player_{t}"),
            confidence: 0.9,
            emblem_confidence: 0.8,
            right_bound: RightBound::Detected,
            truncated: false,
            no_right_edge: false,
            debug: debug.then(|| DebugArtifacts {
                frame_jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
                crop_png: vec![0x89, b'P', b'N', b'G'],
            }),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_full_batch_persists() {
        let store = Arc::new(MemoryStore::new());
        let mut batcher = ResultBatcher::with_policy(store.clone(), 2, fast_policy());

        assert_eq!(batcher.push(result(5.0, false)), None);
        assert_eq!(batcher.push(result(20.0, false)), Some(BatchOutcome::Persisted(2)));
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(store.detections("chunk-1").len(), 2);
    }

    #[test]
    fn test_transient_failures_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_inserts(2);
        let batcher = ResultBatcher::with_policy(store.clone(), 10, fast_policy());

        let outcome = batcher.persist(&[result(5.0, false)]);
        assert_eq!(outcome, BatchOutcome::Persisted(1));
        assert_eq!(store.insert_calls(), 3);
    }

    #[test]
    fn test_exhausted_retries_drop_batch_only() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_inserts(3);
        let mut batcher = ResultBatcher::with_policy(store.clone(), 1, fast_policy());

        assert_eq!(batcher.push(result(5.0, false)), Some(BatchOutcome::Dropped(1)));
        assert!(store.detections("chunk-1").is_empty());

        // later batches are unaffected
        assert_eq!(batcher.push(result(20.0, false)), Some(BatchOutcome::Persisted(1)));
        assert_eq!(store.detections("chunk-1").len(), 1);
    }

    #[test]
    fn test_stale_partial_batch() {
        let store = Arc::new(MemoryStore::new());
        let mut batcher = ResultBatcher::with_policy(store.clone(), 10, fast_policy());

        assert_eq!(batcher.flush_if_stale(Duration::ZERO), None);
        batcher.push(result(5.0, false));
        assert_eq!(batcher.flush_if_stale(Duration::from_secs(3600)), None);
        assert_eq!(
            batcher.flush_if_stale(Duration::ZERO),
            Some(BatchOutcome::Persisted(1))
        );
    }

    #[test]
    fn test_debug_images_uploaded_and_purged() {
        let store = Arc::new(MemoryStore::new());
        let mut batcher = ResultBatcher::with_policy(store.clone(), 1, fast_policy());

        batcher.push(result(120.0, true));
        let records = store.detections("chunk-1");
        assert_eq!(records[0].storage_path.as_deref(), Some("2451234567/120.jpg"));
        assert!(store.image("2451234567/120.jpg").is_some());
        assert!(store.image("2451234567/ocr_debug/120.png").is_some());

        let summary = batcher.purge_chunk("chunk-1").unwrap();
        assert_eq!(summary.detections, 1);
        assert_eq!(summary.images, 2);
        assert_eq!(store.image_count(), 0);
        assert!(store.detections("chunk-1").is_empty());
    }

    #[test]
    fn test_purge_retries_delete() {
        let store = Arc::new(MemoryStore::new());
        store.insert_detections(&[DetectionRecord::from_result(&result(5.0, false), None)]).unwrap();
        store.fail_next_deletes(1);
        let batcher = ResultBatcher::with_policy(store.clone(), 10, fast_policy());

        assert_eq!(batcher.purge_chunk("chunk-1").unwrap().detections, 1);
    }

    #[test]
    fn test_ocr_debug_path() {
        assert_eq!(ocr_debug_path("123/45.5.jpg"), "123/ocr_debug/45.5.png");
        assert_eq!(frame_path("123", 120.0), "123/120.jpg");
    }
}
