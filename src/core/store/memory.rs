//! In-process store for offline runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::core::model::Chunk;
use crate::core::store::{BackingStore, ChunkUpdate, DetectionRecord, StoreError, StoredDetection};

#[derive(Default)]
struct State {
    chunks: HashMap<String, Chunk>,
    detections: Vec<DetectionRecord>,
    images: HashMap<String, Vec<u8>>,
    updates: Vec<(String, ChunkUpdate)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_inserts: AtomicU32,
    failing_deletes: AtomicU32,
    insert_calls: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(self, chunk: Chunk) -> Self {
        self.lock().chunks.insert(chunk.id.clone(), chunk);
        self
    }

    /// Make the next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` detection deletes fail.
    pub fn fail_next_deletes(&self, count: u32) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn detections(&self, chunk_id: &str) -> Vec<DetectionRecord> {
        self.lock()
            .detections
            .iter()
            .filter(|d| d.chunk_id == chunk_id)
            .cloned()
            .collect()
    }

    pub fn image(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().images.get(path).cloned()
    }

    pub fn image_count(&self) -> usize {
        self.lock().images.len()
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<Chunk> {
        self.lock().chunks.get(chunk_id).cloned()
    }

    /// Every status update written for the chunk, oldest first.
    pub fn updates(&self, chunk_id: &str) -> Vec<ChunkUpdate> {
        self.lock()
            .updates
            .iter()
            .filter(|(id, _)| id == chunk_id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl BackingStore for MemoryStore {
    fn fetch_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, StoreError> {
        Ok(self.chunk(chunk_id))
    }

    fn list_detections(&self, chunk_id: &str) -> Result<Vec<StoredDetection>, StoreError> {
        Ok(self
            .detections(chunk_id)
            .into_iter()
            .map(|d| StoredDetection {
                storage_path: d.storage_path,
            })
            .collect())
    }

    fn delete_detections(&self, chunk_id: &str) -> Result<usize, StoreError> {
        if take_failure(&self.failing_deletes) {
            return Err(StoreError::Unavailable("injected delete failure".to_string()));
        }
        let mut state = self.lock();
        let before = state.detections.len();
        state.detections.retain(|d| d.chunk_id != chunk_id);
        Ok(before - state.detections.len())
    }

    fn insert_detections(&self, records: &[DetectionRecord]) -> Result<(), StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_inserts) {
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }
        self.lock().detections.extend_from_slice(records);
        Ok(())
    }

    fn upload_image(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StoreError> {
        self.lock().images.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete_images(&self, paths: &[String]) -> Result<(), StoreError> {
        let mut state = self.lock();
        for path in paths {
            state.images.remove(path);
        }
        Ok(())
    }

    fn update_chunk(&self, chunk_id: &str, update: &ChunkUpdate) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(chunk) = state.chunks.get_mut(chunk_id) {
            chunk.status = update.status;
            if let Some(attempt) = update.attempt_count {
                chunk.attempt_count = attempt;
            }
            if let Some(frames) = update.frames_processed {
                chunk.frames_processed = frames;
            }
            if let Some(detections) = update.detections_count {
                chunk.detections_count = detections;
            }
        }
        state.updates.push((chunk_id.to_string(), update.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ChunkStatus, Rank, RightBound};

    fn record(chunk_id: &str, t: f64) -> DetectionRecord {
        DetectionRecord {
            vod_id: "vod-1".to_string(),
            chunk_id: chunk_id.to_string(),
            frame_time_seconds: t,
            username: "someone".to_string(),
            confidence: 0.9,
            rank: Rank::Silver,
            right_bound: RightBound::Detected,
            truncated: false,
            no_right_edge: false,
            storage_path: None,
        }
    }

    #[test]
    fn test_delete_scoped_to_chunk() {
        let store = MemoryStore::new();
        store
            .insert_detections(&[record("a", 1.0), record("a", 2.0), record("b", 3.0)])
            .unwrap();

        assert_eq!(store.delete_detections("a").unwrap(), 2);
        assert!(store.detections("a").is_empty());
        assert_eq!(store.detections("b").len(), 1);
    }

    #[test]
    fn test_injected_insert_failures() {
        let store = MemoryStore::new();
        store.fail_next_inserts(2);

        assert!(store.insert_detections(&[record("a", 1.0)]).is_err());
        assert!(store.insert_detections(&[record("a", 1.0)]).is_err());
        assert!(store.insert_detections(&[record("a", 1.0)]).is_ok());
        assert_eq!(store.insert_calls(), 3);
        assert_eq!(store.detections("a").len(), 1);
    }

    #[test]
    fn test_update_applies_to_chunk() {
        let store = MemoryStore::new().with_chunk(Chunk {
            id: "c1".to_string(),
            vod_id: "v1".to_string(),
            source_id: "123".to_string(),
            start_seconds: 0,
            end_seconds: 60,
            status: ChunkStatus::Pending,
            attempt_count: 0,
            frames_processed: 0,
            detections_count: 0,
        });

        let update = ChunkUpdate::new(ChunkStatus::Completed).with_counts(12, 3);
        store.update_chunk("c1", &update).unwrap();

        let chunk = store.chunk("c1").unwrap();
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert_eq!(chunk.frames_processed, 12);
        assert_eq!(chunk.detections_count, 3);
        assert_eq!(store.updates("c1").len(), 1);
    }
}
