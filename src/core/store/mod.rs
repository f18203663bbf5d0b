//! 结果存储 - 检测记录、图片与分块状态

pub mod batcher;
pub mod memory;
pub mod supabase;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::model::{Chunk, ChunkStatus, DetectionResult, Rank, RightBound};

pub use batcher::{frame_path, BatchOutcome, PurgeSummary, ResultBatcher, RetryPolicy};
pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{operation} returned {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A detection row as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub vod_id: String,
    pub chunk_id: String,
    pub frame_time_seconds: f64,
    pub username: String,
    pub confidence: f32,
    pub rank: Rank,
    pub right_bound: RightBound,
    pub truncated: bool,
    pub no_right_edge: bool,
    pub storage_path: Option<String>,
}

impl DetectionRecord {
    pub fn from_result(result: &DetectionResult, storage_path: Option<String>) -> Self {
        Self {
            vod_id: result.vod_id.clone(),
            chunk_id: result.chunk_id.clone(),
            frame_time_seconds: result.timestamp,
            username: result.username.clone(),
            confidence: result.confidence,
            rank: result.rank,
            right_bound: result.right_bound,
            truncated: result.truncated,
            no_right_edge: result.no_right_edge,
            storage_path,
        }
    }
}

/// The parts of an existing detection needed to purge it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredDetection {
    #[serde(default)]
    pub storage_path: Option<String>,
}

/// Partial chunk update; unset fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkUpdate {
    pub status: ChunkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detections_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl ChunkUpdate {
    pub fn new(status: ChunkStatus) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            status,
            attempt_count: None,
            frames_processed: None,
            detections_count: None,
            last_error: None,
            started_at: (status == ChunkStatus::Processing).then(|| now.clone()),
            completed_at: (status == ChunkStatus::Completed).then(|| now.clone()),
            updated_at: now,
        }
    }

    pub fn with_attempt(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn with_counts(mut self, frames_processed: u64, detections_count: u64) -> Self {
        self.frames_processed = Some(frames_processed);
        self.detections_count = Some(detections_count);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Durable home of detections, their images, and chunk status.
pub trait BackingStore: Send + Sync {
    fn fetch_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, StoreError>;

    fn list_detections(&self, chunk_id: &str) -> Result<Vec<StoredDetection>, StoreError>;

    /// Delete every detection recorded for the chunk; returns how many.
    fn delete_detections(&self, chunk_id: &str) -> Result<usize, StoreError>;

    fn insert_detections(&self, records: &[DetectionRecord]) -> Result<(), StoreError>;

    fn upload_image(&self, path: &str, bytes: &[u8], content_type: &str)
        -> Result<(), StoreError>;

    fn delete_images(&self, paths: &[String]) -> Result<(), StoreError>;

    fn update_chunk(&self, chunk_id: &str, update: &ChunkUpdate) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_update_serializes_only_set_fields() {
        let update = ChunkUpdate::new(ChunkStatus::Pending).with_error("interrupted");
        let json = serde_json::to_value(&update).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["last_error"], "interrupted");
        assert!(json.get("attempt_count").is_none());
        assert!(json.get("completed_at").is_none());
        assert!(json.get("started_at").is_none());
        assert!(json["updated_at"].is_string());
    }

    #[test]
    fn test_status_timestamps() {
        assert!(ChunkUpdate::new(ChunkStatus::Processing).started_at.is_some());
        assert!(ChunkUpdate::new(ChunkStatus::Completed).completed_at.is_some());
        assert!(ChunkUpdate::new(ChunkStatus::Failed).completed_at.is_none());
    }
}
