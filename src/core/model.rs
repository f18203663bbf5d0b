//! 共享数据模型

use serde::{Deserialize, Serialize};

/// Rank tier shown by the nameplate emblem, in template priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Bronze,
    Silver,
    Gold,
    Diamond,
    Legend,
}

impl Rank {
    pub const ALL: [Rank; 5] = [
        Rank::Bronze,
        Rank::Silver,
        Rank::Gold,
        Rank::Diamond,
        Rank::Legend,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Rank::Bronze => "bronze",
            Rank::Silver => "silver",
            Rank::Gold => "gold",
            Rank::Diamond => "diamond",
            Rank::Legend => "legend",
        }
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned box in decoded-pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn centroid(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmblemMatch {
    pub rank: Rank,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Where the right bound of a nameplate crop came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RightBound {
    /// Matched the nameplate's right-edge template.
    Detected,
    /// Picked by the adaptive crop search.
    Searched,
    /// Configured fallback boundary used as-is.
    Fallback,
    /// Fixed fraction of the frame width past the emblem.
    Heuristic,
}

impl RightBound {
    /// True when the bound did not come from a direct edge match.
    pub fn is_truncated(self) -> bool {
        matches!(self, RightBound::Searched | RightBound::Fallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlan {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
    pub right_bound: RightBound,
}

impl CropPlan {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Encoded images kept alongside a detection for later inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugArtifacts {
    /// The frame exactly as it came out of the demuxer (JPEG).
    pub frame_jpeg: Vec<u8>,
    /// The crop handed to the text recognizer (PNG).
    pub crop_png: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub chunk_id: String,
    pub vod_id: String,
    pub source_id: String,
    /// Seconds from the start of the recording.
    pub timestamp: f64,
    pub rank: Rank,
    pub username: String,
    pub confidence: f32,
    pub emblem_confidence: f32,
    pub right_bound: RightBound,
    pub truncated: bool,
    pub no_right_edge: bool,
    pub debug: Option<DebugArtifacts>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

/// One time range of one recording, assigned to a single worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Store-side id of the recording.
    pub vod_id: String,
    /// Platform id of the recording, used to build the stream URL.
    pub source_id: String,
    pub start_seconds: u64,
    pub end_seconds: u64,
    pub status: ChunkStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub frames_processed: u64,
    #[serde(default)]
    pub detections_count: u64,
}

impl Chunk {
    pub fn duration_seconds(&self) -> u64 {
        self.end_seconds.saturating_sub(self.start_seconds)
    }
}
