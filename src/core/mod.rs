//! 核心模块 - 配置、数据模型、视频输入与结果存储

pub mod config;
pub mod error;
pub mod model;
pub mod store;
pub mod video;

pub use config::{ConfigError, SfotConfig};
pub use error::SfotError;
pub use model::{
    BoundingBox, Chunk, ChunkStatus, CropPlan, DebugArtifacts, DetectionResult, EmblemMatch,
    Rank, RightBound,
};
