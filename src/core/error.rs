use thiserror::Error;

use crate::core::config::ConfigError;
use crate::core::store::StoreError;
use crate::core::video::SourceError;
use crate::frame_extractor::OcrError;

#[derive(Debug, Error)]
pub enum SfotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Video source error: {0}")]
    Source(#[from] SourceError),
    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),
}
