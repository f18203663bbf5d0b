//! Worker configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. Geometric thresholds were tuned by hand against recorded broadcasts
//! and are kept overridable rather than derived.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::frame_extractor::MatchStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] json5::Error),
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("Template error: {0}")]
    Template(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SfotConfig {
    pub processing: ProcessingConfig,
    pub detection: DetectionConfig,
    pub search: SearchConfig,
    pub source: SourceConfig,
    pub ocr: OcrConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Sampled frames per second of recording.
    pub frame_rate: f64,
    pub frame_queue_capacity: usize,
    pub result_queue_capacity: usize,
    /// Queue poll timeout; bounds how long a stage takes to notice shutdown.
    pub poll_interval_ms: u64,
    /// A partial batch older than this is persisted anyway.
    pub batch_flush_interval_secs: u64,
    pub progress_interval_secs: u64,
    pub stage_join_timeout_secs: u64,
    pub read_chunk_size: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            frame_rate: 0.2,
            frame_queue_capacity: 100,
            result_queue_capacity: 256,
            poll_interval_ms: 500,
            batch_flush_interval_secs: 30,
            progress_interval_secs: 10,
            stage_join_timeout_secs: 30,
            read_chunk_size: 4096,
        }
    }
}

impl ProcessingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_secs(self.batch_flush_interval_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn stage_join_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_join_timeout_secs)
    }

    /// Seconds of recording between two sampled frames.
    pub fn sampling_period(&self) -> f64 {
        1.0 / self.frame_rate
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub templates_dir: PathBuf,
    /// Template set suffix, e.g. `480p`.
    pub resolution: String,
    pub emblem_threshold: f32,
    pub emblem_strategy: MatchStrategy,
    pub right_edge_threshold: f32,
    pub right_edge_strategy: MatchStrategy,
    pub min_interval_seconds: u64,
    /// Allowed band for the emblem centroid, as fractions of frame height.
    pub centroid_band: [f32; 2],
    /// Minimum emblem height as a fraction of frame height.
    pub min_height_ratio: f32,
    /// Fraction of frame height stripped from both top and bottom of the crop.
    pub crop_margin_ratio: f32,
    pub min_crop_width: u32,
    pub min_crop_height: u32,
    /// Right boundary (fraction of frame width) to fall back on when the
    /// right edge is not found.
    pub fallback_boundary_pct: Option<f32>,
    /// Crop width past the emblem, as a fraction of frame width, when neither
    /// an edge nor a fallback boundary is available.
    pub heuristic_width_ratio: f32,
    pub min_username_len: usize,
    pub max_username_len: usize,
    pub debug_artifacts: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("templates"),
            resolution: "480p".to_string(),
            emblem_threshold: 0.7,
            emblem_strategy: MatchStrategy::ZeroMeanCrossCorrelation,
            right_edge_threshold: 0.7,
            right_edge_strategy: MatchStrategy::MaskedSquaredDifference,
            min_interval_seconds: 10,
            centroid_band: [0.2, 0.8],
            min_height_ratio: 0.8,
            crop_margin_ratio: 0.1,
            min_crop_width: 20,
            min_crop_height: 8,
            fallback_boundary_pct: None,
            heuristic_width_ratio: 0.35,
            min_username_len: 1,
            max_username_len: 25,
            debug_artifacts: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    pub candidates: usize,
    pub high_confidence: f32,
    /// Candidate spacing exponent; above 1.0 packs candidates near the
    /// fallback boundary.
    pub spacing_exponent: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            candidates: 15,
            high_confidence: 0.85,
            spacing_exponent: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub streamlink_path: String,
    pub ffmpeg_path: String,
    /// `{id}` is replaced with the chunk's source id.
    pub vod_url_template: String,
    pub default_stream: String,
    pub retry_streams_secs: u32,
    pub retry_max: u32,
    pub keyframes_only: bool,
    pub ffmpeg_loglevel: String,
    /// Extra ffmpeg filter applied after sampling, e.g. `crop=640:100:0:380`.
    pub crop_filter: Option<String>,
    pub startup_timeout_secs: u64,
    pub terminate_grace_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            streamlink_path: "streamlink".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            vod_url_template: "https://twitch.tv/videos/{id}".to_string(),
            default_stream: "480p".to_string(),
            retry_streams_secs: 5,
            retry_max: 3,
            keyframes_only: false,
            ffmpeg_loglevel: "error".to_string(),
            crop_filter: None,
            startup_timeout_secs: 2,
            terminate_grace_secs: 5,
        }
    }
}

impl SourceConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub tesseract_path: String,
    pub lang: String,
    pub psm: u8,
    pub char_whitelist: Option<String>,
    pub upscale: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            tesseract_path: "tesseract".to_string(),
            lang: "eng".to_string(),
            psm: 7,
            char_whitelist: Some(
                "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-.".to_string(),
            ),
            upscale: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: Option<String>,
    pub secret_key: Option<String>,
    /// Postgres schema, e.g. `test` for dry runs against a test schema.
    pub schema: Option<String>,
    pub storage_bucket: String,
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret_key: None,
            schema: None,
            storage_bucket: "detections".to_string(),
            batch_size: 10,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SfotConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json5(&text)
    }

    pub fn from_json5(text: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(text)?)
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("SUPABASE_URL") {
            self.store.url = Some(url);
        }
        if let Some(key) = var("SUPABASE_SECRET_KEY") {
            self.store.secret_key = Some(key);
        }
        if let Some(dir) = var("SFOT_TEMPLATES_DIR") {
            self.detection.templates_dir = PathBuf::from(dir);
        }
        if let Some(level) = var("SFOT_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.processing;
        if !(p.frame_rate > 0.0 && p.frame_rate.is_finite()) {
            return Err(out_of_range("processing.frame_rate", p.frame_rate, "> 0"));
        }
        at_least_one("processing.frame_queue_capacity", p.frame_queue_capacity)?;
        at_least_one("processing.result_queue_capacity", p.result_queue_capacity)?;
        at_least_one("processing.read_chunk_size", p.read_chunk_size)?;
        if p.poll_interval_ms == 0 {
            return Err(out_of_range("processing.poll_interval_ms", 0, ">= 1"));
        }
        if p.progress_interval_secs == 0 {
            return Err(out_of_range("processing.progress_interval_secs", 0, ">= 1"));
        }

        let d = &self.detection;
        unit("detection.emblem_threshold", d.emblem_threshold)?;
        unit("detection.right_edge_threshold", d.right_edge_threshold)?;
        unit("detection.min_height_ratio", d.min_height_ratio)?;
        let [band_lo, band_hi] = d.centroid_band;
        unit("detection.centroid_band[0]", band_lo)?;
        unit("detection.centroid_band[1]", band_hi)?;
        if band_lo > band_hi {
            return Err(out_of_range(
                "detection.centroid_band",
                format!("[{band_lo}, {band_hi}]"),
                "lower <= upper",
            ));
        }
        if !(0.0..0.5).contains(&d.crop_margin_ratio) {
            return Err(out_of_range(
                "detection.crop_margin_ratio",
                d.crop_margin_ratio,
                "[0, 0.5)",
            ));
        }
        if let Some(pct) = d.fallback_boundary_pct {
            unit("detection.fallback_boundary_pct", pct)?;
        }
        if !(d.heuristic_width_ratio > 0.0 && d.heuristic_width_ratio <= 1.0) {
            return Err(out_of_range(
                "detection.heuristic_width_ratio",
                d.heuristic_width_ratio,
                "(0, 1]",
            ));
        }
        at_least_one("detection.min_username_len", d.min_username_len)?;
        if d.max_username_len < d.min_username_len {
            return Err(out_of_range(
                "detection.max_username_len",
                d.max_username_len,
                ">= min_username_len",
            ));
        }

        let s = &self.search;
        at_least_one("search.candidates", s.candidates)?;
        unit("search.high_confidence", s.high_confidence)?;
        if !(s.spacing_exponent > 0.0 && s.spacing_exponent.is_finite()) {
            return Err(out_of_range(
                "search.spacing_exponent",
                s.spacing_exponent,
                "> 0",
            ));
        }

        if self.ocr.upscale == 0 {
            return Err(out_of_range("ocr.upscale", 0, ">= 1"));
        }

        at_least_one("store.batch_size", self.store.batch_size)?;
        if self.store.retry_attempts == 0 {
            return Err(out_of_range("store.retry_attempts", 0, ">= 1"));
        }

        Ok(())
    }
}

fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        expected,
    }
}

fn unit(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(field, value, "[0, 1]"))
    }
}

fn at_least_one(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(out_of_range(field, value, ">= 1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SfotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.processing.sampling_period(), 5.0);
        assert_eq!(config.detection.centroid_band, [0.2, 0.8]);
        assert_eq!(config.search.candidates, 15);
    }

    #[test]
    fn test_partial_json5_keeps_defaults() {
        let config = SfotConfig::from_json5(
            r#"{
                // only override what changes
                detection: { emblem_threshold: 0.55, fallback_boundary_pct: 0.62 },
                store: { batch_size: 25 },
            }"#,
        )
        .unwrap();

        assert_eq!(config.detection.emblem_threshold, 0.55);
        assert_eq!(config.detection.fallback_boundary_pct, Some(0.62));
        assert_eq!(config.detection.min_interval_seconds, 10);
        assert_eq!(config.store.batch_size, 25);
        assert_eq!(config.store.retry_attempts, 3);
    }

    #[test]
    fn test_strategy_names_parse() {
        let config = SfotConfig::from_json5(
            r#"{ detection: { emblem_strategy: "normalized_cross_correlation" } }"#,
        )
        .unwrap();
        assert_eq!(
            config.detection.emblem_strategy,
            MatchStrategy::NormalizedCrossCorrelation
        );
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = SfotConfig::default();
        config.detection.emblem_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "detection.emblem_threshold",
                ..
            }
        ));
    }

    #[test]
    fn test_inverted_band_rejected() {
        let mut config = SfotConfig::default();
        config.detection.centroid_band = [0.8, 0.2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_margin_must_leave_rows() {
        let mut config = SfotConfig::default();
        config.detection.crop_margin_ratio = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = SfotConfig::default();
        config.processing.frame_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_progress_interval_rejected() {
        let mut config = SfotConfig::default();
        config.processing.progress_interval_secs = 0;
        match config.validate() {
            Err(ConfigError::OutOfRange { field, .. }) => {
                assert_eq!(field, "processing.progress_interval_secs")
            }
            other => panic!("expected out of range, got {:?}", other),
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SfotConfig::default();
        config.apply_vars(|key| match key {
            "SUPABASE_URL" => Some("https://example.supabase.co".to_string()),
            "SFOT_TEMPLATES_DIR" => Some("/opt/templates".to_string()),
            _ => None,
        });
        assert_eq!(
            config.store.url.as_deref(),
            Some("https://example.supabase.co")
        );
        assert_eq!(config.detection.templates_dir, PathBuf::from("/opt/templates"));
        assert!(config.store.secret_key.is_none());
    }

    #[test]
    fn test_parse_error_reported() {
        let err = SfotConfig::from_json5("{ processing: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
