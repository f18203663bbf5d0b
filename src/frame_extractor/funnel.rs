//! 单帧检测漏斗
//!
//! Each frame runs through a fixed sequence of checks: decode, emblem match,
//! geometry, rate limit, right bound, crop, recognition, username cleaning.
//! The first check that fails decides the outcome; most frames are rejected.

use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::config::{DetectionConfig, SfotConfig};
use crate::core::error::SfotError;
use crate::core::model::{
    BoundingBox, Chunk, CropPlan, DebugArtifacts, DetectionResult, EmblemMatch, RightBound,
};
use crate::core::video::{encode_png, DecodedFrame, RawFrame};
use crate::frame_extractor::crop_search::{AdaptiveCropSearch, SearchWindow};
use crate::frame_extractor::emblem::{EmblemDetector, TemplateEmblemDetector};
use crate::frame_extractor::right_edge::{RightEdgeDetector, TemplateRightEdgeDetector};
use crate::frame_extractor::text_recognizer::{
    best_span, TesseractRecognizer, TextRecognizer, TextSpan,
};

static USERNAME_DISALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("static regex"));

/// Immutable detection capabilities shared for one chunk run.
#[derive(Clone)]
pub struct DetectionServices {
    pub emblem: Arc<dyn EmblemDetector>,
    pub right_edge: Arc<dyn RightEdgeDetector>,
    pub recognizer: Arc<dyn TextRecognizer>,
}

impl DetectionServices {
    pub fn new(
        emblem: Arc<dyn EmblemDetector>,
        right_edge: Arc<dyn RightEdgeDetector>,
        recognizer: Arc<dyn TextRecognizer>,
    ) -> Self {
        Self {
            emblem,
            right_edge,
            recognizer,
        }
    }

    pub fn from_config(config: &SfotConfig) -> Result<Self, SfotError> {
        Ok(Self {
            emblem: Arc::new(TemplateEmblemDetector::from_config(&config.detection)?),
            right_edge: Arc::new(TemplateRightEdgeDetector::from_config(&config.detection)?),
            recognizer: Arc::new(TesseractRecognizer::new(config.ocr.clone())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Decode,
    NoEmblem,
    Geometry,
    RateLimited,
    CropTooSmall,
    Recognition,
    NoText,
    InvalidUsername,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Decode => "decode",
            RejectReason::NoEmblem => "no_emblem",
            RejectReason::Geometry => "geometry",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::CropTooSmall => "crop_too_small",
            RejectReason::Recognition => "recognition",
            RejectReason::NoText => "no_text",
            RejectReason::InvalidUsername => "invalid_username",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunnelOutcome {
    Accepted(DetectionResult),
    Rejected(RejectReason),
}

impl FunnelOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FunnelOutcome::Accepted(_))
    }
}

pub struct DetectionFunnel {
    services: DetectionServices,
    config: DetectionConfig,
    search: Option<AdaptiveCropSearch>,
    chunk_id: String,
    vod_id: String,
    source_id: String,
    /// Recording time of the last accepted detection.
    last_accepted: Option<f64>,
}

impl DetectionFunnel {
    pub fn new(services: DetectionServices, config: &SfotConfig, chunk: &Chunk) -> Self {
        let search = config.search.enabled.then(|| {
            AdaptiveCropSearch::new(config.search.clone(), config.detection.min_crop_width)
        });
        Self {
            services,
            config: config.detection.clone(),
            search,
            chunk_id: chunk.id.clone(),
            vod_id: chunk.vod_id.clone(),
            source_id: chunk.source_id.clone(),
            last_accepted: None,
        }
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }

    pub fn process(&mut self, frame: &RawFrame, timestamp: f64) -> FunnelOutcome {
        match self.evaluate(frame, timestamp) {
            Ok(result) => {
                self.last_accepted = Some(timestamp);
                FunnelOutcome::Accepted(result)
            }
            Err(reason) => FunnelOutcome::Rejected(reason),
        }
    }

    fn evaluate(&self, frame: &RawFrame, timestamp: f64) -> Result<DetectionResult, RejectReason> {
        let decoded = frame.decode().map_err(|e| {
            debug!("frame {} failed to decode: {}", frame.index, e);
            RejectReason::Decode
        })?;

        let emblem = self
            .services
            .emblem
            .detect(&decoded)
            .ok_or(RejectReason::NoEmblem)?;

        if !validate_geometry(&emblem.bbox, decoded.width(), decoded.height(), &self.config) {
            return Err(RejectReason::Geometry);
        }

        if let Some(last) = self.last_accepted {
            if timestamp - last < self.config.min_interval_seconds as f64 {
                return Err(RejectReason::RateLimited);
            }
        }

        let (plan, searched_span) = self.plan_crop(&decoded, &emblem);
        if plan.width() < self.config.min_crop_width || plan.height() < self.config.min_crop_height
        {
            return Err(RejectReason::CropTooSmall);
        }
        let crop = decoded.crop(plan.left, plan.top, plan.width(), plan.height());

        let span = match searched_span {
            Some(span) => span,
            None => {
                let spans = self.services.recognizer.recognize(&crop).map_err(|e| {
                    warn!("⚠️ OCR failed on frame {}: {}", frame.index, e);
                    RejectReason::Recognition
                })?;
                best_span(&spans).cloned().ok_or(RejectReason::NoText)?
            }
        };

        let username = clean_username(
            &span.text,
            self.config.min_username_len,
            self.config.max_username_len,
        )
        .ok_or(RejectReason::InvalidUsername)?;

        let debug = if self.config.debug_artifacts {
            debug_artifacts(frame, &crop)
        } else {
            None
        };

        debug!(
            "✅ t={} {} {:?} ({:.2}, {:?})",
            timestamp, emblem.rank, username, span.confidence, plan.right_bound
        );
        Ok(DetectionResult {
            chunk_id: self.chunk_id.clone(),
            vod_id: self.vod_id.clone(),
            source_id: self.source_id.clone(),
            timestamp,
            rank: emblem.rank,
            username,
            confidence: span.confidence,
            emblem_confidence: emblem.confidence,
            right_bound: plan.right_bound,
            truncated: plan.right_bound.is_truncated(),
            no_right_edge: plan.right_bound == RightBound::Heuristic,
            debug,
        })
    }

    /// Decide the crop rectangle. A successful search also hands back the
    /// text it already read.
    fn plan_crop(
        &self,
        frame: &DecodedFrame,
        emblem: &EmblemMatch,
    ) -> (CropPlan, Option<TextSpan>) {
        let (width, height) = (frame.width(), frame.height());
        let left = emblem.bbox.right().min(width);
        let margin = (self.config.crop_margin_ratio * height as f32).round() as u32;
        let top = margin.min(height);
        let bottom = height.saturating_sub(margin).max(top);
        let plan = |right: u32, right_bound: RightBound| CropPlan {
            left,
            right: right.min(width),
            top,
            bottom,
            right_bound,
        };

        if let Some(edge) = self.services.right_edge.detect(frame, emblem) {
            if edge.x > left {
                return (plan(edge.x, RightBound::Detected), None);
            }
            debug!("right edge x={} not right of emblem x={}", edge.x, left);
        }

        if let Some(pct) = self.config.fallback_boundary_pct {
            let fallback_x = ((pct * width as f32).round() as u32).min(width);
            if let Some(search) = &self.search {
                let window = SearchWindow {
                    left,
                    top,
                    bottom,
                    fallback_x,
                };
                if let Some(outcome) =
                    search.search(frame, window, self.services.recognizer.as_ref())
                {
                    return (plan(outcome.right, RightBound::Searched), Some(outcome.span));
                }
            }
            return (plan(fallback_x, RightBound::Fallback), None);
        }

        let extra = (self.config.heuristic_width_ratio * width as f32).round() as u32;
        (plan(left.saturating_add(extra), RightBound::Heuristic), None)
    }
}

/// Emblem must be non-empty, centred inside the frame within the vertical
/// band, and tall enough relative to the frame.
pub fn validate_geometry(
    bbox: &BoundingBox,
    frame_width: u32,
    frame_height: u32,
    config: &DetectionConfig,
) -> bool {
    if bbox.width == 0 || bbox.height == 0 || frame_height == 0 {
        return false;
    }
    let (cx, cy) = bbox.centroid();
    let (w, h) = (frame_width as f32, frame_height as f32);
    if !(0.0..w).contains(&cx) || !(0.0..h).contains(&cy) {
        return false;
    }
    let [band_lo, band_hi] = config.centroid_band;
    if cy < band_lo * h || cy > band_hi * h {
        return false;
    }
    bbox.height as f32 >= config.min_height_ratio * h
}

/// Strip everything outside `[A-Za-z0-9_.-]`; `None` when the rest is not
/// within the length bounds.
pub fn clean_username(raw: &str, min_len: usize, max_len: usize) -> Option<String> {
    let cleaned = USERNAME_DISALLOWED.replace_all(raw, "").into_owned();
    let len = cleaned.chars().count();
    (len > 0 && len >= min_len && len <= max_len).then_some(cleaned)
}

fn debug_artifacts(frame: &RawFrame, crop: &image::GrayImage) -> Option<DebugArtifacts> {
    match encode_png(crop) {
        Ok(crop_png) => Some(DebugArtifacts {
            frame_jpeg: frame.data.clone(),
            crop_png,
        }),
        Err(e) => {
            warn!("⚠️ Could not encode debug crop: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ChunkStatus, Rank};
    use crate::core::video::encode_jpeg;
    use crate::frame_extractor::emblem::MockEmblemDetector;
    use crate::frame_extractor::right_edge::MockRightEdgeDetector;
    use crate::frame_extractor::text_recognizer::MockTextRecognizer;
    use image::{GrayImage, Luma};
    use std::sync::Mutex;

    fn chunk() -> Chunk {
        Chunk {
            id: "chunk-1".to_string(),
            vod_id: "vod-1".to_string(),
            source_id: "2451234567".to_string(),
            start_seconds: 0,
            end_seconds: 600,
            status: ChunkStatus::Processing,
            attempt_count: 1,
            frames_processed: 0,
            detections_count: 0,
        }
    }

    fn raw_frame(index: u64) -> RawFrame {
        let gray = GrayImage::from_pixel(640, 100, Luma([90]));
        RawFrame::new(index, encode_jpeg(&gray, 90).unwrap())
    }

    fn gold_at(bbox: BoundingBox) -> EmblemMatch {
        EmblemMatch {
            rank: Rank::Gold,
            bbox,
            confidence: 0.88,
        }
    }

    fn services(
        emblem: MockEmblemDetector,
        edge: MockRightEdgeDetector,
        recognizer: MockTextRecognizer,
    ) -> DetectionServices {
        DetectionServices::new(Arc::new(emblem), Arc::new(edge), Arc::new(recognizer))
    }

    fn funnel_with(services: DetectionServices, config: SfotConfig) -> DetectionFunnel {
        DetectionFunnel::new(services, &config, &chunk())
    }

    fn standard_funnel() -> DetectionFunnel {
        funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::fixed(400, 0.9),
                MockTextRecognizer::fixed("Player_One", 0.93),
            ),
            SfotConfig::default(),
        )
    }

    fn accepted(outcome: FunnelOutcome) -> DetectionResult {
        match outcome {
            FunnelOutcome::Accepted(result) => result,
            FunnelOutcome::Rejected(reason) => panic!("rejected: {reason:?}"),
        }
    }

    #[test]
    fn test_nameplate_with_detected_edge() {
        let crop_widths = Arc::new(Mutex::new(Vec::new()));
        let seen = crop_widths.clone();
        let recognizer = MockTextRecognizer::with_pattern(move |crop| {
            seen.lock().unwrap().push(crop.dimensions());
            vec![TextSpan::new("Player_One", 0.93)]
        });
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::fixed(400, 0.9),
                recognizer,
            ),
            SfotConfig::default(),
        );

        let result = accepted(funnel.process(&raw_frame(24), 120.0));
        assert_eq!(result.rank, Rank::Gold);
        assert_eq!(result.username, "Player_One");
        assert_eq!(result.confidence, 0.93);
        assert_eq!(result.timestamp, 120.0);
        assert_eq!(result.right_bound, RightBound::Detected);
        assert!(!result.truncated);
        assert!(!result.no_right_edge);
        assert!(result.debug.is_none());
        // x in [60, 400], 10% margin top and bottom
        assert_eq!(*crop_widths.lock().unwrap(), vec![(340, 80)]);
    }

    #[test]
    fn test_rate_limit_suppresses_close_frames() {
        let mut funnel = standard_funnel();
        assert!(funnel.process(&raw_frame(0), 100.0).is_accepted());
        assert_eq!(
            funnel.process(&raw_frame(1), 105.0),
            FunnelOutcome::Rejected(RejectReason::RateLimited)
        );
        assert!(funnel.process(&raw_frame(2), 110.0).is_accepted());
        assert_eq!(funnel.last_accepted(), Some(110.0));
    }

    #[test]
    fn test_failed_recognition_does_not_start_rate_limit() {
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::fixed(400, 0.9),
                MockTextRecognizer::new(),
            ),
            SfotConfig::default(),
        );
        assert_eq!(
            funnel.process(&raw_frame(0), 100.0),
            FunnelOutcome::Rejected(RejectReason::NoText)
        );
        assert_eq!(funnel.last_accepted(), None);
    }

    #[test]
    fn test_undecodable_frame_rejected() {
        let mut funnel = standard_funnel();
        let garbage = RawFrame::new(0, vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9]);
        assert_eq!(
            funnel.process(&garbage, 0.0),
            FunnelOutcome::Rejected(RejectReason::Decode)
        );
    }

    #[test]
    fn test_no_emblem_rejected() {
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::new(),
                MockRightEdgeDetector::fixed(400, 0.9),
                MockTextRecognizer::fixed("x", 0.9),
            ),
            SfotConfig::default(),
        );
        assert_eq!(
            funnel.process(&raw_frame(0), 0.0),
            FunnelOutcome::Rejected(RejectReason::NoEmblem)
        );
    }

    #[test]
    fn test_geometry_rules() {
        let config = DetectionConfig::default();
        // centroid y=0
        assert!(!validate_geometry(&BoundingBox::new(10, 0, 50, 0), 640, 100, &config));
        // centred, tall enough
        assert!(validate_geometry(&BoundingBox::new(10, 5, 50, 90), 640, 100, &config));
        // tall enough, off-centre but inside the band
        assert!(validate_geometry(&BoundingBox::new(10, 2, 50, 85), 640, 100, &config));
        // too short
        assert!(!validate_geometry(&BoundingBox::new(10, 20, 50, 60), 640, 100, &config));
        // centroid below the band
        assert!(!validate_geometry(&BoundingBox::new(10, 45, 50, 85), 640, 100, &config));
        // centroid outside the frame horizontally
        assert!(!validate_geometry(&BoundingBox::new(630, 5, 40, 90), 640, 100, &config));
        // empty box
        assert!(!validate_geometry(&BoundingBox::new(10, 5, 0, 90), 640, 100, &config));
    }

    #[test]
    fn test_geometry_rejection_in_funnel() {
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 0, 50, 0))),
                MockRightEdgeDetector::fixed(400, 0.9),
                MockTextRecognizer::fixed("Player_One", 0.93),
            ),
            SfotConfig::default(),
        );
        assert_eq!(
            funnel.process(&raw_frame(0), 0.0),
            FunnelOutcome::Rejected(RejectReason::Geometry)
        );
    }

    #[test]
    fn test_fallback_boundary_without_search() {
        let mut config = SfotConfig::default();
        config.detection.fallback_boundary_pct = Some(0.5);
        config.search.enabled = false;
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::new(),
                MockTextRecognizer::with_pattern(|crop| {
                    assert_eq!(crop.width(), 260);
                    vec![TextSpan::new("Player", 0.8)]
                }),
            ),
            config,
        );

        let result = accepted(funnel.process(&raw_frame(0), 0.0));
        assert_eq!(result.right_bound, RightBound::Fallback);
        assert!(result.truncated);
        assert!(!result.no_right_edge);
    }

    #[test]
    fn test_search_result_reused() {
        let mut config = SfotConfig::default();
        config.detection.fallback_boundary_pct = Some(0.5);
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::new(),
                MockTextRecognizer::with_pattern(|crop| {
                    if crop.width() >= 400 {
                        vec![TextSpan::new("Player_One", 0.91)]
                    } else {
                        vec![TextSpan::new("Player", 0.5)]
                    }
                }),
            ),
            config,
        );

        let result = accepted(funnel.process(&raw_frame(0), 0.0));
        assert_eq!(result.right_bound, RightBound::Searched);
        assert_eq!(result.username, "Player_One");
        assert_eq!(result.confidence, 0.91);
        assert!(result.truncated);
    }

    #[test]
    fn test_heuristic_bound_without_edge_or_fallback() {
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::new(),
                MockTextRecognizer::with_pattern(|crop| {
                    // 60 + 0.35 * 640
                    assert_eq!(crop.width(), 224);
                    vec![TextSpan::new("Player", 0.8)]
                }),
            ),
            SfotConfig::default(),
        );

        let result = accepted(funnel.process(&raw_frame(0), 0.0));
        assert_eq!(result.right_bound, RightBound::Heuristic);
        assert!(result.no_right_edge);
        assert!(!result.truncated);
    }

    #[test]
    fn test_edge_inside_emblem_is_ignored() {
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::fixed(40, 0.95),
                MockTextRecognizer::fixed("Player", 0.8),
            ),
            SfotConfig::default(),
        );
        let result = accepted(funnel.process(&raw_frame(0), 0.0));
        assert_eq!(result.right_bound, RightBound::Heuristic);
    }

    #[test]
    fn test_narrow_crop_rejected() {
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::fixed(70, 0.9),
                MockTextRecognizer::fixed("Player", 0.8),
            ),
            SfotConfig::default(),
        );
        assert_eq!(
            funnel.process(&raw_frame(0), 0.0),
            FunnelOutcome::Rejected(RejectReason::CropTooSmall)
        );
    }

    #[test]
    fn test_invalid_username_rejected() {
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::fixed(400, 0.9),
                MockTextRecognizer::fixed("  @#$ !", 0.97),
            ),
            SfotConfig::default(),
        );
        assert_eq!(
            funnel.process(&raw_frame(0), 0.0),
            FunnelOutcome::Rejected(RejectReason::InvalidUsername)
        );
    }

    #[test]
    fn test_debug_artifacts_attached() {
        let mut config = SfotConfig::default();
        config.detection.debug_artifacts = true;
        let mut funnel = funnel_with(
            services(
                MockEmblemDetector::fixed(gold_at(BoundingBox::new(10, 5, 50, 90))),
                MockRightEdgeDetector::fixed(400, 0.9),
                MockTextRecognizer::fixed("Player_One", 0.93),
            ),
            config,
        );
        let frame = raw_frame(3);
        let result = accepted(funnel.process(&frame, 15.0));
        let debug = result.debug.unwrap();
        assert_eq!(debug.frame_jpeg, frame.data);
        let crop = image::load_from_memory(&debug.crop_png).unwrap();
        assert_eq!((crop.width(), crop.height()), (340, 80));
    }

    #[test]
    fn test_same_input_same_outcome() {
        let frame = raw_frame(7);
        let outcomes: Vec<FunnelOutcome> = (0..3)
            .map(|_| standard_funnel().process(&frame, 35.0))
            .collect();
        assert!(outcomes[0].is_accepted());
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_clean_username() {
        assert_eq!(clean_username("Player_One", 1, 25).as_deref(), Some("Player_One"));
        assert_eq!(clean_username(" x.y-z! ", 1, 25).as_deref(), Some("x.y-z"));
        assert_eq!(clean_username("Plâyer", 1, 25).as_deref(), Some("Plyer"));
        assert_eq!(clean_username("@@", 1, 25), None);
        assert_eq!(clean_username("abc", 4, 25), None);
        assert_eq!(clean_username(&"a".repeat(26), 1, 25), None);
    }
}
