use std::path::Path;

use log::{debug, info, warn};

use crate::core::config::{ConfigError, DetectionConfig};
use crate::core::model::{EmblemMatch, Rank};
use crate::core::video::DecodedFrame;
use crate::frame_extractor::matcher::{matcher_for, MatchStrategy, Template, TemplateMatcher};

pub trait EmblemDetector: Send + Sync {
    /// Best rank emblem in the frame at or above the detector's threshold.
    fn detect(&self, frame: &DecodedFrame) -> Option<EmblemMatch>;
}

/// 段位徽章检测器，按段位优先级依次匹配模板
pub struct TemplateEmblemDetector {
    templates: Vec<(Rank, Template)>,
    matcher: Box<dyn TemplateMatcher>,
    threshold: f32,
}

impl TemplateEmblemDetector {
    pub fn new(
        templates: Vec<(Rank, Template)>,
        matcher: Box<dyn TemplateMatcher>,
        threshold: f32,
    ) -> Self {
        Self {
            templates,
            matcher,
            threshold,
        }
    }

    /// Load `{rank}_{resolution}.png` for every rank found in `dir`.
    pub fn from_dir(
        dir: &Path,
        resolution: &str,
        strategy: MatchStrategy,
        threshold: f32,
    ) -> Result<Self, ConfigError> {
        let mut templates = Vec::new();
        for rank in Rank::ALL {
            let path = dir.join(format!("{}_{}.png", rank, resolution));
            match Template::load(&path) {
                Ok(template) => templates.push((rank, template)),
                Err(e) => warn!("⚠️ Skipping {} emblem template {}: {}", rank, path.display(), e),
            }
        }
        if templates.is_empty() {
            return Err(ConfigError::Template(format!(
                "no emblem templates for {} in {}",
                resolution,
                dir.display()
            )));
        }
        info!(
            "🏅 Loaded {} emblem templates ({:?}, threshold {})",
            templates.len(),
            strategy,
            threshold
        );
        Ok(Self::new(templates, matcher_for(strategy), threshold))
    }

    pub fn from_config(config: &DetectionConfig) -> Result<Self, ConfigError> {
        Self::from_dir(
            &config.templates_dir,
            &config.resolution,
            config.emblem_strategy,
            config.emblem_threshold,
        )
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }
}

impl EmblemDetector for TemplateEmblemDetector {
    fn detect(&self, frame: &DecodedFrame) -> Option<EmblemMatch> {
        let mut best: Option<EmblemMatch> = None;
        for (rank, template) in &self.templates {
            let Some(hit) = self.matcher.best_match(&frame.gray, template) else {
                continue;
            };
            // strict: equal scores keep the higher-priority rank
            if best.map_or(true, |b| hit.confidence > b.confidence) {
                best = Some(EmblemMatch {
                    rank: *rank,
                    bbox: hit.bbox(),
                    confidence: hit.confidence,
                });
            }
        }

        let best = best?;
        if best.confidence >= self.threshold {
            Some(best)
        } else {
            debug!("best emblem {} at {:.3} below threshold", best.rank, best.confidence);
            None
        }
    }
}

pub struct MockEmblemDetector {
    pattern: Option<Box<dyn Fn(&DecodedFrame) -> Option<EmblemMatch> + Send + Sync>>,
}

impl MockEmblemDetector {
    pub fn new() -> Self {
        Self { pattern: None }
    }

    pub fn with_pattern<F>(pattern: F) -> Self
    where
        F: Fn(&DecodedFrame) -> Option<EmblemMatch> + Send + Sync + 'static,
    {
        Self {
            pattern: Some(Box::new(pattern)),
        }
    }

    pub fn fixed(emblem: EmblemMatch) -> Self {
        Self::with_pattern(move |_| Some(emblem))
    }
}

impl Default for MockEmblemDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl EmblemDetector for MockEmblemDetector {
    fn detect(&self, frame: &DecodedFrame) -> Option<EmblemMatch> {
        self.pattern.as_ref().and_then(|p| p(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::BoundingBox;
    use crate::frame_extractor::matcher::ZeroMeanCrossCorrelation;
    use image::{GrayImage, Luma};

    fn stripes(width: u32, height: u32, period: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            Luma([if (x / period + y / 2) % 2 == 0 { 40 } else { 210 }])
        })
    }

    fn checker(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            Luma([if (x + y) % 3 == 0 { 250 } else { 10 + (x * 7 + y * 13) as u8 % 60 }])
        })
    }

    fn frame_with(patch: &GrayImage, at: (u32, u32)) -> DecodedFrame {
        let mut gray = GrayImage::from_pixel(120, 60, Luma([128]));
        for (x, y, p) in patch.enumerate_pixels() {
            gray.put_pixel(at.0 + x, at.1 + y, *p);
        }
        DecodedFrame { gray }
    }

    #[test]
    fn test_detects_ranked_template() {
        let gold = checker(16);
        let detector = TemplateEmblemDetector::new(
            vec![
                (Rank::Silver, Template::new("silver", stripes(16, 16, 3))),
                (Rank::Gold, Template::new("gold", gold.clone())),
            ],
            Box::new(ZeroMeanCrossCorrelation),
            0.7,
        );

        let found = detector.detect(&frame_with(&gold, (30, 20))).unwrap();
        assert_eq!(found.rank, Rank::Gold);
        assert_eq!(found.bbox, BoundingBox::new(30, 20, 16, 16));
        assert!(found.confidence > 0.99);
    }

    #[test]
    fn test_below_threshold_rejected() {
        let detector = TemplateEmblemDetector::new(
            vec![(Rank::Gold, Template::new("gold", checker(16)))],
            Box::new(ZeroMeanCrossCorrelation),
            0.7,
        );
        let blank = DecodedFrame {
            gray: GrayImage::from_pixel(120, 60, Luma([128])),
        };
        assert!(detector.detect(&blank).is_none());
    }

    #[test]
    fn test_ties_resolve_to_priority_order() {
        let patch = checker(12);
        let detector = TemplateEmblemDetector::new(
            vec![
                (Rank::Bronze, Template::new("bronze", patch.clone())),
                (Rank::Legend, Template::new("legend", patch.clone())),
            ],
            Box::new(ZeroMeanCrossCorrelation),
            0.5,
        );
        let found = detector.detect(&frame_with(&patch, (5, 5))).unwrap();
        assert_eq!(found.rank, Rank::Bronze);
    }

    #[test]
    fn test_missing_template_dir_is_config_error() {
        let dir = std::env::temp_dir().join("sfot-no-such-templates");
        let err = TemplateEmblemDetector::from_dir(
            &dir,
            "480p",
            MatchStrategy::ZeroMeanCrossCorrelation,
            0.7,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::Template(_)));
    }

    #[test]
    fn test_mock_pattern() {
        let emblem = EmblemMatch {
            rank: Rank::Diamond,
            bbox: BoundingBox::new(1, 2, 3, 4),
            confidence: 0.9,
        };
        let frame = frame_with(&checker(4), (0, 0));
        assert_eq!(MockEmblemDetector::fixed(emblem).detect(&frame), Some(emblem));
        assert_eq!(MockEmblemDetector::new().detect(&frame), None);
    }
}
