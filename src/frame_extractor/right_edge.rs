use std::path::Path;

use log::info;

use crate::core::config::{ConfigError, DetectionConfig};
use crate::core::model::EmblemMatch;
use crate::core::video::DecodedFrame;
use crate::frame_extractor::matcher::{matcher_for, MatchStrategy, Template, TemplateMatcher};

/// Right edge of a nameplate; `x` is the first column past the plate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RightEdge {
    pub x: u32,
    pub confidence: f32,
}

pub trait RightEdgeDetector: Send + Sync {
    fn detect(&self, frame: &DecodedFrame, emblem: &EmblemMatch) -> Option<RightEdge>;
}

pub struct TemplateRightEdgeDetector {
    template: Template,
    matcher: Box<dyn TemplateMatcher>,
    threshold: f32,
}

impl TemplateRightEdgeDetector {
    pub fn new(template: Template, matcher: Box<dyn TemplateMatcher>, threshold: f32) -> Self {
        Self {
            template,
            matcher,
            threshold,
        }
    }

    /// Load `right_edge_{resolution}.png` from `dir`.
    pub fn from_dir(
        dir: &Path,
        resolution: &str,
        strategy: MatchStrategy,
        threshold: f32,
    ) -> Result<Self, ConfigError> {
        let path = dir.join(format!("right_edge_{}.png", resolution));
        let template = Template::load(&path)
            .map_err(|e| ConfigError::Template(format!("{}: {}", path.display(), e)))?;
        info!(
            "📐 Loaded right-edge template {}x{} ({:?}, masked: {})",
            template.width(),
            template.height(),
            strategy,
            template.mask.is_some()
        );
        Ok(Self::new(template, matcher_for(strategy), threshold))
    }

    pub fn from_config(config: &DetectionConfig) -> Result<Self, ConfigError> {
        Self::from_dir(
            &config.templates_dir,
            &config.resolution,
            config.right_edge_strategy,
            config.right_edge_threshold,
        )
    }
}

impl RightEdgeDetector for TemplateRightEdgeDetector {
    fn detect(&self, frame: &DecodedFrame, emblem: &EmblemMatch) -> Option<RightEdge> {
        // only the strip right of the emblem can hold the edge
        let left = emblem.bbox.right().min(frame.width());
        let strip = frame.crop(left, 0, frame.width() - left, frame.height());
        let hit = self.matcher.best_match(&strip, &self.template)?;
        (hit.confidence >= self.threshold).then(|| RightEdge {
            x: left + hit.x + hit.width,
            confidence: hit.confidence,
        })
    }
}

pub struct MockRightEdgeDetector {
    pattern: Option<Box<dyn Fn(&DecodedFrame, &EmblemMatch) -> Option<RightEdge> + Send + Sync>>,
}

impl MockRightEdgeDetector {
    /// Never finds an edge.
    pub fn new() -> Self {
        Self { pattern: None }
    }

    pub fn with_pattern<F>(pattern: F) -> Self
    where
        F: Fn(&DecodedFrame, &EmblemMatch) -> Option<RightEdge> + Send + Sync + 'static,
    {
        Self {
            pattern: Some(Box::new(pattern)),
        }
    }

    pub fn fixed(x: u32, confidence: f32) -> Self {
        Self::with_pattern(move |_, _| Some(RightEdge { x, confidence }))
    }
}

impl Default for MockRightEdgeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RightEdgeDetector for MockRightEdgeDetector {
    fn detect(&self, frame: &DecodedFrame, emblem: &EmblemMatch) -> Option<RightEdge> {
        self.pattern.as_ref().and_then(|p| p(frame, emblem))
    }
}
