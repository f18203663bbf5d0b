//! Template matching strategies.
//!
//! Every strategy answers the same question: where in the frame does the
//! template fit best, and how well (0..=1). They differ in what "fit" means.

use std::path::Path;

use image::{GrayImage, Luma};
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::model::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Plain normalized cross correlation (cosine similarity of raw pixels).
    NormalizedCrossCorrelation,
    /// Mean-subtracted normalized cross correlation; insensitive to uniform
    /// brightness shifts.
    ZeroMeanCrossCorrelation,
    /// Squared difference over the template's opaque pixels only.
    MaskedSquaredDifference,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub image: GrayImage,
    /// Non-zero pixels take part in matching. Only used by masked strategies.
    pub mask: Option<GrayImage>,
}

impl Template {
    pub fn new(name: impl Into<String>, image: GrayImage) -> Self {
        Self {
            name: name.into(),
            image,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: GrayImage) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Load a template image; an alpha channel, if any, becomes the mask.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, image::ImageError> {
        let path = path.as_ref();
        let image = image::open(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut template = Self::new(name, image.to_luma8());
        if image.color().has_alpha() {
            let rgba = image.to_rgba8();
            let mask = GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
                Luma([rgba.get_pixel(x, y)[3]])
            });
            template = template.with_mask(mask);
        }
        Ok(template)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    fn fits_in(&self, frame: &GrayImage) -> bool {
        self.width() > 0
            && self.height() > 0
            && self.width() <= frame.width()
            && self.height() <= frame.height()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateHit {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

impl TemplateHit {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.x, self.y, self.width, self.height)
    }
}

pub trait TemplateMatcher: Send + Sync {
    fn strategy(&self) -> MatchStrategy;

    /// Best placement of `template` in `frame`, or `None` when the template
    /// cannot be placed at all.
    fn best_match(&self, frame: &GrayImage, template: &Template) -> Option<TemplateHit>;
}

pub fn matcher_for(strategy: MatchStrategy) -> Box<dyn TemplateMatcher> {
    match strategy {
        MatchStrategy::NormalizedCrossCorrelation => Box::new(NormalizedCrossCorrelation),
        MatchStrategy::ZeroMeanCrossCorrelation => Box::new(ZeroMeanCrossCorrelation),
        MatchStrategy::MaskedSquaredDifference => Box::new(MaskedSquaredDifference),
    }
}

pub struct NormalizedCrossCorrelation;

impl TemplateMatcher for NormalizedCrossCorrelation {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::NormalizedCrossCorrelation
    }

    fn best_match(&self, frame: &GrayImage, template: &Template) -> Option<TemplateHit> {
        if !template.fits_in(frame) {
            return None;
        }
        let scores = match_template(
            frame,
            &template.image,
            MatchTemplateMethod::CrossCorrelationNormalized,
        );

        // zero-norm windows come back as NaN
        let mut best: Option<(u32, u32, f32)> = None;
        for (x, y, score) in scores.enumerate_pixels() {
            let score = score[0];
            if score.is_finite() && best.map_or(true, |(_, _, b)| score > b) {
                best = Some((x, y, score));
            }
        }
        let (x, y, score) = best.unwrap_or((0, 0, 0.0));
        Some(hit(x, y, template, score))
    }
}

pub struct ZeroMeanCrossCorrelation;

impl TemplateMatcher for ZeroMeanCrossCorrelation {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::ZeroMeanCrossCorrelation
    }

    fn best_match(&self, frame: &GrayImage, template: &Template) -> Option<TemplateHit> {
        if !template.fits_in(frame) {
            return None;
        }
        let (tw, th) = template.image.dimensions();
        let n = (tw * th) as f64;

        let t_mean = template.image.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
        let centered: Vec<f64> = template.image.pixels().map(|p| p[0] as f64 - t_mean).collect();
        let t_energy: f64 = centered.iter().map(|v| v * v).sum();
        if t_energy <= f64::EPSILON {
            // flat template correlates with nothing
            return Some(hit(0, 0, template, 0.0));
        }

        let sums = IntegralSums::new(frame);
        let (x, y, score) = scan_positions(frame, template, |x, y| {
            let (sum, sum_sq) = sums.window(x, y, tw, th);
            let window_energy = sum_sq - sum * sum / n;
            if window_energy <= f64::EPSILON {
                return 0.0;
            }
            let mut dot = 0.0;
            for ty in 0..th {
                let row = (ty * tw) as usize;
                for tx in 0..tw {
                    let pixel = frame.get_pixel(x + tx, y + ty)[0] as f64;
                    dot += centered[row + tx as usize] * pixel;
                }
            }
            (dot / (t_energy * window_energy).sqrt()) as f32
        });
        Some(hit(x, y, template, score.max(0.0)))
    }
}

pub struct MaskedSquaredDifference;

impl TemplateMatcher for MaskedSquaredDifference {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::MaskedSquaredDifference
    }

    fn best_match(&self, frame: &GrayImage, template: &Template) -> Option<TemplateHit> {
        if !template.fits_in(frame) {
            return None;
        }
        let active: Vec<(u32, u32, f64)> = template
            .image
            .enumerate_pixels()
            .filter(|(x, y, _)| {
                template
                    .mask
                    .as_ref()
                    .map_or(true, |mask| mask.get_pixel(*x, *y)[0] > 0)
            })
            .map(|(x, y, p)| (x, y, p[0] as f64))
            .collect();
        if active.is_empty() {
            return None;
        }

        let max_error = active.len() as f64 * 255.0 * 255.0;
        let (x, y, score) = scan_positions(frame, template, |x, y| {
            let error: f64 = active
                .iter()
                .map(|&(tx, ty, t)| {
                    let d = frame.get_pixel(x + tx, y + ty)[0] as f64 - t;
                    d * d
                })
                .sum();
            (1.0 - (error / max_error).min(1.0)) as f32
        });
        Some(hit(x, y, template, score))
    }
}

fn hit(x: u32, y: u32, template: &Template, score: f32) -> TemplateHit {
    TemplateHit {
        x,
        y,
        width: template.width(),
        height: template.height(),
        confidence: score.clamp(0.0, 1.0),
    }
}

/// Score every placement in parallel by row; the highest score wins and
/// ties go to the first placement in row-major order.
fn scan_positions<F>(frame: &GrayImage, template: &Template, score: F) -> (u32, u32, f32)
where
    F: Fn(u32, u32) -> f32 + Sync,
{
    let out_w = frame.width() - template.width() + 1;
    let out_h = frame.height() - template.height() + 1;

    let row_best: Vec<(u32, u32, f32)> = (0..out_h)
        .into_par_iter()
        .map(|y| {
            let mut best = (0, y, f32::NEG_INFINITY);
            for x in 0..out_w {
                let s = score(x, y);
                if s > best.2 {
                    best = (x, y, s);
                }
            }
            best
        })
        .collect();

    row_best
        .into_iter()
        .fold((0, 0, f32::NEG_INFINITY), |best, row| {
            if row.2 > best.2 {
                row
            } else {
                best
            }
        })
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralSums {
    stride: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl IntegralSums {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = image.get_pixel(x as u32, y as u32)[0] as f64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (f64, f64) {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let at = |table: &[f64], x: usize, y: usize| table[y * self.stride + x];
        let area = |table: &[f64]| at(table, x1, y1) - at(table, x0, y1) - at(table, x1, y0) + at(table, x0, y0);
        (area(&self.sum), area(&self.sum_sq))
    }
}
