//! 文字识别 - OCR 能力封装
//!
//! The recognizer only reads text; deciding whether the text is a usable
//! username happens in the funnel.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::contrast::{otsu_level, threshold};
use imageproc::filter::median_filter;
use log::debug;
use thiserror::Error;

use crate::core::config::OcrConfig;
use crate::core::video::encode_png;

#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    /// 0..=1
    pub confidence: f32,
}

impl TextSpan {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("OCR engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<TextSpan>, OcrError>;
}

/// Highest-confidence span with any text in it.
pub fn best_span(spans: &[TextSpan]) -> Option<&TextSpan> {
    spans
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .fold(None, |best: Option<&TextSpan>, span| match best {
            Some(b) if b.confidence >= span.confidence => Some(b),
            _ => Some(span),
        })
}

/// Grayscale crop -> upscaled, Otsu-binarised, median-smoothed image.
pub fn preprocess_for_ocr(image: &GrayImage, upscale: u32) -> GrayImage {
    let upscale = upscale.max(1);
    let scaled = if upscale > 1 {
        imageops::resize(
            image,
            image.width() * upscale,
            image.height() * upscale,
            FilterType::CatmullRom,
        )
    } else {
        image.clone()
    };
    let level = otsu_level(&scaled);
    let binary = threshold(&scaled, level);
    median_filter(&binary, 1, 1)
}

pub struct TesseractRecognizer {
    config: OcrConfig,
}

impl TesseractRecognizer {
    pub fn new(config: OcrConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.tesseract_path);
        cmd.arg("stdin")
            .arg("stdout")
            .arg("--psm")
            .arg(self.config.psm.to_string())
            .arg("-l")
            .arg(&self.config.lang);
        if let Some(whitelist) = &self.config.char_whitelist {
            cmd.arg("-c")
                .arg(format!("tessedit_char_whitelist={}", whitelist));
        }
        cmd.arg("tsv");
        cmd
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<TextSpan>, OcrError> {
        let prepared = preprocess_for_ocr(image, self.config.upscale);
        let png = encode_png(&prepared)?;

        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OcrError::Spawn {
                program: self.config.tesseract_path.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(OcrError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let spans = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!("🔤 tesseract returned {} spans", spans.len());
        Ok(spans)
    }
}

/// Turn Tesseract TSV into one span per text line. Word confidences are
/// averaged; rows without a confidence (layout rows) are skipped.
pub fn parse_tsv(tsv: &str) -> Vec<TextSpan> {
    // (block, paragraph, line) -> (words, confidences)
    let mut lines: BTreeMap<(u32, u32, u32), (Vec<String>, Vec<f32>)> = BTreeMap::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let Ok(conf) = cols[10].trim().parse::<f32>() else {
            continue;
        };
        let text = cols[11].trim();
        if conf < 0.0 || text.is_empty() {
            continue;
        }
        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        let entry = lines.entry(key).or_default();
        entry.0.push(text.to_string());
        entry.1.push(conf);
    }

    lines
        .into_values()
        .map(|(words, confs)| {
            let mean = confs.iter().sum::<f32>() / confs.len() as f32;
            TextSpan::new(words.join(" "), (mean / 100.0).clamp(0.0, 1.0))
        })
        .collect()
}

pub struct MockTextRecognizer {
    pattern: Option<Box<dyn Fn(&GrayImage) -> Vec<TextSpan> + Send + Sync>>,
}

impl MockTextRecognizer {
    /// Reads nothing.
    pub fn new() -> Self {
        Self { pattern: None }
    }

    pub fn with_pattern<F>(pattern: F) -> Self
    where
        F: Fn(&GrayImage) -> Vec<TextSpan> + Send + Sync + 'static,
    {
        Self {
            pattern: Some(Box::new(pattern)),
        }
    }

    pub fn fixed(text: &str, confidence: f32) -> Self {
        let span = TextSpan::new(text, confidence);
        Self::with_pattern(move |_| vec![span.clone()])
    }
}

impl Default for MockTextRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextRecognizer for MockTextRecognizer {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<TextSpan>, OcrError> {
        Ok(self.pattern.as_ref().map(|p| p(image)).unwrap_or_default())
    }
}
