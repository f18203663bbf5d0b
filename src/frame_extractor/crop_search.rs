//! 自适应裁剪搜索
//!
//! When the nameplate's right edge is not found but a fallback boundary is
//! configured, try a handful of right boundaries between the fallback and the
//! frame edge and keep the one the recognizer reads best. Candidates are packed
//! near the fallback boundary, where the real edge usually is.

use log::debug;
use rayon::prelude::*;

use crate::core::config::SearchConfig;
use crate::core::video::DecodedFrame;
use crate::frame_extractor::text_recognizer::{best_span, TextRecognizer, TextSpan};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchCandidate {
    pub right: u32,
    pub span: Option<TextSpan>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub right: u32,
    pub span: TextSpan,
}

/// Vertical extent and left bound shared by every candidate crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    pub left: u32,
    pub top: u32,
    pub bottom: u32,
    pub fallback_x: u32,
}

pub struct AdaptiveCropSearch {
    config: SearchConfig,
    min_crop_width: u32,
}

impl AdaptiveCropSearch {
    pub fn new(config: SearchConfig, min_crop_width: u32) -> Self {
        Self {
            config,
            min_crop_width,
        }
    }

    /// Candidate right bounds in `[fallback_x, width]`, ascending, spaced by
    /// `t^exponent` so they cluster near the fallback.
    pub fn candidate_positions(&self, fallback_x: u32, width: u32) -> Vec<u32> {
        let fallback_x = fallback_x.min(width);
        let n = self.config.candidates.max(1);
        if n == 1 {
            return vec![fallback_x];
        }
        let span = (width - fallback_x) as f32;
        let mut positions: Vec<u32> = (0..n)
            .map(|i| {
                let t = (i as f32 / (n - 1) as f32).powf(self.config.spacing_exponent);
                (fallback_x + (t * span).round() as u32).min(width)
            })
            .collect();
        positions.dedup();
        positions
    }

    pub fn search(
        &self,
        frame: &DecodedFrame,
        window: SearchWindow,
        recognizer: &dyn TextRecognizer,
    ) -> Option<SearchOutcome> {
        let height = window.bottom.saturating_sub(window.top);
        let positions: Vec<u32> = self
            .candidate_positions(window.fallback_x, frame.width())
            .into_iter()
            .filter(|&x| x >= window.left + self.min_crop_width)
            .collect();
        if positions.is_empty() || height == 0 {
            return None;
        }

        let candidates: Vec<SearchCandidate> = positions
            .par_iter()
            .map(|&right| {
                let crop = frame.crop(window.left, window.top, right - window.left, height);
                let span = match recognizer.recognize(&crop) {
                    Ok(spans) => best_span(&spans).cloned(),
                    Err(e) => {
                        debug!("search candidate x={} failed: {}", right, e);
                        None
                    }
                };
                SearchCandidate { right, span }
            })
            .collect();

        let chosen = select_candidate(&candidates, self.config.high_confidence)?;
        let span = chosen.span.clone()?;
        debug!(
            "🔎 crop search picked x={} ({:?} @ {:.2}) from {} candidates",
            chosen.right,
            span.text,
            span.confidence,
            candidates.len()
        );
        Some(SearchOutcome {
            right: chosen.right,
            span,
        })
    }
}

/// Among candidates at or above `high_confidence` pick the most confident,
/// then the longest text, then the leftmost. With none that confident, the
/// same ordering over every candidate that read anything.
pub fn select_candidate(
    candidates: &[SearchCandidate],
    high_confidence: f32,
) -> Option<&SearchCandidate> {
    let readable: Vec<&SearchCandidate> = candidates.iter().filter(|c| c.span.is_some()).collect();
    let confident: Vec<&SearchCandidate> = readable
        .iter()
        .copied()
        .filter(|c| c.span.as_ref().map_or(false, |s| s.confidence >= high_confidence))
        .collect();
    let pool = if confident.is_empty() { readable } else { confident };

    let mut ordered = pool;
    ordered.sort_by_key(|c| c.right);
    ordered.into_iter().fold(None, |best, candidate| match best {
        Some(b) if !beats(candidate, b) => Some(b),
        _ => Some(candidate),
    })
}

fn beats(a: &SearchCandidate, b: &SearchCandidate) -> bool {
    match (&a.span, &b.span) {
        (Some(sa), Some(sb)) => {
            sa.confidence > sb.confidence
                || (sa.confidence == sb.confidence
                    && sa.text.chars().count() > sb.text.chars().count())
        }
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_extractor::text_recognizer::MockTextRecognizer;
    use image::{GrayImage, Luma};

    fn search(candidates: usize) -> AdaptiveCropSearch {
        AdaptiveCropSearch::new(
            SearchConfig {
                candidates,
                ..Default::default()
            },
            20,
        )
    }

    fn candidate(right: u32, text: &str, confidence: f32) -> SearchCandidate {
        SearchCandidate {
            right,
            span: Some(TextSpan::new(text, confidence)),
        }
    }

    fn frame(width: u32) -> DecodedFrame {
        DecodedFrame {
            gray: GrayImage::from_pixel(width, 100, Luma([100])),
        }
    }

    #[test]
    fn test_candidates_cluster_near_fallback() {
        let positions = search(15).candidate_positions(400, 640);
        assert_eq!(positions.first(), Some(&400));
        assert_eq!(positions.last(), Some(&640));
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let first_gap = positions[1] - positions[0];
        let last_gap = positions[positions.len() - 1] - positions[positions.len() - 2];
        assert!(first_gap < last_gap);
    }

    #[test]
    fn test_candidates_degenerate_range() {
        assert_eq!(search(15).candidate_positions(640, 640), vec![640]);
        assert_eq!(search(1).candidate_positions(400, 640), vec![400]);
        assert_eq!(search(15).candidate_positions(900, 640), vec![640]);
    }

    #[test]
    fn test_select_prefers_confident_then_longest_then_leftmost() {
        let candidates = vec![
            candidate(400, "Play", 0.95),
            candidate(420, "Player_On", 0.95),
            candidate(440, "Player_One", 0.90),
            candidate(460, "Player_On", 0.95),
        ];
        let chosen = select_candidate(&candidates, 0.85).unwrap();
        assert_eq!(chosen.right, 420);
    }

    #[test]
    fn test_select_falls_back_to_best_overall() {
        let candidates = vec![
            candidate(400, "Pla", 0.40),
            SearchCandidate {
                right: 420,
                span: None,
            },
            candidate(440, "Playe", 0.60),
        ];
        assert_eq!(select_candidate(&candidates, 0.85).unwrap().right, 440);
    }

    #[test]
    fn test_select_nothing_readable() {
        let candidates = vec![SearchCandidate {
            right: 400,
            span: None,
        }];
        assert!(select_candidate(&candidates, 0.85).is_none());
        assert!(select_candidate(&[], 0.85).is_none());
    }

    #[test]
    fn test_search_reaches_true_edge() {
        let left = 60;
        let searcher = search(15);
        let positions = searcher.candidate_positions(400, 640);

        for x_star in [401, 430, 500, 575, 640] {
            if x_star > *positions.last().unwrap() {
                continue;
            }
            // the full name is only readable once the crop reaches x*
            let recognizer = MockTextRecognizer::with_pattern(move |crop| {
                if left + crop.width() >= x_star {
                    vec![TextSpan::new("Player_One", 0.92)]
                } else {
                    vec![TextSpan::new("Player_", 0.55)]
                }
            });
            let window = SearchWindow {
                left,
                top: 10,
                bottom: 90,
                fallback_x: 400,
            };
            let outcome = searcher.search(&frame(640), window, &recognizer).unwrap();
            assert!(outcome.right >= x_star, "x*={x_star} picked {}", outcome.right);
            assert_eq!(outcome.span.text, "Player_One");
        }
    }

    #[test]
    fn test_search_fails_without_text() {
        let window = SearchWindow {
            left: 60,
            top: 10,
            bottom: 90,
            fallback_x: 400,
        };
        let outcome = search(15).search(&frame(640), window, &MockTextRecognizer::new());
        assert!(outcome.is_none());
    }

    #[test]
    fn test_search_skips_too_narrow_candidates() {
        let window = SearchWindow {
            left: 630,
            top: 10,
            bottom: 90,
            fallback_x: 600,
        };
        let recognizer = MockTextRecognizer::fixed("abc", 0.9);
        assert!(search(15).search(&frame(640), window, &recognizer).is_none());
    }
}
