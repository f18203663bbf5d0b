//! 帧检测 - 从对局画面中提取段位徽章与玩家名
//!
//! 核心流程：
//! 1. 模板匹配 - 按段位优先级匹配徽章，再找名牌右边缘
//! 2. 几何校验 + 限频 - 过滤无关 UI 与重复画面
//! 3. 裁剪 + OCR - 边缘缺失时用自适应裁剪搜索兜底
//! 4. 用户名清洗 - 只保留合法字符

pub mod crop_search;
pub mod emblem;
pub mod funnel;
pub mod matcher;
pub mod right_edge;
pub mod text_recognizer;

pub use crop_search::{select_candidate, AdaptiveCropSearch, SearchCandidate, SearchOutcome, SearchWindow};
pub use emblem::{EmblemDetector, MockEmblemDetector, TemplateEmblemDetector};
pub use funnel::{
    clean_username, validate_geometry, DetectionFunnel, DetectionServices, FunnelOutcome,
    RejectReason,
};
pub use matcher::{matcher_for, MatchStrategy, Template, TemplateHit, TemplateMatcher};
pub use right_edge::{MockRightEdgeDetector, RightEdge, RightEdgeDetector, TemplateRightEdgeDetector};
pub use text_recognizer::{
    best_span, preprocess_for_ocr, MockTextRecognizer, OcrError, TesseractRecognizer,
    TextRecognizer, TextSpan,
};
