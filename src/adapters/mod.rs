//! Narrow seams to the external collaborators: detection model, OCR model,
//! LLM and rasterizer. The orchestrator only ever talks to these traits.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::Serialize;

use crate::error::StageResult;
use crate::records::{
    BubbleType, DEFAULT_FONT_SIZE, DetectionOutput, ExtractedText, HistoryEntry, ReorderedText,
    TextBox, TextDirection, TranslatedText,
};

pub mod detection;
pub mod extraction;
mod font;
pub mod render;
pub mod reorder;
pub mod translate;

pub use detection::HttpDetector;
pub use extraction::HttpOcr;
pub use render::{OverlayRenderer, OverlayStyle};
pub use reorder::LlmReorderer;
pub use translate::LlmTranslator;

pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = StageResult<T>> + Send + 'a>>;

pub trait TextDetector: Send + Sync {
    /// Boxes below the size threshold are already dropped.
    fn detect<'a>(&'a self, image: &'a Path) -> AdapterFuture<'a, DetectionOutput>;
}

pub trait TextExtractor: Send + Sync {
    /// Boxes whose OCR text comes back empty are omitted.
    fn extract<'a>(
        &'a self,
        image: &'a Path,
        boxes: &'a [TextBox],
    ) -> AdapterFuture<'a, Vec<ExtractedText>>;
}

/// Reading-order resolution. Both paths raise on failure instead of
/// returning a degraded order.
pub trait TextReorderer: Send + Sync {
    fn reorder_with_image<'a>(
        &'a self,
        image: &'a Path,
        texts: &'a [ExtractedText],
    ) -> AdapterFuture<'a, Vec<ReorderedText>>;

    fn reorder_text_only<'a>(
        &'a self,
        texts: &'a [ExtractedText],
    ) -> AdapterFuture<'a, Vec<ReorderedText>>;
}

#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub texts: &'a [String],
    pub terminology: &'a BTreeMap<String, String>,
    pub history: &'a [HistoryEntry],
    pub image: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationItem {
    pub original: String,
    pub translated: String,
    pub text_direction: Option<TextDirection>,
    pub bubble_type: BubbleType,
    pub estimated_font_size: u32,
}

impl TranslationItem {
    pub fn pass_through(text: &str) -> Self {
        Self {
            original: text.to_string(),
            translated: text.to_string(),
            text_direction: Some(TextDirection::Horizontal),
            bubble_type: BubbleType::PureWhite,
            estimated_font_size: DEFAULT_FONT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationOutcome {
    pub translations: Vec<TranslationItem>,
    pub new_terminology: BTreeMap<String, String>,
    pub success: bool,
    pub error: Option<String>,
    pub used_image: bool,
}

impl TranslationOutcome {
    /// Untranslated copies of the input, flagged as a failure.
    pub fn pass_through(texts: &[String], error: String) -> Self {
        Self {
            translations: texts
                .iter()
                .map(|text| TranslationItem::pass_through(text))
                .collect(),
            new_terminology: BTreeMap::new(),
            success: false,
            error: Some(error),
            used_image: false,
        }
    }
}

/// Must return `success = false` rather than an error when the answer does
/// not line up one-to-one with `request.texts`.
pub trait TextTranslator: Send + Sync {
    fn translate<'a>(
        &'a self,
        request: TranslationRequest<'a>,
    ) -> AdapterFuture<'a, TranslationOutcome>;
}

pub trait Renderer: Send + Sync {
    /// Records with `original == translated` are skipped.
    fn render(
        &self,
        image: &Path,
        records: &[TranslatedText],
        output: &Path,
    ) -> StageResult<PathBuf>;
}
