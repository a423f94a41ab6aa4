//! Payloads persisted in the stage cache, one per stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::records::{ExtractedText, ImageSize, ReorderedText, TextBox, TranslatedText};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub text_blocks: Vec<TextBox>,
    pub total_boxes: usize,
    pub image_size: ImageSize,
    pub source_image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub total_boxes: usize,
    pub successful_extractions: usize,
    pub extraction_rate: f64,
    pub extracted_texts: Vec<ExtractedText>,
}

impl ExtractionRecord {
    pub fn new(total_boxes: usize, extracted_texts: Vec<ExtractedText>) -> Self {
        let successful_extractions = extracted_texts.len();
        let extraction_rate = if total_boxes == 0 {
            0.0
        } else {
            successful_extractions as f64 / total_boxes as f64
        };
        Self {
            total_boxes,
            successful_extractions,
            extraction_rate,
            extracted_texts,
        }
    }
}

/// Which path produced the reading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderMethod {
    ImageBasedStructuredOutput,
    FallbackTextOnly,
    IdentityOrder,
}

impl ReorderMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReorderMethod::ImageBasedStructuredOutput => "image_based_structured_output",
            ReorderMethod::FallbackTextOnly => "fallback_text_only",
            ReorderMethod::IdentityOrder => "identity_order",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderRecord {
    pub total_texts: usize,
    pub reordered_count: usize,
    pub reordered_texts: Vec<ReorderedText>,
    pub success: bool,
    pub method: ReorderMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRecord {
    pub total_texts: usize,
    pub translated_count: usize,
    pub translated_texts: Vec<TranslatedText>,
    #[serde(default)]
    pub new_terminology: BTreeMap<String, String>,
    pub success: bool,
    #[serde(default)]
    pub history_context_used: usize,
    #[serde(default)]
    pub used_image_analysis: bool,
    #[serde(default)]
    pub used_ocr_vertical_info: bool,
}
