use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::stages::ReorderMethod;
use crate::records::{HistoryEntry, TranslatedText};
use crate::terminology::TerminologyStatistics;

/// Outcome of one image. Failures carry the message instead of unwinding.
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub success: bool,
    pub error: Option<String>,
    pub input_path: PathBuf,
    /// `None` when no output was requested or rendering failed.
    pub output_path: Option<PathBuf>,
    /// Set when translation finished but the overlay could not be written.
    pub render_error: Option<String>,
    pub processing_time: f64,
    pub text_boxes_count: usize,
    pub extracted_count: usize,
    pub reordered_count: usize,
    pub translated_count: usize,
    pub new_terminology_count: usize,
    pub added_terms: usize,
    pub reorder_method: Option<ReorderMethod>,
    pub translated_texts: Vec<TranslatedText>,
}

impl ImageReport {
    pub(crate) fn started(input_path: PathBuf, output_path: Option<PathBuf>) -> Self {
        Self {
            success: false,
            error: None,
            input_path,
            output_path,
            render_error: None,
            processing_time: 0.0,
            text_boxes_count: 0,
            extracted_count: 0,
            reordered_count: 0,
            translated_count: 0,
            new_terminology_count: 0,
            added_terms: 0,
            reorder_method: None,
            translated_texts: Vec::new(),
        }
    }

    /// Translated and, when an output was requested, rendered.
    pub fn is_complete(&self) -> bool {
        self.success && self.render_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedImage {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub report: ImageReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedImage {
    pub input_file: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageTiming {
    pub file_name: String,
    pub seconds: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,
    pub total_images: usize,
    pub processed: Vec<ProcessedImage>,
    pub failed: Vec<FailedImage>,
    pub started_at: String,
    pub finished_at: String,
    pub total_seconds: f64,
    pub success_rate: f64,
    pub timings: Vec<ImageTiming>,
    pub translation_history: Vec<HistoryEntry>,
}

impl BatchReport {
    /// Pages whose overlay failed count as processed but not as succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
            && self
                .processed
                .iter()
                .all(|page| page.report.render_error.is_none())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressReport {
    pub image_name: String,
    pub completed_stages: usize,
    pub total_stages: usize,
    pub progress_percentage: f64,
    pub stage_details: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub results_directory: PathBuf,
    pub terminology: TerminologyStatistics,
    pub model: String,
    pub history_entries: usize,
    pub history_limit: usize,
    pub history_window: usize,
    pub adapter_timeout_secs: Option<u64>,
}
