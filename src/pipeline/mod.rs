//! Five-stage orchestration: detect, extract, reorder, translate, update
//! terminology. Every stage is check-cache, compute, persist; images in a
//! batch run strictly one after another in file-name order.

use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adapters::{
    AdapterFuture, Renderer, TextDetector, TextExtractor, TextReorderer, TextTranslator,
    TranslationItem, TranslationRequest,
};
use crate::data;
use crate::error::{StageError, StageResult};
use crate::history::{DEFAULT_HISTORY_LIMIT, DEFAULT_PROMPT_WINDOW, TranslationHistory};
use crate::records::{ExtractedText, ReorderedText, TextBox, TextDirection, TranslatedText};
use crate::stage_cache::{Stage, StageCache};
use crate::storage;
use crate::terminology::TerminologyStore;

mod report;
mod stages;

pub use report::{
    BatchReport, FailedImage, ImageReport, ImageTiming, ProcessedImage, ProgressReport, SystemInfo,
};
pub use stages::{
    DetectionRecord, ExtractionRecord, ReorderMethod, ReorderRecord, TranslationRecord,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub history_limit: usize,
    /// Most recent history entries shown to each translation call.
    pub history_window: usize,
    pub adapter_timeout: Option<Duration>,
    pub image_extensions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_window: DEFAULT_PROMPT_WINDOW,
            adapter_timeout: None,
            image_extensions: data::PAGE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

/// The external collaborators, fully initialized before the pipeline exists.
pub struct Adapters {
    pub detector: Box<dyn TextDetector>,
    pub extractor: Box<dyn TextExtractor>,
    pub reorderer: Box<dyn TextReorderer>,
    pub translator: Box<dyn TextTranslator>,
    pub renderer: Box<dyn Renderer>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Drop every cached stage of the image before running.
    pub force: bool,
}

pub struct Pipeline {
    adapters: Adapters,
    cache: StageCache,
    terminology: TerminologyStore,
    history: TranslationHistory,
    config: PipelineConfig,
    model_name: String,
}

impl Pipeline {
    pub fn new(
        adapters: Adapters,
        cache: StageCache,
        terminology: TerminologyStore,
        config: PipelineConfig,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            adapters,
            cache,
            terminology,
            history: TranslationHistory::new(config.history_limit),
            config,
            model_name: model_name.into(),
        }
    }

    pub fn cache(&self) -> &StageCache {
        &self.cache
    }

    pub fn terminology(&self) -> &TerminologyStore {
        &self.terminology
    }

    pub fn terminology_mut(&mut self) -> &mut TerminologyStore {
        &mut self.terminology
    }

    pub fn history(&self) -> &TranslationHistory {
        &self.history
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs all five stages for one image. Never returns an error: failures
    /// are reported in the result.
    pub async fn process_image(
        &mut self,
        image: &Path,
        output: Option<&Path>,
        options: ProcessOptions,
    ) -> ImageReport {
        let clock = Instant::now();
        let name = image_name(image);
        let mut report = ImageReport::started(image.to_path_buf(), output.map(Path::to_path_buf));
        info!("processing {}", image.display());
        if options.force {
            let cleared = self.cache.clear_all(&name);
            info!("forced rerun, cleared {} cached stages for {}", cleared, name);
        }
        match self.run_stages(image, &name, output, &mut report).await {
            Ok(()) => report.success = true,
            Err(err) => {
                warn!("{} failed: {}", image.display(), err);
                report.error = Some(err.to_string());
            }
        }
        report.processing_time = clock.elapsed().as_secs_f64();
        if report.success {
            info!(
                "{} done in {:.2}s ({} texts)",
                name, report.processing_time, report.translated_count
            );
        }
        report
    }

    async fn run_stages(
        &mut self,
        image: &Path,
        name: &str,
        output: Option<&Path>,
        report: &mut ImageReport,
    ) -> StageResult<()> {
        if !image.is_file() {
            return Err(StageError::InvalidInput(format!(
                "image not found: {}",
                image.display()
            )));
        }

        let detection = self.detect_stage(image, name).await?;
        report.text_boxes_count = detection.text_blocks.len();
        if detection.text_blocks.is_empty() {
            return Err(StageError::EmptyResult { stage: "detection" });
        }

        let extraction = self
            .extract_stage(image, name, &detection.text_blocks)
            .await?;
        report.extracted_count = extraction.extracted_texts.len();
        if extraction.extracted_texts.is_empty() {
            return Err(StageError::EmptyResult { stage: "ocr" });
        }

        let reorder = self
            .reorder_stage(image, name, &extraction.extracted_texts)
            .await;
        report.reordered_count = reorder.reordered_texts.len();
        report.reorder_method = Some(reorder.method);
        if reorder.reordered_texts.is_empty() {
            return Err(StageError::EmptyResult { stage: "reorder" });
        }

        let translation = self
            .translate_stage(
                image,
                name,
                &reorder.reordered_texts,
                &extraction.extracted_texts,
            )
            .await?;
        report.translated_count = translation.translated_texts.len();
        report.new_terminology_count = translation.new_terminology.len();

        report.added_terms = self.update_terminology(&translation.new_terminology);

        // Stage 4 is already persisted; a failed overlay leaves the page
        // translated and resumable with only stage 5 to redo.
        if let Some(output) = output
            && let Err(err) = self
                .adapters
                .renderer
                .render(image, &translation.translated_texts, output)
        {
            warn!("rendering {} failed: {}", output.display(), err);
            report.render_error = Some(err.to_string());
            report.output_path = None;
        }
        report.translated_texts = translation.translated_texts;
        Ok(())
    }

    async fn detect_stage(&self, image: &Path, name: &str) -> StageResult<DetectionRecord> {
        if let Some(cached) = self.cache.load::<DetectionRecord>(Stage::Detection, name) {
            info!("stage 1 cached for {}", name);
            return Ok(cached);
        }
        info!("stage 1: detecting text boxes");
        let detection = with_timeout(
            self.config.adapter_timeout,
            "detection",
            self.adapters.detector.detect(image),
        )
        .await?;
        if detection.boxes.is_empty() {
            return Err(StageError::EmptyResult { stage: "detection" });
        }
        let record = DetectionRecord {
            total_boxes: detection.boxes.len(),
            text_blocks: detection.boxes,
            image_size: detection.image_size,
            source_image: image.display().to_string(),
        };
        self.persist(Stage::Detection, name, &record);
        Ok(record)
    }

    async fn extract_stage(
        &self,
        image: &Path,
        name: &str,
        boxes: &[TextBox],
    ) -> StageResult<ExtractionRecord> {
        if let Some(cached) = self.cache.load::<ExtractionRecord>(Stage::Ocr, name) {
            info!("stage 2 cached for {}", name);
            return Ok(cached);
        }
        info!("stage 2: extracting text from {} boxes", boxes.len());
        let extracted = with_timeout(
            self.config.adapter_timeout,
            "ocr",
            self.adapters.extractor.extract(image, boxes),
        )
        .await?;
        if extracted.is_empty() {
            return Err(StageError::EmptyResult { stage: "ocr" });
        }
        let record = ExtractionRecord::new(boxes.len(), extracted);
        self.persist(Stage::Ocr, name, &record);
        Ok(record)
    }

    async fn reorder_stage(
        &self,
        image: &Path,
        name: &str,
        extracted: &[ExtractedText],
    ) -> ReorderRecord {
        if let Some(cached) = self.cache.load::<ReorderRecord>(Stage::Reorder, name) {
            info!("stage 3 cached for {}", name);
            return cached;
        }
        info!("stage 3: resolving reading order");
        let (reordered_texts, method) = self.reorder_texts_with_image(image, extracted).await;
        let record = ReorderRecord {
            total_texts: extracted.len(),
            reordered_count: reordered_texts.len(),
            success: !reordered_texts.is_empty(),
            reordered_texts,
            method,
        };
        self.persist(Stage::Reorder, name, &record);
        record
    }

    /// Image-grounded order, then text-only, then input order. Never fails.
    pub async fn reorder_texts_with_image(
        &self,
        image: &Path,
        texts: &[ExtractedText],
    ) -> (Vec<ReorderedText>, ReorderMethod) {
        let timeout = self.config.adapter_timeout;
        match with_timeout(
            timeout,
            "reorder",
            self.adapters.reorderer.reorder_with_image(image, texts),
        )
        .await
        {
            Ok(ordered) => return (ordered, ReorderMethod::ImageBasedStructuredOutput),
            Err(err) => warn!("image-grounded reorder failed, trying text only: {}", err),
        }
        match with_timeout(
            timeout,
            "reorder",
            self.adapters.reorderer.reorder_text_only(texts),
        )
        .await
        {
            Ok(ordered) => (ordered, ReorderMethod::FallbackTextOnly),
            Err(err) => {
                warn!("text-only reorder failed, keeping detection order: {}", err);
                (identity_order(texts), ReorderMethod::IdentityOrder)
            }
        }
    }

    async fn translate_stage(
        &self,
        image: &Path,
        name: &str,
        reordered: &[ReorderedText],
        extracted: &[ExtractedText],
    ) -> StageResult<TranslationRecord> {
        if let Some(cached) = self.cache.load::<TranslationRecord>(Stage::Translate, name) {
            info!("stage 4 cached for {}", name);
            return Ok(cached);
        }
        info!("stage 4: translating {} texts", reordered.len());
        let metadata = self.extraction_metadata(name, extracted);
        let texts = reordered
            .iter()
            .map(|text| text.text.clone())
            .collect::<Vec<_>>();
        let terminology = self.terminology.get_all();
        let history = self.history.recent(self.config.history_window);
        let request = TranslationRequest {
            texts: &texts,
            terminology: &terminology,
            history: &history,
            image: Some(image),
        };
        let outcome = with_timeout(
            self.config.adapter_timeout,
            "translation",
            self.adapters.translator.translate(request),
        )
        .await?;
        if outcome.translations.len() != reordered.len() {
            return Err(StageError::CountMismatch {
                expected: reordered.len(),
                actual: outcome.translations.len(),
            });
        }
        if !outcome.success {
            return Err(StageError::TranslationFailed(outcome.error.unwrap_or_else(
                || "translation adapter reported failure".to_string(),
            )));
        }
        let translated_texts = join_translations(reordered, &outcome.translations, &metadata);
        let record = TranslationRecord {
            total_texts: reordered.len(),
            translated_count: translated_texts.len(),
            translated_texts,
            new_terminology: outcome.new_terminology,
            success: true,
            history_context_used: history.len(),
            used_image_analysis: outcome.used_image,
            used_ocr_vertical_info: !metadata.is_empty(),
        };
        self.persist(Stage::Translate, name, &record);
        Ok(record)
    }

    /// Stage-2 records keyed by box index, read back from the cache so the
    /// OCR flags survive even when stage 3 came from an older run.
    fn extraction_metadata(
        &self,
        name: &str,
        in_memory: &[ExtractedText],
    ) -> BTreeMap<usize, ExtractedText> {
        let source = match self.cache.load::<ExtractionRecord>(Stage::Ocr, name) {
            Some(record) => record.extracted_texts,
            None => {
                debug!("no stage 2 cache for {}, using in-memory OCR output", name);
                in_memory.to_vec()
            }
        };
        source
            .into_iter()
            .map(|text| (text.box_index, text))
            .collect()
    }

    fn update_terminology(&mut self, new_terms: &BTreeMap<String, String>) -> usize {
        if new_terms.is_empty() {
            debug!("stage 5: no new terminology");
            return 0;
        }
        let added = self.terminology.update_terms(new_terms);
        info!("stage 5: {} of {} new terms added", added, new_terms.len());
        added
    }

    fn persist<T: serde::Serialize>(&self, stage: Stage, name: &str, data: &T) {
        if let Err(err) = self.cache.save(stage, name, data) {
            warn!("failed to cache {} for {}: {:#}", stage.key(), name, err);
        }
    }

    /// Processes every page image in `input` in file-name order. One page's
    /// failure is recorded and the batch moves on.
    pub async fn process_folder(
        &mut self,
        input: &Path,
        output: Option<&Path>,
    ) -> Result<BatchReport> {
        if !input.is_dir() {
            return Err(anyhow!("input folder not found: {}", input.display()));
        }
        let output_dir = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_dir(input));
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create output folder: {}", output_dir.display()))?;
        let images = self.list_images(input)?;
        if images.is_empty() {
            return Err(anyhow!("no image files found in {}", input.display()));
        }

        self.history.reset();
        let started_at = storage::now_rfc3339();
        let clock = Instant::now();
        let total = images.len();
        info!(
            "batch: {} images from {} to {}",
            total,
            input.display(),
            output_dir.display()
        );

        let mut processed = Vec::new();
        let mut failed = Vec::new();
        let mut timings = Vec::with_capacity(total);
        for (position, image) in images.iter().enumerate() {
            let file_name = image_name(image);
            info!("[{}/{}] {}", position + 1, total, file_name);
            let output_file = output_dir.join(format!("translated_{}", file_name));
            let report = self
                .process_image(image, Some(&output_file), ProcessOptions::default())
                .await;
            timings.push(ImageTiming {
                file_name,
                seconds: report.processing_time,
                success: report.success,
            });
            if report.success {
                self.history
                    .extend_from_translations(&report.translated_texts);
                processed.push(ProcessedImage {
                    input_file: image.clone(),
                    output_file,
                    report,
                });
            } else {
                failed.push(FailedImage {
                    input_file: image.clone(),
                    error: report
                        .error
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }
            debug!(
                "history {} entries, terminology {} terms",
                self.history.len(),
                self.terminology.len()
            );
        }

        let success_rate = processed.len() as f64 / total as f64;
        info!(
            "batch finished: {} ok, {} failed ({:.1}%)",
            processed.len(),
            failed.len(),
            success_rate * 100.0
        );
        Ok(BatchReport {
            input_folder: input.to_path_buf(),
            output_folder: output_dir,
            total_images: total,
            processed,
            failed,
            started_at,
            finished_at: storage::now_rfc3339(),
            total_seconds: clock.elapsed().as_secs_f64(),
            success_rate,
            timings,
            translation_history: self.history.snapshot(),
        })
    }

    fn list_images(&self, input: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(input)
            .with_context(|| format!("failed to read folder: {}", input.display()))?;
        let mut images = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && data::has_extension(path, &self.config.image_extensions))
            .collect::<Vec<_>>();
        images.sort_by_key(|path| {
            let name = image_name(path);
            (name.to_lowercase(), name)
        });
        Ok(images)
    }

    pub fn get_progress(&self, image: &str) -> ProgressReport {
        progress_for(&self.cache, image)
    }

    /// Clears one image's stages, or every cached image. Returns files deleted.
    pub fn clear_cache(&self, image: Option<&str>) -> usize {
        clear_cached(&self.cache, image)
    }

    pub fn system_info(&self) -> SystemInfo {
        let dir = self.cache.dir();
        SystemInfo {
            results_directory: std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf()),
            terminology: self.terminology.statistics(),
            model: self.model_name.clone(),
            history_entries: self.history.len(),
            history_limit: self.config.history_limit,
            history_window: self.config.history_window,
            adapter_timeout_secs: self.config.adapter_timeout.map(|limit| limit.as_secs()),
        }
    }
}

/// Per-stage completion for one image, read from the cache alone.
pub fn progress_for(cache: &StageCache, image: &str) -> ProgressReport {
    let name = image_name(Path::new(image));
    let stage_details = cache.progress(&name);
    let completed_stages = stage_details.values().filter(|done| **done).count();
    ProgressReport {
        image_name: name,
        completed_stages,
        total_stages: Stage::ALL.len(),
        progress_percentage: completed_stages as f64 / Stage::ALL.len() as f64 * 100.0,
        stage_details,
    }
}

pub fn clear_cached(cache: &StageCache, image: Option<&str>) -> usize {
    match image {
        Some(image) => cache.clear_all(&image_name(Path::new(image))),
        None => cache.clear_everything(),
    }
}

fn image_name(image: &Path) -> String {
    image
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| image.display().to_string())
}

/// `<input>_translated` next to the input folder.
pub fn default_output_dir(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "pages".to_string());
    input.with_file_name(format!("{}_translated", name))
}

/// Input order as reading order.
pub fn identity_order(texts: &[ExtractedText]) -> Vec<ReorderedText> {
    texts
        .iter()
        .enumerate()
        .map(|(position, text)| ReorderedText {
            original_index: text.box_index,
            new_order: position,
            bbox: text.bbox,
            text: text.text.clone(),
        })
        .collect()
}

/// Pairs each reordered text with its translation and the OCR record of the
/// same box. Direction comes from the OCR vertical flag when the box is
/// known.
pub(crate) fn join_translations(
    reordered: &[ReorderedText],
    items: &[TranslationItem],
    metadata: &BTreeMap<usize, ExtractedText>,
) -> Vec<TranslatedText> {
    reordered
        .iter()
        .zip(items)
        .map(|(source, item)| {
            let ocr = metadata.get(&source.original_index);
            TranslatedText {
                original_index: source.original_index,
                new_order: source.new_order,
                original: item.original.clone(),
                translated: item.translated.clone(),
                bbox: source.bbox,
                rendered_bbox: ocr.map(|text| text.rendered_bbox).unwrap_or(source.bbox),
                angle: ocr.map(|text| text.angle).unwrap_or_default(),
                was_rotated: ocr.map(|text| text.was_rotated).unwrap_or(false),
                text_direction: match ocr {
                    Some(text) => TextDirection::from_vertical(text.vertical),
                    None => item.text_direction.unwrap_or_default(),
                },
                bubble_type: item.bubble_type,
                estimated_font_size: item.estimated_font_size,
            }
        })
        .collect()
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    stage: &'static str,
    future: AdapterFuture<'_, T>,
) -> StageResult<T> {
    let Some(limit) = limit else {
        return future.await;
    };
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(StageError::Timeout {
            stage,
            secs: limit.as_secs(),
        }),
    }
}
