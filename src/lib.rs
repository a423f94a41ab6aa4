use anyhow::{Context, Result};

pub mod adapters;
pub mod data;
pub mod error;
pub mod history;
pub mod logging;
mod paths;
pub mod pipeline;
mod prompts;
pub mod providers;
pub mod records;
pub mod settings;
pub mod stage_cache;
mod storage;
pub mod terminology;
#[cfg(test)]
mod test_util;

pub use adapters::{
    HttpDetector, HttpOcr, LlmReorderer, LlmTranslator, OverlayRenderer, OverlayStyle, Renderer,
    TextDetector, TextExtractor, TextReorderer, TextTranslator,
};
pub use error::{StageError, StageResult};
pub use pipeline::{Adapters, BatchReport, ImageReport, Pipeline, PipelineConfig, ProcessOptions};
pub use providers::{Gemini, OpenAI, Provider, ProviderKind};
pub use settings::Settings;
pub use stage_cache::{Stage, StageCache};
pub use terminology::TerminologyStore;

/// Command-line overrides layered over the settings files.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub model: Option<String>,
    pub key: Option<String>,
    pub settings_path: Option<String>,
}

impl Config {
    pub fn load_settings(&self) -> Result<Settings> {
        settings::load_settings(self.settings_path.as_deref().map(std::path::Path::new))
    }
}

pub fn open_cache(settings: &Settings) -> Result<StageCache> {
    StageCache::new(&settings.results_dir)
}

pub fn open_terminology(settings: &Settings) -> TerminologyStore {
    TerminologyStore::open(&settings.terminology_path)
}

pub fn pipeline_config(settings: &Settings) -> PipelineConfig {
    PipelineConfig {
        history_limit: settings.history_limit,
        history_window: settings.history_window,
        adapter_timeout: settings.adapter_timeout(),
        image_extensions: settings.image_extensions.clone(),
    }
}

/// Builds every adapter up front; a missing key or endpoint fails here,
/// before any image is touched.
pub fn build_pipeline(settings: &Settings, config: &Config) -> Result<Pipeline> {
    let model_arg = config.model.as_deref().unwrap_or(&settings.model);
    let selection = providers::parse_model_arg(model_arg)?;
    let key = providers::resolve_key(selection.provider, config.key.as_deref())
        .with_context(|| "no API key found for selected provider")?;
    let provider = providers::build_provider(selection.provider, key, selection.requested_model);
    let model_name = format!("{}:{}", selection.provider.as_str(), provider.model_name());

    let detector = HttpDetector::new(&settings.detection_endpoint, settings.min_box_size)
        .with_context(|| "failed to initialize text detection")?;
    let extractor = HttpOcr::new(&settings.ocr_endpoint, settings.rotation_threshold)
        .with_context(|| "failed to initialize OCR")?;
    let style = OverlayStyle::resolve(
        settings.font_path.as_deref(),
        settings.font_family.as_deref(),
        &settings.text_color,
        &settings.stroke_color,
    );
    let adapters = Adapters {
        detector: Box::new(detector),
        extractor: Box::new(extractor),
        reorderer: Box::new(LlmReorderer::new(provider.clone())),
        translator: Box::new(LlmTranslator::new(provider)),
        renderer: Box::new(OverlayRenderer::new(style)),
    };

    let cache = open_cache(settings)?;
    let terminology = open_terminology(settings);
    Ok(Pipeline::new(
        adapters,
        cache,
        terminology,
        pipeline_config(settings),
        model_name,
    ))
}
