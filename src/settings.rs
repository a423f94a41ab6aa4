use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::PAGE_EXTENSIONS;
use crate::history::{DEFAULT_HISTORY_LIMIT, DEFAULT_PROMPT_WINDOW};
use crate::paths;
use crate::providers::DEFAULT_MODEL_ARG;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub results_dir: PathBuf,
    pub history_limit: usize,
    pub history_window: usize,
    /// Zero disables the per-call timeout.
    pub adapter_timeout_secs: u64,
    pub image_extensions: Vec<String>,
    pub terminology_path: PathBuf,
    pub detection_endpoint: String,
    pub min_box_size: u32,
    pub ocr_endpoint: String,
    pub rotation_threshold: f32,
    pub model: String,
    pub font_family: Option<String>,
    pub font_path: Option<PathBuf>,
    pub text_color: String,
    pub stroke_color: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            results_dir: paths::default_results_dir(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_window: DEFAULT_PROMPT_WINDOW,
            adapter_timeout_secs: 0,
            image_extensions: PAGE_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            terminology_path: paths::default_terminology_path(),
            detection_endpoint: String::new(),
            min_box_size: 5,
            ocr_endpoint: String::new(),
            rotation_threshold: 5.0,
            model: DEFAULT_MODEL_ARG.to_string(),
            font_family: None,
            font_path: None,
            text_color: "#000000".to_string(),
            stroke_color: "#ffffff".to_string(),
        }
    }
}

impl Settings {
    pub fn adapter_timeout(&self) -> Option<Duration> {
        (self.adapter_timeout_secs > 0).then(|| Duration::from_secs(self.adapter_timeout_secs))
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    pipeline: Option<PipelineSettings>,
    terminology: Option<TerminologySettings>,
    detection: Option<DetectionSettings>,
    ocr: Option<OcrSettings>,
    llm: Option<LlmSettings>,
    render: Option<RenderSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelineSettings {
    results_dir: Option<String>,
    history_limit: Option<usize>,
    history_window: Option<usize>,
    adapter_timeout_secs: Option<u64>,
    image_extensions: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct TerminologySettings {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionSettings {
    endpoint: Option<String>,
    min_box_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct OcrSettings {
    endpoint: Option<String>,
    rotation_threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmSettings {
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RenderSettings {
    font_family: Option<String>,
    font_path: Option<String>,
    text_color: Option<String>,
    stroke_color: Option<String>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];

    if let Some(home) = paths::settings_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings.merge(parsed);
        }
    }

    Ok(settings)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(pipeline) = incoming.pipeline {
            if let Some(dir) = non_blank(pipeline.results_dir)
                .as_deref()
                .and_then(paths::resolve_user_path)
            {
                self.results_dir = dir;
            }
            if let Some(limit) = pipeline.history_limit.filter(|limit| *limit > 0) {
                self.history_limit = limit;
            }
            if let Some(window) = pipeline.history_window {
                self.history_window = window;
            }
            if let Some(secs) = pipeline.adapter_timeout_secs {
                self.adapter_timeout_secs = secs;
            }
            if let Some(extensions) = pipeline.image_extensions {
                let extensions = extensions
                    .into_iter()
                    .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect::<Vec<_>>();
                if !extensions.is_empty() {
                    self.image_extensions = extensions;
                }
            }
        }
        if let Some(path) = incoming
            .terminology
            .and_then(|terminology| non_blank(terminology.path))
            .as_deref()
            .and_then(paths::resolve_user_path)
        {
            self.terminology_path = path;
        }
        if let Some(detection) = incoming.detection {
            if let Some(endpoint) = non_blank(detection.endpoint) {
                self.detection_endpoint = endpoint;
            }
            if let Some(size) = detection.min_box_size {
                self.min_box_size = size;
            }
        }
        if let Some(ocr) = incoming.ocr {
            if let Some(endpoint) = non_blank(ocr.endpoint) {
                self.ocr_endpoint = endpoint;
            }
            if let Some(threshold) = ocr.rotation_threshold.filter(|value| *value >= 0.0) {
                self.rotation_threshold = threshold;
            }
        }
        if let Some(model) = incoming.llm.and_then(|llm| non_blank(llm.model)) {
            self.model = model;
        }
        if let Some(render) = incoming.render {
            if let Some(family) = non_blank(render.font_family) {
                self.font_family = Some(family);
            }
            if let Some(path) = non_blank(render.font_path)
                .as_deref()
                .and_then(paths::resolve_user_path)
            {
                self.font_path = Some(path);
            }
            if let Some(color) = non_blank(render.text_color) {
                self.text_color = color;
            }
            if let Some(color) = non_blank(render.stroke_color) {
                self.stroke_color = color;
            }
        }
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = paths::settings_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_temp_home;

    #[test]
    fn bundled_defaults_parse() {
        let parsed: SettingsFile = toml::from_str(DEFAULT_SETTINGS_TOML).expect("parse");
        let mut settings = Settings::default();
        settings.merge(parsed);
        assert_eq!(settings.history_limit, 100);
        assert_eq!(settings.history_window, 10);
        assert_eq!(settings.min_box_size, 5);
        assert_eq!(settings.model, DEFAULT_MODEL_ARG);
        assert_eq!(settings.adapter_timeout(), None);
    }

    #[test]
    fn writes_home_settings_on_first_load() {
        with_temp_home(|home| {
            load_settings(None).expect("load");
            let written = home.join(".comic-translator-rust/settings.toml");
            assert!(written.exists());
        });
    }

    #[test]
    fn extra_file_overrides_and_must_exist() {
        with_temp_home(|home| {
            let extra = home.join("custom.toml");
            fs::write(
                &extra,
                r##"
[pipeline]
results_dir = "~/results"
history_limit = 20
adapter_timeout_secs = 30
image_extensions = [".PNG", "jpg"]

[terminology]
path = "~/terms.json"

[llm]
model = "openai:gpt-4o-mini"

[render]
text_color = "#112233"
font_family = "  "
"##,
            )
            .expect("write");
            let settings = load_settings(Some(&extra)).expect("load");
            assert_eq!(settings.results_dir, home.join("results"));
            assert_eq!(settings.terminology_path, home.join("terms.json"));
            assert_eq!(settings.history_limit, 20);
            assert_eq!(settings.adapter_timeout(), Some(Duration::from_secs(30)));
            assert_eq!(settings.image_extensions, vec!["png", "jpg"]);
            assert_eq!(settings.model, "openai:gpt-4o-mini");
            assert_eq!(settings.text_color, "#112233");
            assert_eq!(settings.font_family, None);

            let missing = home.join("missing.toml");
            assert!(load_settings(Some(&missing)).is_err());
        });
    }
}
