use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::{AdapterFuture, TextTranslator, TranslationItem, TranslationOutcome, TranslationRequest};
use crate::data;
use crate::error::{StageError, StageResult};
use crate::prompts::{self, TRANSLATE_TOOL_NAME};
use crate::providers::Provider;
use crate::records::{BubbleType, DEFAULT_FONT_SIZE, TextDirection};

/// One way of asking the model; tried in order until one lines up with the
/// input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStrategy {
    ImageGrounded,
    TextOnly,
}

impl TranslationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationStrategy::ImageGrounded => "image_grounded",
            TranslationStrategy::TextOnly => "text_only",
        }
    }

    pub fn chain(has_image: bool) -> Vec<TranslationStrategy> {
        if has_image {
            vec![
                TranslationStrategy::ImageGrounded,
                TranslationStrategy::TextOnly,
            ]
        } else {
            vec![TranslationStrategy::TextOnly]
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmTranslator<P: Provider> {
    provider: P,
}

#[derive(Debug, Default, Deserialize)]
struct TranslateArgs {
    #[serde(default)]
    translations: Vec<RawTranslation>,
    #[serde(default)]
    new_terminology: RawTerminology,
}

#[derive(Debug, Default, Deserialize)]
struct RawTranslation {
    #[serde(default)]
    original: String,
    #[serde(default)]
    translated: String,
    #[serde(default)]
    text_direction: Option<String>,
    #[serde(default)]
    bubble_type: Option<String>,
    #[serde(default)]
    estimated_font_size: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTerminology {
    Pairs(Vec<TermPair>),
    Map(BTreeMap<String, String>),
}

impl Default for RawTerminology {
    fn default() -> Self {
        RawTerminology::Pairs(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct TermPair {
    japanese: String,
    chinese: String,
}

impl<P: Provider> LlmTranslator<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    async fn run(&self, request: TranslationRequest<'_>) -> StageResult<TranslationOutcome> {
        if request.texts.is_empty() {
            return Ok(TranslationOutcome {
                translations: Vec::new(),
                new_terminology: BTreeMap::new(),
                success: true,
                error: None,
                used_image: false,
            });
        }
        let mut last_error = None;
        for strategy in TranslationStrategy::chain(request.image.is_some()) {
            match self.attempt(strategy, request).await {
                Ok(outcome) => {
                    info!(
                        "translated {} texts via {}",
                        outcome.translations.len(),
                        strategy.as_str()
                    );
                    return Ok(outcome);
                }
                Err(err) if err.is_retryable() => {
                    warn!("{} translation failed: {}", strategy.as_str(), err);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        let message = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no translation strategy applied".to_string());
        Ok(TranslationOutcome::pass_through(request.texts, message))
    }

    async fn attempt(
        &self,
        strategy: TranslationStrategy,
        request: TranslationRequest<'_>,
    ) -> StageResult<TranslationOutcome> {
        let image = match strategy {
            TranslationStrategy::ImageGrounded => request.image,
            TranslationStrategy::TextOnly => None,
        };
        let prompt = prompts::render_translate_prompt(
            request.texts,
            request.terminology,
            request.history,
            image.is_some(),
        )?;
        let mut provider = self
            .provider
            .clone()
            .register_tool(prompts::translate_tool_spec());
        if let Some(image) = image {
            provider = provider.append_user_data(data::load_image_attachment(image)?);
        }
        let response = provider
            .append_system_input(prompt.system)
            .append_user_input(prompt.user)
            .call_tool(TRANSLATE_TOOL_NAME)
            .await?;
        debug!(
            "translation answered by {}",
            response.model.as_deref().unwrap_or("unknown model")
        );
        let args: TranslateArgs = serde_json::from_value(response.args)?;
        let translations = normalize_translations(request.texts, args.translations)?;
        Ok(TranslationOutcome {
            translations,
            new_terminology: collect_terms(args.new_terminology),
            success: true,
            error: None,
            used_image: image.is_some(),
        })
    }
}

impl<P: Provider> TextTranslator for LlmTranslator<P> {
    fn translate<'a>(
        &'a self,
        request: TranslationRequest<'a>,
    ) -> AdapterFuture<'a, TranslationOutcome> {
        Box::pin(self.run(request))
    }
}

fn normalize_translations(
    texts: &[String],
    raw: Vec<RawTranslation>,
) -> StageResult<Vec<TranslationItem>> {
    if raw.len() != texts.len() {
        return Err(StageError::CountMismatch {
            expected: texts.len(),
            actual: raw.len(),
        });
    }
    Ok(raw
        .into_iter()
        .zip(texts)
        .map(|(item, source)| {
            let original = if item.original.trim().is_empty() {
                source.clone()
            } else {
                item.original
            };
            let translated = if item.translated.trim().is_empty() {
                original.clone()
            } else {
                item.translated
            };
            TranslationItem {
                original,
                translated,
                text_direction: item.text_direction.as_deref().and_then(parse_direction),
                bubble_type: item
                    .bubble_type
                    .as_deref()
                    .map(parse_bubble_type)
                    .unwrap_or_default(),
                estimated_font_size: item
                    .estimated_font_size
                    .filter(|size| size.is_finite() && *size >= 1.0)
                    .map(|size| size.round() as u32)
                    .unwrap_or(DEFAULT_FONT_SIZE),
            }
        })
        .collect())
}

fn parse_direction(value: &str) -> Option<TextDirection> {
    match value.trim().to_lowercase().as_str() {
        "vertical" => Some(TextDirection::Vertical),
        "horizontal" => Some(TextDirection::Horizontal),
        _ => None,
    }
}

fn parse_bubble_type(value: &str) -> BubbleType {
    match value.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
        "textured" => BubbleType::Textured,
        "transparent" => BubbleType::Transparent,
        _ => BubbleType::PureWhite,
    }
}

fn collect_terms(raw: RawTerminology) -> BTreeMap<String, String> {
    let pairs = match raw {
        RawTerminology::Pairs(pairs) => pairs
            .into_iter()
            .map(|pair| (pair.japanese, pair.chinese))
            .collect::<Vec<_>>(),
        RawTerminology::Map(map) => map.into_iter().collect(),
    };
    pairs
        .into_iter()
        .map(|(source, target)| (source.trim().to_string(), target.trim().to_string()))
        .filter(|(source, target)| !source.is_empty() && !target.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataAttachment;
    use crate::providers::{ProviderFuture, ProviderResponse, ToolSpec};
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Answers each call with the next queued result and records whether an
    /// image was attached.
    #[derive(Clone)]
    struct ScriptedProvider {
        answers: Arc<Mutex<VecDeque<StageResult<Value>>>>,
        attached: Arc<Mutex<Vec<bool>>>,
        system: Arc<Mutex<Vec<String>>>,
        has_image: bool,
    }

    impl ScriptedProvider {
        fn new(answers: Vec<StageResult<Value>>) -> Self {
            Self {
                answers: Arc::new(Mutex::new(answers.into())),
                attached: Arc::new(Mutex::new(Vec::new())),
                system: Arc::new(Mutex::new(Vec::new())),
                has_image: false,
            }
        }

        fn calls(&self) -> Vec<bool> {
            self.attached.lock().expect("attached").clone()
        }
    }

    impl Provider for ScriptedProvider {
        fn append_system_input(self, input: String) -> Self {
            self.system.lock().expect("system").push(input);
            self
        }

        fn append_user_input(self, _input: String) -> Self {
            self
        }

        fn append_user_data(mut self, _data: DataAttachment) -> Self {
            self.has_image = true;
            self
        }

        fn register_tool(self, _tool: ToolSpec) -> Self {
            self
        }

        fn call_tool(self, _tool_name: &str) -> ProviderFuture {
            self.attached.lock().expect("attached").push(self.has_image);
            let answer = self
                .answers
                .lock()
                .expect("answers")
                .pop_front()
                .unwrap_or_else(|| Err(StageError::Transport("no scripted answer".into())));
            Box::pin(async move {
                answer.map(|args| ProviderResponse {
                    args,
                    model: None,
                    usage: None,
                })
            })
        }

        fn model_name(&self) -> String {
            "scripted".to_string()
        }
    }

    fn texts() -> Vec<String> {
        vec!["キクルさん".to_string(), "行くぞ".to_string()]
    }

    fn two_translations() -> Value {
        json!({
            "translations": [
                {"original": "キクルさん", "translated": "奇庫魯先生", "bubble_type": "textured", "estimated_font_size": 21.6},
                {"original": "", "translated": "走吧", "text_direction": "vertical"}
            ],
            "new_terminology": [{"japanese": "キクル", "chinese": "奇庫魯(男性)"}]
        })
    }

    fn request<'a>(
        texts: &'a [String],
        terms: &'a BTreeMap<String, String>,
    ) -> TranslationRequest<'a> {
        TranslationRequest {
            texts,
            terminology: terms,
            history: &[],
            image: None,
        }
    }

    #[tokio::test]
    async fn text_only_success_is_normalized() {
        let provider = ScriptedProvider::new(vec![Ok(two_translations())]);
        let translator = LlmTranslator::new(provider.clone());
        let texts = texts();
        let terms = BTreeMap::new();
        let outcome = translator
            .translate(request(&texts, &terms))
            .await
            .expect("outcome");
        assert!(outcome.success);
        assert!(!outcome.used_image);
        assert_eq!(outcome.translations[0].bubble_type, BubbleType::Textured);
        assert_eq!(outcome.translations[0].estimated_font_size, 22);
        assert_eq!(outcome.translations[1].original, "行くぞ");
        assert_eq!(outcome.translations[1].bubble_type, BubbleType::PureWhite);
        assert_eq!(outcome.translations[1].estimated_font_size, DEFAULT_FONT_SIZE);
        assert_eq!(
            outcome.translations[1].text_direction,
            Some(TextDirection::Vertical)
        );
        assert_eq!(
            outcome.new_terminology.get("キクル").map(String::as_str),
            Some("奇庫魯(男性)")
        );
        assert_eq!(provider.calls(), vec![false]);
        let system = provider.system.lock().expect("system").clone();
        assert_eq!(system.len(), 1);
        assert!(system[0].contains("嚴格規則"));
        assert!(!system[0].contains("行くぞ"));
    }

    #[tokio::test]
    async fn count_mismatch_moves_to_next_strategy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("page.png");
        image::RgbImage::from_pixel(4, 4, image::Rgb([255, 255, 255]))
            .save(&image)
            .expect("page");
        let short = json!({"translations": [{"original": "キクルさん", "translated": "奇庫魯"}]});
        let provider = ScriptedProvider::new(vec![Ok(short), Ok(two_translations())]);
        let translator = LlmTranslator::new(provider.clone());
        let texts = texts();
        let terms = BTreeMap::new();
        let outcome = translator
            .translate(TranslationRequest {
                image: Some(&image),
                ..request(&texts, &terms)
            })
            .await
            .expect("outcome");
        assert!(outcome.success);
        assert!(!outcome.used_image);
        assert_eq!(provider.calls(), vec![true, false]);
    }

    #[tokio::test]
    async fn exhausted_chain_passes_texts_through() {
        let provider = ScriptedProvider::new(vec![Err(StageError::Rejected(
            "blocked".to_string(),
        ))]);
        let translator = LlmTranslator::new(provider);
        let texts = texts();
        let terms = BTreeMap::new();
        let outcome = translator
            .translate(request(&texts, &terms))
            .await
            .expect("outcome");
        assert!(!outcome.success);
        assert_eq!(outcome.translations.len(), 2);
        assert!(
            outcome
                .translations
                .iter()
                .all(|item| item.original == item.translated)
        );
        assert!(outcome.error.as_deref().unwrap_or_default().contains("blocked"));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let provider = ScriptedProvider::new(vec![Err(StageError::InvalidInput(
            "bad page".to_string(),
        ))]);
        let translator = LlmTranslator::new(provider.clone());
        let texts = texts();
        let terms = BTreeMap::new();
        let err = translator
            .translate(request(&texts, &terms))
            .await
            .expect_err("fail fast");
        assert!(matches!(err, StageError::InvalidInput(_)));
        assert_eq!(provider.calls().len(), 1);
    }

    #[test]
    fn terminology_accepts_object_form() {
        let args: TranslateArgs = serde_json::from_value(json!({
            "translations": [],
            "new_terminology": {"エノメ": "艾諾梅(女性)", " ": "x"}
        }))
        .expect("args");
        let terms = collect_terms(args.new_terminology);
        assert_eq!(terms.len(), 1);
        assert_eq!(parse_bubble_type("Pure White"), BubbleType::PureWhite);
        assert_eq!(parse_bubble_type("transparent"), BubbleType::Transparent);
    }
}
