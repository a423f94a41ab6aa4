use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

use super::{AdapterFuture, TextReorderer};
use crate::data;
use crate::error::{StageError, StageResult};
use crate::prompts::{self, REORDER_TOOL_NAME, ReorderItem};
use crate::providers::Provider;
use crate::records::{ExtractedText, ReorderedText};

/// Reading-order resolution through an LLM tool call.
#[derive(Debug, Clone)]
pub struct LlmReorderer<P: Provider> {
    provider: P,
}

#[derive(Debug, Deserialize)]
struct ReorderArgs {
    #[serde(default)]
    reordered_texts: Vec<RankedFragment>,
}

#[derive(Debug, Deserialize)]
struct RankedFragment {
    original_index: usize,
    new_order: usize,
}

impl<P: Provider> LlmReorderer<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    async fn run(
        &self,
        image: Option<&Path>,
        texts: &[ExtractedText],
    ) -> StageResult<Vec<ReorderedText>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let items = texts
            .iter()
            .map(|text| ReorderItem {
                index: text.box_index,
                bbox: text.bbox,
                text: text.text.clone(),
            })
            .collect::<Vec<_>>();
        let prompt = prompts::render_reorder_prompt(&items, image.is_some())?;

        let mut provider = self.provider.clone().register_tool(prompts::reorder_tool_spec());
        if let Some(image) = image {
            provider = provider.append_user_data(data::load_image_attachment(image)?);
        }
        let response = provider
            .append_system_input(prompt.system)
            .append_user_input(prompt.user)
            .call_tool(REORDER_TOOL_NAME)
            .await?;
        let args: ReorderArgs = serde_json::from_value(response.args)?;
        let ordered = apply_ranking(texts, &args.reordered_texts)?;
        debug!("reading order resolved for {} fragments", ordered.len());
        Ok(ordered)
    }
}

impl<P: Provider> TextReorderer for LlmReorderer<P> {
    fn reorder_with_image<'a>(
        &'a self,
        image: &'a Path,
        texts: &'a [ExtractedText],
    ) -> AdapterFuture<'a, Vec<ReorderedText>> {
        Box::pin(self.run(Some(image), texts))
    }

    fn reorder_text_only<'a>(
        &'a self,
        texts: &'a [ExtractedText],
    ) -> AdapterFuture<'a, Vec<ReorderedText>> {
        Box::pin(self.run(None, texts))
    }
}

/// Checks the model's ranking covers every input once with ranks `0..n`,
/// then rebuilds the records from the OCR output sorted by rank.
fn apply_ranking(
    texts: &[ExtractedText],
    ranking: &[RankedFragment],
) -> StageResult<Vec<ReorderedText>> {
    if ranking.len() != texts.len() {
        return Err(StageError::MalformedResponse(format!(
            "reading order covers {} of {} fragments",
            ranking.len(),
            texts.len()
        )));
    }
    let by_index = texts
        .iter()
        .map(|text| (text.box_index, text))
        .collect::<BTreeMap<_, _>>();
    let mut seen_indices = BTreeSet::new();
    let mut seen_ranks = BTreeSet::new();
    let mut ordered = Vec::with_capacity(ranking.len());
    for entry in ranking {
        let Some(source) = by_index.get(&entry.original_index) else {
            return Err(StageError::MalformedResponse(format!(
                "unknown original_index {}",
                entry.original_index
            )));
        };
        if !seen_indices.insert(entry.original_index) {
            return Err(StageError::MalformedResponse(format!(
                "original_index {} listed twice",
                entry.original_index
            )));
        }
        if entry.new_order >= texts.len() || !seen_ranks.insert(entry.new_order) {
            return Err(StageError::MalformedResponse(format!(
                "new_order {} is not a permutation of 0..{}",
                entry.new_order,
                texts.len()
            )));
        }
        ordered.push(ReorderedText {
            original_index: source.box_index,
            new_order: entry.new_order,
            bbox: source.bbox,
            text: source.text.clone(),
        });
    }
    ordered.sort_by_key(|text| text.new_order);
    Ok(ordered)
}
