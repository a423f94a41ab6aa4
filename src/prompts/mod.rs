use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tera::{Context as TeraContext, Tera};

use crate::providers::ToolSpec;
use crate::records::{BBox, HistoryEntry};

pub const REORDER_TOOL_NAME: &str = "deliver_reading_order";
pub const TRANSLATE_TOOL_NAME: &str = "deliver_translation";

const REORDER_SYSTEM_TEMPLATE: &str = include_str!("templates/reorder_system.tera");
const REORDER_TEMPLATE: &str = include_str!("templates/reorder.tera");
const TRANSLATE_SYSTEM_TEMPLATE: &str = include_str!("templates/translate_system.tera");
const TRANSLATE_TEMPLATE: &str = include_str!("templates/translate.tera");

/// Fixed rules go out as the system message, page data as the user turn.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    fn render(system: &str, user: &str, context: &TeraContext, what: &str) -> Result<Self> {
        Ok(Self {
            system: Tera::one_off(system, context, false)
                .with_context(|| format!("failed to render {} rules", what))?,
            user: Tera::one_off(user, context, false)
                .with_context(|| format!("failed to render {} prompt", what))?,
        })
    }
}

/// One fragment as shown to the reading-order prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ReorderItem {
    pub index: usize,
    pub bbox: BBox,
    pub text: String,
}

#[derive(Debug, Serialize)]
struct TermLine<'a> {
    source: &'a str,
    target: &'a str,
}

pub fn reorder_tool_spec() -> ToolSpec {
    ToolSpec {
        name: REORDER_TOOL_NAME.to_string(),
        description: "Return every text fragment with its reading-order rank.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "reordered_texts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "original_index": {"type": "integer"},
                            "new_order": {"type": "integer"},
                            "bbox": {"type": "array", "items": {"type": "integer"}},
                            "text": {"type": "string"}
                        },
                        "required": ["original_index", "new_order", "bbox", "text"]
                    }
                }
            },
            "required": ["reordered_texts"]
        }),
    }
}

pub fn translate_tool_spec() -> ToolSpec {
    ToolSpec {
        name: TRANSLATE_TOOL_NAME.to_string(),
        description: "Return one translation per input text plus newly found proper nouns."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "translations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "original": {"type": "string"},
                            "translated": {"type": "string"},
                            "text_direction": {"type": "string", "enum": ["horizontal", "vertical"]},
                            "bubble_type": {"type": "string", "enum": ["pure_white", "textured", "transparent"]},
                            "estimated_font_size": {"type": "integer"}
                        },
                        "required": ["original", "translated", "bubble_type", "estimated_font_size"]
                    }
                },
                "new_terminology": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "japanese": {"type": "string"},
                            "chinese": {"type": "string"}
                        },
                        "required": ["japanese", "chinese"]
                    }
                }
            },
            "required": ["translations", "new_terminology"]
        }),
    }
}

pub fn render_reorder_prompt(items: &[ReorderItem], with_image: bool) -> Result<Prompt> {
    let mut context = TeraContext::new();
    context.insert("with_image", &with_image);
    context.insert("count", &items.len());
    context.insert("items_json", &serde_json::to_string_pretty(items)?);
    context.insert("tool_name", REORDER_TOOL_NAME);
    Prompt::render(REORDER_SYSTEM_TEMPLATE, REORDER_TEMPLATE, &context, "reorder")
}

/// `history` is rendered as given; callers pass the recent window only.
pub fn render_translate_prompt(
    texts: &[String],
    terminology: &BTreeMap<String, String>,
    history: &[HistoryEntry],
    with_image: bool,
) -> Result<Prompt> {
    let terms = terminology
        .iter()
        .map(|(source, target)| TermLine { source, target })
        .collect::<Vec<_>>();
    let mut context = TeraContext::new();
    context.insert("with_image", &with_image);
    context.insert("count", &texts.len());
    context.insert("texts_json", &serde_json::to_string_pretty(texts)?);
    context.insert("terminology", &terms);
    context.insert("history", history);
    context.insert("tool_name", TRANSLATE_TOOL_NAME);
    Prompt::render(TRANSLATE_SYSTEM_TEMPLATE, TRANSLATE_TEMPLATE, &context, "translation")
}
