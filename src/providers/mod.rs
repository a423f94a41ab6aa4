use anyhow::{Result, anyhow};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

use crate::data::DataAttachment;
use crate::error::{StageError, StageResult};

mod gemini;
mod openai;
pub(crate) mod retry;

pub use gemini::Gemini;
pub use openai::OpenAI;

pub const DEFAULT_MODEL_ARG: &str = "gemini:gemini-2.0-flash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

/// A forced function call: the model must answer with JSON matching
/// `parameters`.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub args: serde_json::Value,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug, Clone, Copy)]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone)]
pub enum MessagePart {
    Text(String),
    Data(DataAttachment),
}

impl Message {
    pub fn system(content: String) -> Self {
        Self {
            role: MessageRole::System,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user_data(data: DataAttachment) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Data(data)],
        }
    }
}

pub(crate) fn system_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| matches!(message.role, MessageRole::System))
        .flat_map(|message| message.parts.iter())
        .filter_map(|part| match part {
            MessagePart::Text(text) => Some(text.as_str()),
            MessagePart::Data(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = StageResult<ProviderResponse>> + Send>>;

pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn append_user_data(self, data: DataAttachment) -> Self;
    fn register_tool(self, tool: ToolSpec) -> Self;
    fn call_tool(self, tool_name: &str) -> ProviderFuture;
    fn model_name(&self) -> String;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    Gemini(Gemini),
}

impl Provider for ProviderImpl {
    fn append_system_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_system_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_system_input(input))
            }
        }
    }

    fn append_user_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_user_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_user_input(input))
            }
        }
    }

    fn append_user_data(self, data: DataAttachment) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.append_user_data(data)),
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.append_user_data(data)),
        }
    }

    fn register_tool(self, tool: ToolSpec) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.register_tool(tool)),
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.register_tool(tool)),
        }
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.call_tool(tool_name),
            ProviderImpl::Gemini(provider) => provider.call_tool(tool_name),
        }
    }

    fn model_name(&self) -> String {
        match self {
            ProviderImpl::OpenAI(provider) => provider.model_name(),
            ProviderImpl::Gemini(provider) => provider.model_name(),
        }
    }
}

pub fn build_provider(provider: ProviderKind, key: String, model: Option<String>) -> ProviderImpl {
    match provider {
        ProviderKind::OpenAI => {
            ProviderImpl::OpenAI(OpenAI::new(key).with_model(model.unwrap_or_default()))
        }
        ProviderKind::Gemini => {
            ProviderImpl::Gemini(Gemini::new(key).with_model(model.unwrap_or_default()))
        }
    }
}

/// Parses `provider:model` or a bare provider name.
pub fn parse_model_arg(model_arg: &str) -> Result<ProviderSelection> {
    let raw = model_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }
    if let Some(provider) = provider_from_name(&raw.to_lowercase()) {
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }
    if let Some((provider_part, model_part)) = raw.split_once(':')
        && let Some(provider) = provider_from_name(&provider_part.to_lowercase())
    {
        let model = model_part.trim();
        return Ok(ProviderSelection {
            provider,
            requested_model: (!model.is_empty()).then(|| model.to_string()),
        });
    }
    Err(anyhow!(
        "unable to infer provider from model '{}'. Use provider:model (openai:, gemini:)",
        raw
    ))
}

pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> StageResult<String> {
    if let Some(key) = override_key.filter(|key| !key.trim().is_empty()) {
        return Ok(key.to_string());
    }
    match provider {
        ProviderKind::OpenAI => get_env("OPENAI_API_KEY"),
        ProviderKind::Gemini => get_env("GEMINI_API_KEY")
            .or_else(|| get_env("GOOGLE_API_KEY"))
            .or_else(|| get_env("genaikey")),
    }
    .ok_or_else(|| {
        StageError::Unavailable(format!("API key not found for {}", provider.as_str()))
    })
}

fn provider_from_name(name: &str) -> Option<ProviderKind> {
    match name {
        "openai" => Some(ProviderKind::OpenAI),
        "gemini" | "google" => Some(ProviderKind::Gemini),
        _ => None,
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Phrases LLM backends use when they refuse or filter a request.
pub(crate) fn looks_rejected(text: &str) -> bool {
    let lower = text.to_lowercase();
    [
        "content filter",
        "content_filter",
        "blocked",
        "safety",
        "policy violation",
        "inappropriate content",
        "recitation",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}
