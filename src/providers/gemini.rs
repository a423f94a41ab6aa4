use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::{RateLimitBackoff, is_rate_limited, retry_after};
use super::{
    Message, MessagePart, MessageRole, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    ToolSpec, looks_rejected, system_text,
};
use crate::error::{StageError, StageResult};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub(crate) const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Finish reasons that mean the answer was withheld rather than produced.
const BLOCKING_FINISH_REASONS: [&str; 5] = [
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

#[derive(Debug, Clone)]
pub struct Gemini {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl Gemini {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        let model = model.trim().trim_start_matches("models/");
        if !model.is_empty() {
            self.model = model.to_string();
        }
        self
    }

    fn request_body(&self, tool: &ToolSpec) -> Value {
        let system_instruction = system_text(&self.messages);
        let contents = self
            .messages
            .iter()
            .filter(|message| matches!(message.role, MessageRole::User))
            .map(|message| {
                let parts = message
                    .parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text(text) => json!({"text": text}),
                        MessagePart::Data(data) => json!({
                            "inline_data": {
                                "mime_type": data.mime,
                                "data": BASE64.encode(&data.bytes)
                            }
                        }),
                    })
                    .collect::<Vec<_>>();
                json!({"role": "user", "parts": parts})
            })
            .collect::<Vec<_>>();

        json!({
            "contents": contents,
            "systemInstruction": if system_instruction.trim().is_empty() { Value::Null } else { json!({"parts": [{"text": system_instruction}]}) },
            "tools": [
                {
                    "function_declarations": [
                        {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters
                        }
                    ]
                }
            ],
            "tool_config": {
                "function_calling_config": {
                    "mode": "ANY",
                    "allowed_function_names": [tool.name]
                }
            }
        })
    }
}

impl Provider for Gemini {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn append_user_data(mut self, data: crate::data::DataAttachment) -> Self {
        self.messages.push(Message::user_data(data));
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = self
                .tools
                .iter()
                .find(|tool| tool.name == tool_name)
                .cloned()
                .ok_or_else(|| {
                    StageError::InvalidInput(format!("tool '{}' not registered", tool_name))
                })?;
            let body = self.request_body(&tool);
            let client = reqwest::Client::new();
            let url = format!("{}/{}:generateContent", BASE_URL, self.model);

            let mut backoff = RateLimitBackoff::new("Gemini", &tool_name);
            loop {
                let response = client
                    .post(&url)
                    .header("x-goog-api-key", self.key.clone())
                    .json(&body)
                    .send()
                    .await?;

                let status = response.status();
                let retry_after = retry_after(response.headers());
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    return extract_tool_response(&text, &tool_name, &self.model);
                }
                if is_rate_limited(status, &text) && backoff.pause(retry_after).await {
                    continue;
                }
                let message = format!(
                    "Gemini API error ({}): {}",
                    status,
                    extract_gemini_error(&text).unwrap_or(text)
                );
                return Err(if looks_rejected(&message) {
                    StageError::Rejected(message)
                } else {
                    StageError::Transport(message)
                });
            }
        })
    }
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> StageResult<ProviderResponse> {
    let payload: GeminiResponse = serde_json::from_str(text).map_err(|err| {
        StageError::MalformedResponse(format!("failed to parse Gemini response JSON: {}", err))
    })?;

    if let Some(reason) = payload
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_deref())
    {
        return Err(StageError::Rejected(format!(
            "Gemini blocked the prompt ({})",
            reason
        )));
    }

    let candidate = payload
        .candidates
        .first()
        .ok_or_else(|| StageError::Rejected("empty response from Gemini".to_string()))?;
    if let Some(reason) = candidate.finish_reason.as_deref()
        && BLOCKING_FINISH_REASONS.contains(&reason)
    {
        return Err(StageError::Rejected(format!(
            "Gemini withheld the answer ({})",
            reason
        )));
    }

    let parts = candidate
        .content
        .as_ref()
        .map(|content| content.parts.as_slice())
        .unwrap_or_default();
    let call = parts
        .iter()
        .filter_map(|part| part.function_call.as_ref())
        .find(|call| call.name == tool_name)
        .ok_or_else(|| {
            StageError::MalformedResponse(format!("no '{}' call returned from Gemini", tool_name))
        })?;

    let model = payload
        .model_version
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage_metadata.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    });
    Ok(ProviderResponse {
        args: call.args.clone(),
        model,
        usage,
    })
}

fn extract_gemini_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<GeminiError>,
    }

    #[derive(Deserialize)]
    struct GeminiError {
        message: Option<String>,
        status: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let parts = [error.message, error.status.map(|kind| format!("type: {}", kind))]
        .into_iter()
        .flatten()
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}
