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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl OpenAI {
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
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    /// Chat completions body. Images travel as `image_url` data URIs inside
    /// the user message content.
    fn request_body(&self, tool: &ToolSpec) -> Value {
        let mut messages = Vec::new();
        let system = system_text(&self.messages);
        if !system.trim().is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &self.messages {
            if !matches!(message.role, MessageRole::User) {
                continue;
            }
            let content = message
                .parts
                .iter()
                .map(|part| match part {
                    MessagePart::Text(text) => json!({"type": "text", "text": text}),
                    MessagePart::Data(data) => {
                        let url = format!("data:{};base64,{}", data.mime, BASE64.encode(&data.bytes));
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect::<Vec<_>>();
            messages.push(json!({"role": "user", "content": content}));
        }

        json!({
            "model": self.model,
            "messages": messages,
            "tools": [
                {
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    }
                }
            ],
            "tool_choice": {"type": "function", "function": {"name": tool.name}}
        })
    }
}

impl Provider for OpenAI {
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
            let url = format!("{}/chat/completions", base_url());

            let mut backoff = RateLimitBackoff::new("OpenAI", &tool_name);
            loop {
                let response = client
                    .post(&url)
                    .bearer_auth(self.key.clone())
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
                    "OpenAI API error ({}): {}",
                    status,
                    extract_openai_error(&text).unwrap_or(text)
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

fn base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> StageResult<ProviderResponse> {
    let payload: OpenAIResponse = serde_json::from_str(text).map_err(|err| {
        StageError::MalformedResponse(format!("failed to parse OpenAI response JSON: {}", err))
    })?;
    let choice = payload
        .choices
        .first()
        .ok_or_else(|| StageError::Rejected("empty response from OpenAI".to_string()))?;
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(StageError::Rejected(
            "OpenAI content filter stopped the answer".to_string(),
        ));
    }
    if let Some(refusal) = choice
        .message
        .refusal
        .as_deref()
        .filter(|value| !value.trim().is_empty())
    {
        return Err(StageError::Rejected(format!("OpenAI refused: {}", refusal)));
    }

    let tool_call = choice
        .message
        .tool_calls
        .iter()
        .find(|call| call.function.name == tool_name)
        .ok_or_else(|| {
            StageError::MalformedResponse(format!("no '{}' call returned from OpenAI", tool_name))
        })?;
    let args: Value = serde_json::from_str(&tool_call.function.arguments).map_err(|err| {
        StageError::MalformedResponse(format!("failed to parse OpenAI tool arguments: {}", err))
    })?;
    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let parts = [
        error.message,
        error.kind.map(|kind| format!("type: {}", kind)),
        error.code.map(|code| format!("code: {}", code)),
    ]
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
struct OpenAIResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}
