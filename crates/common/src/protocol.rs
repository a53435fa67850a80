//! OpenAI-compatible wire types for `/v1/chat/completions` and
//! `/v1/completions`, plus the sampling-parameter validator.
//!
//! Aggregated responses are serialized with explicit nulls; stream chunks
//! omit unset fields, so the two paths get separate serde treatment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Seconds since the epoch, for `created` fields.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn chat_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn completion_id() -> String {
    format!("cmpl-{}", Uuid::new_v4().simple())
}

pub fn tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Per-process fingerprint identifying the current model configuration.
pub fn system_fingerprint() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("fp_{}", &hex[..12])
}

/// Token usage accounting. `total_tokens` is always the sum of the other
/// two; use [`UsageInfo::new`] rather than building the struct by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UsageInfo {
    pub prompt_tokens: usize,
    pub total_tokens: usize,
    pub completion_tokens: usize,
}

impl UsageInfo {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Options controlling usage reporting on streamed responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    pub include_usage: Option<bool>,
    pub continuous_usage_stats: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// One entry of the request's `tools` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments object, passed through verbatim.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: tool_call_id(),
            tool_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Result of tool-call detection over generated text.
#[derive(Debug, Clone, Default)]
pub struct ExtractedToolCallInfo {
    pub tools_called: bool,
    pub tool_calls: Vec<ToolCall>,
    /// Residual plain-text content; content and tool calls can coexist.
    pub content: Option<String>,
}

/// Free-form message content: a plain string, an array of typed parts, or
/// something this server does not understand (rejected during
/// normalization, not during deserialization).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
    Other(serde_json::Value),
}

/// A chat message exactly as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChatMessage {
    #[serde(default = "user_role")]
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "reasoning_content")]
    pub reasoning: Option<String>,
}

fn user_role() -> String {
    "user".to_string()
}

impl RawChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            reasoning: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSpec {
    One(String),
    Many(Vec<String>),
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<RawChatMessage>,
    /// Legacy convenience field: appended as a final user turn.
    #[serde(default)]
    pub prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub n: Option<u32>,
    pub max_tokens: Option<usize>,
    pub max_completion_tokens: Option<usize>,
    pub min_tokens: Option<usize>,
    pub logprobs: Option<bool>,
    pub top_logprobs: Option<i32>,
    pub stop: Option<StopSpec>,
    pub stream: Option<bool>,
    pub stream_options: Option<StreamOptions>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub logit_bias: Option<HashMap<String, f32>>,
    pub seed: Option<i64>,
    pub user: Option<String>,
    pub tools: Option<Vec<ToolSpec>>,
    /// Accepted for wire compatibility; tool selection is model-driven.
    pub tool_choice: Option<serde_json::Value>,
    pub parallel_tool_calls: Option<bool>,
}

impl ChatCompletionRequest {
    /// Validate sampling parameters against their documented ranges.
    /// Each knob is checked independently; the first violation wins and
    /// names the offending parameter.
    pub fn validate(&self) -> Result<()> {
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(invalid_param("temperature", "temperature must be between 0 and 2"));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(invalid_param("top_p", "top_p must be between 0 and 1"));
            }
        }
        if let Some(top_logprobs) = self.top_logprobs {
            if !(0..=20).contains(&top_logprobs) {
                return Err(invalid_param("top_logprobs", "top_logprobs must be between 0 and 20"));
            }
        }
        if let Some(n) = self.n {
            if n > 1 {
                return Err(invalid_param("n", "n > 1 is not supported yet"));
            }
        }
        if let Some(presence_penalty) = self.presence_penalty {
            if !(-2.0..=2.0).contains(&presence_penalty) {
                return Err(invalid_param(
                    "presence_penalty",
                    "presence_penalty must be between -2 and 2",
                ));
            }
        }
        if let Some(frequency_penalty) = self.frequency_penalty {
            if !(-2.0..=2.0).contains(&frequency_penalty) {
                return Err(invalid_param(
                    "frequency_penalty",
                    "frequency_penalty must be between -2 and 2",
                ));
            }
        }
        Ok(())
    }

    /// Resolved usage-reporting mode for streamed responses. Usage in the
    /// final chunk is the default; an explicit `include_usage: false` with
    /// continuous reporting off suppresses it entirely.
    pub fn usage_mode(&self) -> (bool, bool) {
        let opts = self.stream_options.clone().unwrap_or_default();
        let include_usage = opts.include_usage.unwrap_or(true);
        let continuous = opts.continuous_usage_stats.unwrap_or(false);
        (include_usage, continuous)
    }
}

fn invalid_param(param: &str, message: &str) -> Error {
    Error::InvalidParameter {
        param: param.to_string(),
        message: message.to_string(),
    }
}

/// Assistant message inside an aggregated response. Serialized with
/// explicit nulls, matching the aggregated-response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponseChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionResponseChoice>,
    pub usage: UsageInfo,
    pub system_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaFunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One tool-call fragment inside a stream delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<DeltaFunctionCall>,
}

/// Incremental message fragment carried by one stream chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<DeltaToolCall>,
}

impl DeltaMessage {
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Default::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.is_none()
            && self.reasoning_content.is_none()
            && self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionStreamChoice {
    pub index: u32,
    pub delta: DeltaMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One SSE chunk of a streamed chat completion. Unset fields are omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionStreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

/// Prompt field of `POST /v1/completions`: a string or a list of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptSpec {
    One(String),
    Many(Vec<serde_json::Value>),
}

impl PromptSpec {
    /// First prompt as text; list prompts beyond the first are ignored.
    pub fn first_text(&self) -> Option<String> {
        match self {
            PromptSpec::One(text) => Some(text.clone()),
            PromptSpec::Many(items) => items.first().map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }
}

/// Request body for `POST /v1/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    pub prompt: PromptSpec,
    pub suffix: Option<String>,
    pub temperature: Option<f32>,
    pub n: Option<u32>,
    pub max_tokens: Option<usize>,
    pub stop: Option<StopSpec>,
    pub stream: Option<bool>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub logprobs: Option<i32>,
    pub echo: Option<bool>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponseChoice {
    pub index: u32,
    pub text: String,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionResponseChoice>,
    pub usage: UsageInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStreamChoice {
    pub index: u32,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionStreamChoice>,
}

/// `GET /v1/models` card for the single served model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
    pub root: Option<String>,
    pub parent: Option<String>,
}

impl ModelCard {
    pub fn new(model: &str, created: i64) -> Self {
        Self {
            id: model.to_string(),
            object: "model",
            created,
            owned_by: "tokenflow",
            root: Some(model.to_string()),
            parent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}
