//! Generation session: owns one in-flight request from launch to terminal
//! completion. Launch computes effective sampling parameters, counts
//! prompt tokens, registers the handle; the aggregated and streaming
//! drivers poll for client disconnect between deltas and run the terminal
//! bookkeeping (final stats, deregistration) exactly once on every path.

use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokenflow_common::conversation::normalize_conversation;
use tokenflow_common::{
    chat_completion_id, completion_id, unix_timestamp, ChatCompletionChunk,
    ChatCompletionRequest, ChatCompletionResponse, ChatCompletionResponseChoice,
    ChatCompletionStreamChoice, ChatMessage, CompletionChunk, CompletionRequest,
    CompletionResponse, CompletionResponseChoice, CompletionStreamChoice, ConversationMessage,
    DeltaMessage, Error, RawChatMessage, Result, ToolCall, UsageInfo,
};
use tokenflow_runtime::{
    ActiveRequestRegistry, DeltaStream, GenerationHandle, LaunchSpec, ModelBackend,
    SamplingParams,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::streaming::SsePayload;
use crate::toolcall::{StreamingToolContext, ToolCallParser};

const DEFAULT_CHAT_MAX_TOKENS: usize = 32768;
const DEFAULT_COMPLETION_MAX_TOKENS: usize = 16;

/// Transport-side disconnect probe, polled between deltas.
pub trait DisconnectWatch: Send + Sync {
    fn is_disconnected(&self) -> bool;
}

/// For paths where disconnects surface as a dropped future instead of a
/// pollable flag; the session guard covers cleanup there.
pub struct NeverDisconnects;

impl DisconnectWatch for NeverDisconnects {
    fn is_disconnected(&self) -> bool {
        false
    }
}

/// Shared per-process state handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn ModelBackend>,
    pub registry: ActiveRequestRegistry,
    pub http: reqwest::Client,
    pub model_name: Arc<str>,
    pub fingerprint: Arc<str>,
    pub request_counter: Arc<AtomicU64>,
    pub tool_parser_override: Option<String>,
    pub log_prompt_input: bool,
}

impl SessionContext {
    fn select_parser(&self) -> ToolCallParser {
        ToolCallParser::for_model(&self.model_name, self.tool_parser_override.as_deref())
    }
}

/// One launched generation, with its cleanup guard armed.
pub struct LaunchedGeneration {
    pub request_id: String,
    pub handle: GenerationHandle,
    pub prompt_tokens: usize,
    pub created: i64,
    stream: DeltaStream,
    guard: SessionGuard,
}

/// Guarantees terminal bookkeeping even when the request future is
/// abandoned mid-flight (client gone between suspension points on the
/// aggregated path). Normal paths run [`finish_session`] and disarm it;
/// an armed drop aborts whatever is still registered, then emits stats.
struct SessionGuard {
    backend: Arc<dyn ModelBackend>,
    registry: ActiveRequestRegistry,
    request_id: String,
    handle: GenerationHandle,
    armed: bool,
}

impl SessionGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = self.backend.clone();
        let registry = self.registry.clone();
        let request_id = std::mem::take(&mut self.request_id);
        let handle = self.handle;
        tokio::spawn(async move {
            warn!(request_id = %request_id, "request abandoned mid-flight, aborting");
            registry.lookup_and_abort(&request_id).await;
            log_final_stats(backend.as_ref(), handle, &request_id).await;
        });
    }
}

/// Emit final per-request statistics from the backend's per-handle query.
async fn log_final_stats(backend: &dyn ModelBackend, handle: GenerationHandle, request_id: &str) {
    match backend.handle_stats(handle).await {
        Some(stats) => info!(
            request_id,
            prompt_tokens = stats.prompt_tokens,
            output_tokens = stats.output_tokens,
            total_time = stats.total_time,
            first_token_time = stats.first_token_time,
            speed = stats.speed,
            "inference stats"
        ),
        None => debug!(request_id, "no stats available for request"),
    }
}

/// The single terminal bookkeeping step: stats emission plus registry
/// deregistration, after which the guard is inert. Runs once per request
/// regardless of which terminal path was taken.
async fn finish_session(ctx: &SessionContext, guard: &mut SessionGuard) {
    guard.disarm();
    info!(request_id = %guard.request_id, "request complete");
    log_final_stats(ctx.backend.as_ref(), guard.handle, &guard.request_id).await;
    ctx.registry.deregister(&guard.request_id).await;
}

/// Effective sampling parameters for a chat request.
///
/// `frequency_penalty` treats both "absent" and "explicitly 0.0" as unset
/// and substitutes 1.0. Deliberate, externally observable behavior:
/// clients that want no penalty must send 1.0.
pub fn effective_sampling(request: &ChatCompletionRequest) -> SamplingParams {
    let frequency_penalty = match request.frequency_penalty {
        Some(fp) if fp != 0.0 => fp,
        _ => 1.0,
    };
    SamplingParams {
        max_tokens: request
            .max_tokens
            .or(request.max_completion_tokens)
            .unwrap_or(DEFAULT_CHAT_MAX_TOKENS),
        min_tokens: request.min_tokens.unwrap_or(0),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        frequency_penalty: Some(frequency_penalty),
    }
}

/// Normalize, count, number, launch and register a chat generation.
pub async fn launch_chat(
    ctx: &SessionContext,
    request: &ChatCompletionRequest,
) -> Result<LaunchedGeneration> {
    let mut messages = request.messages.clone();
    if let Some(prompt) = &request.prompt {
        if !prompt.is_empty() {
            messages.push(RawChatMessage::user(prompt.clone()));
        }
    }

    let (conversation, images) = normalize_conversation(&messages, &ctx.http).await?;
    if ctx.log_prompt_input {
        debug!(?conversation, "normalized input messages");
    }
    if !images.is_empty() {
        info!(count = images.len(), "detected images in request");
    }

    let prompt_tokens = ctx.backend.count_prompt_tokens(&conversation).await?;
    let params = effective_sampling(request);

    let request_id = chat_completion_id();
    let request_number = ctx.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
    info!(request = request_number, request_id = %request_id, "request started");

    let (handle, stream) = ctx
        .backend
        .launch_stream(LaunchSpec {
            messages: conversation,
            raw_prompt: None,
            params,
            tools: request.tools.clone(),
            images,
        })
        .await?;
    ctx.registry.register(&request_id, handle).await;
    debug!(request_id = %request_id, handle = %handle, "registered generation handle");

    Ok(LaunchedGeneration {
        request_id: request_id.clone(),
        handle,
        prompt_tokens,
        created: unix_timestamp(),
        stream,
        guard: SessionGuard {
            backend: ctx.backend.clone(),
            registry: ctx.registry.clone(),
            request_id,
            handle,
            armed: true,
        },
    })
}

/// Aggregated (non-streaming) chat driver. A disconnect mid-accumulation
/// is a terminal error: the generation is aborted exactly once and no
/// partial response is produced.
pub async fn chat_completion_full(
    ctx: &SessionContext,
    request: &ChatCompletionRequest,
    mut launched: LaunchedGeneration,
    watch: &dyn DisconnectWatch,
) -> Result<ChatCompletionResponse> {
    let mut result = String::new();
    let mut completion_tokens = 0usize;

    while let Some(delta) = launched.stream.next().await {
        let delta = match delta {
            Ok(delta) => delta,
            Err(e) => {
                finish_session(ctx, &mut launched.guard).await;
                return Err(e);
            }
        };
        result.push_str(&delta);
        completion_tokens += 1;

        if watch.is_disconnected() {
            debug!(request_id = %launched.request_id, "abort request (client disconnected)");
            ctx.registry.lookup_and_abort(&launched.request_id).await;
            finish_session(ctx, &mut launched.guard).await;
            return Err(Error::Disconnected);
        }
    }

    let mut finish_reason = "stop";
    let mut tool_calls: Option<Vec<ToolCall>> = None;
    let mut content = Some(result.clone());

    if request.tools.is_some() {
        let extracted = ctx.select_parser().extract_full(&result, request);
        if extracted.tools_called && !extracted.tool_calls.is_empty() {
            finish_reason = "tool_calls";
            tool_calls = Some(extracted.tool_calls);
            content = extracted.content;
        }
    }

    let response = ChatCompletionResponse {
        id: launched.request_id.clone(),
        object: "chat.completion".to_string(),
        created: launched.created,
        model: ctx.model_name.to_string(),
        choices: vec![ChatCompletionResponseChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content,
                tool_calls,
                tool_call_id: None,
                name: None,
                reasoning: None,
            },
            logprobs: None,
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage: UsageInfo::new(launched.prompt_tokens, completion_tokens),
        system_fingerprint: Some(ctx.fingerprint.to_string()),
    };

    finish_session(ctx, &mut launched.guard).await;
    Ok(response)
}

fn chat_chunk(
    ctx: &SessionContext,
    launched: &LaunchedGeneration,
    delta: DeltaMessage,
    finish_reason: Option<&str>,
    usage: Option<UsageInfo>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: launched.request_id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: launched.created,
        model: ctx.model_name.to_string(),
        choices: vec![ChatCompletionStreamChoice {
            index: 0,
            delta,
            logprobs: None,
            finish_reason: finish_reason.map(str::to_string),
        }],
        usage,
        system_fingerprint: Some(ctx.fingerprint.to_string()),
    }
}

/// Streaming chat driver. Pushes frames into the bounded response channel;
/// deltas are re-emitted strictly in arrival order since incremental
/// tool-call parsing depends on monotonic accumulation.
pub async fn chat_completion_stream(
    ctx: SessionContext,
    request: ChatCompletionRequest,
    mut launched: LaunchedGeneration,
    watch: Arc<dyn DisconnectWatch>,
    tx: mpsc::Sender<SsePayload>,
) {
    let (include_usage, continuous_usage) = request.usage_mode();
    let mut completion_tokens = 0usize;

    // 1. role chunk
    let usage = continuous_usage.then(|| UsageInfo::new(launched.prompt_tokens, 0));
    let role_chunk = chat_chunk(&ctx, &launched, DeltaMessage::role("assistant"), None, usage);
    if tx.send(SsePayload::Chat(role_chunk)).await.is_err() {
        ctx.registry.lookup_and_abort(&launched.request_id).await;
        finish_session(&ctx, &mut launched.guard).await;
        return;
    }

    // Parser variant is resolved once per session, not re-resolved per delta
    let parser = request.tools.as_ref().map(|_| ctx.select_parser());
    let mut previous_text = String::new();
    let mut current_text = String::new();
    let mut previous_token_ids: Vec<u32> = Vec::new();
    let mut current_token_ids: Vec<u32> = Vec::new();

    // 2. content / tool-call chunks
    while let Some(delta) = launched.stream.next().await {
        let delta_text = match delta {
            Ok(delta) => delta,
            Err(e) => {
                warn!(request_id = %launched.request_id, "stream error: {}", e);
                let _ = tx.send(SsePayload::error(&e)).await;
                finish_session(&ctx, &mut launched.guard).await;
                let _ = tx.send(SsePayload::Done).await;
                return;
            }
        };

        if watch.is_disconnected() {
            debug!(request_id = %launched.request_id, "abort stream request (client disconnected)");
            ctx.registry.lookup_and_abort(&launched.request_id).await;
            finish_session(&ctx, &mut launched.guard).await;
            return;
        }
        completion_tokens += 1;

        let delta_message = match &parser {
            Some(parser) => {
                let delta_token_ids = ctx.backend.tokenize(&delta_text).await.unwrap_or_default();
                current_text.push_str(&delta_text);
                current_token_ids.extend_from_slice(&delta_token_ids);

                let delta_message = parser.extract_streaming(
                    &StreamingToolContext {
                        previous_text: &previous_text,
                        current_text: &current_text,
                        delta_text: &delta_text,
                        previous_token_ids: &previous_token_ids,
                        current_token_ids: &current_token_ids,
                        delta_token_ids: &delta_token_ids,
                    },
                    &request,
                );

                previous_text.push_str(&delta_text);
                previous_token_ids.extend_from_slice(&delta_token_ids);
                delta_message
            }
            None => Some(DeltaMessage::content(delta_text.clone())),
        };

        if let Some(delta_message) = delta_message {
            let usage =
                continuous_usage.then(|| UsageInfo::new(launched.prompt_tokens, completion_tokens));
            let chunk = chat_chunk(&ctx, &launched, delta_message, None, usage);
            if tx.send(SsePayload::Chat(chunk)).await.is_err() {
                ctx.registry.lookup_and_abort(&launched.request_id).await;
                finish_session(&ctx, &mut launched.guard).await;
                return;
            }
        }
    }

    // 3. final chunk, then cleanup, then the terminal sentinel
    let final_usage = (include_usage || continuous_usage)
        .then(|| UsageInfo::new(launched.prompt_tokens, completion_tokens));
    let final_chunk = chat_chunk(&ctx, &launched, DeltaMessage::default(), Some("stop"), final_usage);
    let _ = tx.send(SsePayload::Chat(final_chunk)).await;

    finish_session(&ctx, &mut launched.guard).await;
    let _ = tx.send(SsePayload::Done).await;
}

/// Launch a plain (non-chat) completion. The prompt bypasses conversation
/// templating; `frequency_penalty` passes through as given, without the
/// chat path's substitution.
pub async fn launch_completion(
    ctx: &SessionContext,
    request: &CompletionRequest,
) -> Result<(LaunchedGeneration, String)> {
    let prompt = request
        .prompt
        .first_text()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::BadRequest("Prompt cannot be empty".into()))?;

    let prompt_tokens = ctx.backend.tokenize(&prompt).await?.len();
    let params = SamplingParams {
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_COMPLETION_MAX_TOKENS),
        min_tokens: 0,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        frequency_penalty: request.frequency_penalty,
    };

    let request_id = completion_id();
    let request_number = ctx.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
    info!(request = request_number, request_id = %request_id, "request started");

    let (handle, stream) = ctx
        .backend
        .launch_stream(LaunchSpec {
            messages: vec![ConversationMessage::text("user", prompt.clone())],
            raw_prompt: Some(prompt.clone()),
            params,
            tools: None,
            images: Vec::new(),
        })
        .await?;
    ctx.registry.register(&request_id, handle).await;

    Ok((
        LaunchedGeneration {
            request_id: request_id.clone(),
            handle,
            prompt_tokens,
            created: unix_timestamp(),
            stream,
            guard: SessionGuard {
                backend: ctx.backend.clone(),
                registry: ctx.registry.clone(),
                request_id,
                handle,
                armed: true,
            },
        },
        prompt,
    ))
}

/// Finish reason for the plain-completion endpoint: clamped against
/// `max_tokens`. The chat path deliberately does not do this.
fn completion_finish_reason(completion_tokens: usize, request: &CompletionRequest) -> &'static str {
    if completion_tokens >= request.max_tokens.unwrap_or(DEFAULT_COMPLETION_MAX_TOKENS) {
        "length"
    } else {
        "stop"
    }
}

/// Aggregated plain-completion driver.
pub async fn completion_full(
    ctx: &SessionContext,
    request: &CompletionRequest,
    mut launched: LaunchedGeneration,
    prompt: String,
    watch: &dyn DisconnectWatch,
) -> Result<CompletionResponse> {
    let mut result = String::new();
    if request.echo.unwrap_or(false) {
        result.push_str(&prompt);
    }
    let mut completion_tokens = 0usize;

    while let Some(delta) = launched.stream.next().await {
        let delta = match delta {
            Ok(delta) => delta,
            Err(e) => {
                finish_session(ctx, &mut launched.guard).await;
                return Err(e);
            }
        };
        result.push_str(&delta);
        completion_tokens += 1;

        if watch.is_disconnected() {
            debug!(request_id = %launched.request_id, "abort completion request (client disconnected)");
            ctx.registry.lookup_and_abort(&launched.request_id).await;
            finish_session(ctx, &mut launched.guard).await;
            return Err(Error::Disconnected);
        }
    }

    let response = CompletionResponse {
        id: launched.request_id.clone(),
        object: "text_completion".to_string(),
        created: launched.created,
        model: ctx.model_name.to_string(),
        choices: vec![CompletionResponseChoice {
            index: 0,
            text: result,
            logprobs: None,
            finish_reason: Some(completion_finish_reason(completion_tokens, request).to_string()),
        }],
        usage: UsageInfo::new(launched.prompt_tokens, completion_tokens),
    };

    finish_session(ctx, &mut launched.guard).await;
    Ok(response)
}

fn completion_chunk(
    ctx: &SessionContext,
    launched: &LaunchedGeneration,
    text: String,
    finish_reason: Option<&str>,
) -> CompletionChunk {
    CompletionChunk {
        id: launched.request_id.clone(),
        object: "text_completion".to_string(),
        created: launched.created,
        model: ctx.model_name.to_string(),
        choices: vec![CompletionStreamChoice {
            index: 0,
            text,
            logprobs: None,
            finish_reason: finish_reason.map(str::to_string),
        }],
    }
}

/// Streaming plain-completion driver.
pub async fn completion_stream(
    ctx: SessionContext,
    request: CompletionRequest,
    mut launched: LaunchedGeneration,
    prompt: String,
    watch: Arc<dyn DisconnectWatch>,
    tx: mpsc::Sender<SsePayload>,
) {
    let mut completion_tokens = 0usize;

    if request.echo.unwrap_or(false) {
        let chunk = completion_chunk(&ctx, &launched, prompt, None);
        if tx.send(SsePayload::Completion(chunk)).await.is_err() {
            ctx.registry.lookup_and_abort(&launched.request_id).await;
            finish_session(&ctx, &mut launched.guard).await;
            return;
        }
    }

    while let Some(delta) = launched.stream.next().await {
        let delta_text = match delta {
            Ok(delta) => delta,
            Err(e) => {
                warn!(request_id = %launched.request_id, "completion stream error: {}", e);
                let _ = tx.send(SsePayload::error(&e)).await;
                finish_session(&ctx, &mut launched.guard).await;
                let _ = tx.send(SsePayload::Done).await;
                return;
            }
        };

        if watch.is_disconnected() {
            debug!(request_id = %launched.request_id, "abort completion stream (client disconnected)");
            ctx.registry.lookup_and_abort(&launched.request_id).await;
            finish_session(&ctx, &mut launched.guard).await;
            return;
        }
        completion_tokens += 1;

        let chunk = completion_chunk(&ctx, &launched, delta_text, None);
        if tx.send(SsePayload::Completion(chunk)).await.is_err() {
            ctx.registry.lookup_and_abort(&launched.request_id).await;
            finish_session(&ctx, &mut launched.guard).await;
            return;
        }
    }

    let finish_reason = completion_finish_reason(completion_tokens, &request);
    let final_chunk = completion_chunk(&ctx, &launched, String::new(), Some(finish_reason));
    let _ = tx.send(SsePayload::Completion(final_chunk)).await;

    finish_session(&ctx, &mut launched.guard).await;
    let _ = tx.send(SsePayload::Done).await;
}
