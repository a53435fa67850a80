//! Adapter for a llama.cpp-server compatible completion backend. Talks to
//! an already-running server over HTTP: `/completion` for streamed
//! generation, `/tokenize` for token accounting.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokenflow_common::{ConversationMessage, Error, Result};
use tokenflow_config::BackendConfig;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, warn};

use crate::template::PromptTemplate;
use crate::{DeltaStream, GenerationHandle, HandleStats, LaunchSpec, ModelBackend};

pub struct LlamaBackend {
    client: Client,
    base_url: String,
    template: PromptTemplate,
    next_handle: AtomicU64,
    handles: Arc<RwLock<HashMap<GenerationHandle, Arc<HandleState>>>>,
}

struct HandleState {
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    stats: Mutex<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    prompt_tokens: usize,
    output_tokens: usize,
    started_at: Option<Instant>,
    first_token_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl StatsInner {
    fn snapshot(&self) -> (HandleStats, bool) {
        let started = self.started_at.unwrap_or_else(Instant::now);
        let end = self.finished_at.unwrap_or_else(Instant::now);
        let total_time = end.saturating_duration_since(started).as_secs_f64();
        let first_token_time = self
            .first_token_at
            .map(|t| t.saturating_duration_since(started).as_secs_f64())
            .unwrap_or(0.0);
        let speed = if total_time > 0.0 {
            self.output_tokens as f64 / total_time
        } else {
            0.0
        };
        (
            HandleStats {
                prompt_tokens: self.prompt_tokens,
                output_tokens: self.output_tokens,
                total_time,
                first_token_time,
                speed,
            },
            self.finished_at.is_some(),
        )
    }
}

/// Request body of the upstream `/completion` endpoint.
#[derive(Serialize)]
struct UpstreamRequest {
    prompt: String,
    n_predict: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub timings: Option<UpstreamTimings>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamTimings {
    #[serde(default)]
    pub prompt_n: Option<usize>,
    #[serde(default)]
    pub predicted_n: Option<usize>,
}

#[derive(Deserialize)]
struct TokenizeResponse {
    tokens: Vec<u32>,
}

/// Pop one complete SSE event (terminated by a blank line) off the buffer.
pub(crate) fn drain_event(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.windows(2).position(|w| w == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..pos + 2).collect();
    Some(String::from_utf8_lossy(&event).into_owned())
}

/// Parse one `data: {json}` line of the upstream stream.
pub(crate) fn parse_stream_line(line: &str) -> Option<UpstreamChunk> {
    let data = line.strip_prefix("data: ")?;
    serde_json::from_str(data).ok()
}

impl LlamaBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            template: PromptTemplate::default(),
            next_handle: AtomicU64::new(0),
            handles: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl ModelBackend for LlamaBackend {
    async fn count_prompt_tokens(&self, messages: &[ConversationMessage]) -> Result<usize> {
        let prompt = self.template.format_prompt(messages);
        Ok(self.tokenize(&prompt).await?.len())
    }

    async fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let url = format!("{}/tokenize", self.base_url);
        let response: TokenizeResponse = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "content": text }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.tokens)
    }

    async fn launch_stream(&self, spec: LaunchSpec) -> Result<(GenerationHandle, DeltaStream)> {
        let prompt = match &spec.raw_prompt {
            Some(raw) => raw.clone(),
            None => self.template.format_prompt(&spec.messages),
        };
        if !spec.images.is_empty() {
            warn!(
                count = spec.images.len(),
                "image inputs are not supported by the completion backend, ignoring"
            );
        }

        let handle = GenerationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let state = Arc::new(HandleState {
            cancel: Mutex::new(Some(cancel_tx)),
            stats: Mutex::new(StatsInner {
                started_at: Some(Instant::now()),
                ..Default::default()
            }),
        });
        self.handles.write().await.insert(handle, state.clone());

        let request = UpstreamRequest {
            prompt,
            n_predict: spec.params.max_tokens,
            temperature: spec.params.temperature,
            top_p: spec.params.top_p,
            top_k: spec.params.top_k,
            repeat_penalty: spec.params.frequency_penalty,
            stream: true,
        };
        let url = format!("{}/completion", self.base_url);
        let client = self.client.clone();

        let stream = async_stream::stream! {
            // Mark the generation finished no matter how the stream ends.
            let _finished = scopeguard::guard(state.clone(), |state| {
                if let Ok(mut stats) = state.stats.lock() {
                    stats.finished_at.get_or_insert_with(Instant::now);
                }
            });

            let response = tokio::select! {
                _ = &mut cancel_rx => {
                    debug!(%handle, "generation cancelled before upstream connect");
                    return;
                }
                response = client.post(&url).json(&request).send() => response,
            };

            let response = match response {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    yield Err(Error::Backend(format!(
                        "upstream returned status {}",
                        response.status()
                    )));
                    return;
                }
                Err(e) => {
                    yield Err(Error::Backend(format!("upstream request failed: {}", e)));
                    return;
                }
            };

            let mut bytes_stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            'read: loop {
                let chunk = tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!(%handle, "generation cancelled mid-stream");
                        break 'read;
                    }
                    chunk = bytes_stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };

                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(%handle, "stream read error: {}", e);
                        yield Err(Error::Backend(format!("stream error: {}", e)));
                        break;
                    }
                };
                buffer.extend_from_slice(&bytes);

                while let Some(event) = drain_event(&mut buffer) {
                    for line in event.lines() {
                        let Some(upstream) = parse_stream_line(line) else { continue };

                        if !upstream.content.is_empty() {
                            if let Ok(mut stats) = state.stats.lock() {
                                stats.first_token_at.get_or_insert_with(Instant::now);
                                stats.output_tokens += 1;
                            }
                            yield Ok(upstream.content);
                        }
                        if let Some(timings) = upstream.timings {
                            if let Ok(mut stats) = state.stats.lock() {
                                if let Some(prompt_n) = timings.prompt_n {
                                    stats.prompt_tokens = prompt_n;
                                }
                                if let Some(predicted_n) = timings.predicted_n {
                                    stats.output_tokens = predicted_n;
                                }
                            }
                        }
                        if upstream.stop {
                            debug!(%handle, "upstream signalled stop");
                            break 'read;
                        }
                    }
                }
            }
        };

        Ok((handle, Box::pin(stream)))
    }

    async fn abort(&self, handle: GenerationHandle) -> Result<()> {
        let state = self.handles.read().await.get(&handle).cloned();
        let Some(state) = state else {
            return Err(Error::Backend(format!("unknown generation handle {}", handle)));
        };

        let sender = state.cancel.lock().ok().and_then(|mut cancel| cancel.take());
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                debug!(%handle, "aborted generation");
            }
            None => debug!(%handle, "abort requested for already-stopping generation"),
        }
        Ok(())
    }

    async fn handle_stats(&self, handle: GenerationHandle) -> Option<HandleStats> {
        let mut handles = self.handles.write().await;
        let state = handles.get(&handle)?.clone();
        let (stats, finished) = state.stats.lock().ok()?.snapshot();
        if finished {
            handles.remove(&handle);
        }
        Some(stats)
    }
}
