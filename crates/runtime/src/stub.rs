//! Scripted in-memory backend for tests and offline smoke runs. Yields a
//! fixed delta sequence, records launches and aborts, and reports
//! configurable per-handle stats.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokenflow_common::{ConversationMessage, Error, Result};

use crate::{DeltaStream, GenerationHandle, HandleStats, LaunchSpec, ModelBackend, SamplingParams};

pub struct StubBackend {
    deltas: Vec<String>,
    prompt_tokens: usize,
    stats: Option<HandleStats>,
    fail_after: Option<usize>,
    next_handle: AtomicU64,
    launches: Mutex<Vec<LaunchSpec>>,
    aborted: Mutex<Vec<GenerationHandle>>,
    cancel_flags: Mutex<HashMap<GenerationHandle, Arc<AtomicBool>>>,
}

impl StubBackend {
    pub fn new<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            prompt_tokens: 0,
            stats: None,
            fail_after: None,
            next_handle: AtomicU64::new(0),
            launches: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_prompt_tokens(mut self, prompt_tokens: usize) -> Self {
        self.prompt_tokens = prompt_tokens;
        self
    }

    pub fn with_stats(mut self, stats: HandleStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Inject an upstream error before yielding the delta at `index`.
    pub fn failing_after(mut self, index: usize) -> Self {
        self.fail_after = Some(index);
        self
    }

    pub fn abort_count(&self) -> usize {
        self.aborted.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn aborted_handles(&self) -> Vec<GenerationHandle> {
        self.aborted.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn last_params(&self) -> Option<SamplingParams> {
        self.launches
            .lock()
            .ok()
            .and_then(|l| l.last().map(|spec| spec.params.clone()))
    }

    pub fn last_launch(&self) -> Option<LaunchSpec> {
        self.launches.lock().ok().and_then(|l| l.last().cloned())
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    async fn count_prompt_tokens(&self, _messages: &[ConversationMessage]) -> Result<usize> {
        Ok(self.prompt_tokens)
    }

    async fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.chars().map(|c| c as u32).collect())
    }

    async fn launch_stream(&self, spec: LaunchSpec) -> Result<(GenerationHandle, DeltaStream)> {
        let handle = GenerationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let flag = Arc::new(AtomicBool::new(false));
        if let Ok(mut flags) = self.cancel_flags.lock() {
            flags.insert(handle, flag.clone());
        }
        if let Ok(mut launches) = self.launches.lock() {
            launches.push(spec);
        }

        let deltas = self.deltas.clone();
        let fail_after = self.fail_after;
        let stream = async_stream::stream! {
            for (i, delta) in deltas.into_iter().enumerate() {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                if fail_after == Some(i) {
                    yield Err(Error::Backend("injected upstream failure".into()));
                    return;
                }
                yield Ok(delta);
                tokio::task::yield_now().await;
            }
        };
        Ok((handle, Box::pin(stream)))
    }

    async fn abort(&self, handle: GenerationHandle) -> Result<()> {
        let flag = self
            .cancel_flags
            .lock()
            .ok()
            .and_then(|flags| flags.get(&handle).cloned());
        let Some(flag) = flag else {
            return Err(Error::Backend(format!("unknown generation handle {}", handle)));
        };
        flag.store(true, Ordering::SeqCst);
        if let Ok(mut aborted) = self.aborted.lock() {
            aborted.push(handle);
        }
        Ok(())
    }

    async fn handle_stats(&self, _handle: GenerationHandle) -> Option<HandleStats> {
        Some(self.stats.clone().unwrap_or(HandleStats {
            prompt_tokens: self.prompt_tokens,
            output_tokens: self.deltas.len(),
            total_time: 0.0,
            first_token_time: 0.0,
            speed: 0.0,
        }))
    }
}
