mod llama_backend;
mod registry;
mod stub;
pub mod template;


pub use llama_backend::LlamaBackend;
pub use registry::{ActiveRequestRegistry, CancelOutcome};
pub use stub::StubBackend;
pub use template::PromptTemplate;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokenflow_common::{ConversationMessage, DecodedImage, Result, ToolSpec};

/// Opaque identifier for one in-flight generation inside the backend.
/// Exclusively owned by the session that launched it; the active-request
/// registry only holds a lookup reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationHandle(pub u64);

impl std::fmt::Display for GenerationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-handle statistics reported by the backend. Times are seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleStats {
    pub prompt_tokens: usize,
    pub output_tokens: usize,
    pub total_time: f64,
    pub first_token_time: f64,
    pub speed: f64,
}

/// Effective sampling parameters handed to the backend at launch. `None`
/// knobs fall through to the backend's own defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub min_tokens: usize,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub frequency_penalty: Option<f32>,
}

/// One generation launch. `raw_prompt` bypasses conversation templating
/// for the plain-completion endpoint.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub messages: Vec<ConversationMessage>,
    pub raw_prompt: Option<String>,
    pub params: SamplingParams,
    pub tools: Option<Vec<ToolSpec>>,
    pub images: Vec<DecodedImage>,
}

/// Lazy, finite, non-restartable sequence of generated text fragments.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The external model capability. Implementations own generation progress,
/// token accounting and per-handle bookkeeping; callers own the request
/// lifecycle around it.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Count prompt tokens for a normalized conversation.
    async fn count_prompt_tokens(&self, messages: &[ConversationMessage]) -> Result<usize>;

    /// Tokenize a text fragment.
    async fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Start a generation and return its handle plus the delta stream.
    async fn launch_stream(&self, spec: LaunchSpec) -> Result<(GenerationHandle, DeltaStream)>;

    /// Abort an in-flight generation. Must not be called on a normally
    /// finished handle.
    async fn abort(&self, handle: GenerationHandle) -> Result<()>;

    /// Stats snapshot for a handle, or `None` for an unknown one. Querying
    /// a finished handle releases its bookkeeping, so terminal stats can be
    /// read exactly once.
    async fn handle_stats(&self, handle: GenerationHandle) -> Option<HandleStats>;
}
