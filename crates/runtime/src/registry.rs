use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{GenerationHandle, ModelBackend};

/// Outcome of an external cancel keyed by request id. `NotFound` is
/// distinct from "found but the backend abort failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    Failed(String),
}

/// Process-wide mapping from request id to generation handle, used by the
/// external cancel path. Entries are added at launch and removed at the
/// terminal completion of the request.
///
/// Removal happens before the abort call, under the write lock, so the
/// disconnect path and the cancel side-channel can race and the handle is
/// still aborted at most once.
#[derive(Clone)]
pub struct ActiveRequestRegistry {
    backend: Arc<dyn ModelBackend>,
    inner: Arc<RwLock<HashMap<String, GenerationHandle>>>,
}

impl ActiveRequestRegistry {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, request_id: &str, handle: GenerationHandle) {
        self.inner
            .write()
            .await
            .insert(request_id.to_string(), handle);
    }

    /// Remove the entry and abort its generation.
    pub async fn lookup_and_abort(&self, request_id: &str) -> CancelOutcome {
        let handle = { self.inner.write().await.remove(request_id) };
        let Some(handle) = handle else {
            warn!(request_id, "no active request found for cancellation");
            return CancelOutcome::NotFound;
        };

        match self.backend.abort(handle).await {
            Ok(()) => {
                info!(request_id, handle = %handle, "cancelled request");
                CancelOutcome::Cancelled
            }
            Err(e) => {
                warn!(request_id, handle = %handle, "abort failed: {}", e);
                CancelOutcome::Failed(e.to_string())
            }
        }
    }

    /// Remove the entry without touching the generation. Used on normal
    /// completion, where aborting would corrupt backend cache state.
    pub async fn deregister(&self, request_id: &str) -> bool {
        self.inner.write().await.remove(request_id).is_some()
    }

    /// Snapshot of active request ids for operational inspection.
    pub async fn list_active(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}
