use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::{CheckpointEntry, CheckpointPosition, CompletionRequest, RunId};

/// Model backend: one completion per call, plain text back.
pub trait ModelBackend: Send + Sync + 'static {
    /// Send a single (text or text+image) completion request.
    fn complete(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<String>>;

    /// Backend name for logs.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Durable keyed run snapshots for suspend/resume.
///
/// One current entry per run id; `put` replaces it.
pub trait Checkpointer: Send + Sync + 'static {
    fn get(&self, run_id: &RunId) -> Result<Option<CheckpointEntry>>;

    fn put(&self, entry: &CheckpointEntry) -> Result<()>;

    /// Move a run's position from `from` to `to`, only if it is currently at `from`.
    ///
    /// Atomic with respect to other calls on the same store: of several
    /// concurrent claims on one position exactly one gets `true`. Returns
    /// `false` when the run is missing or elsewhere.
    fn transition(
        &self,
        run_id: &RunId,
        from: &CheckpointPosition,
        to: &CheckpointPosition,
    ) -> Result<bool>;
}
