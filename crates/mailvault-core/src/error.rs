use thiserror::Error;

use crate::gmail::GmailClientError;
use crate::state::StateError;
use crate::storage::StorageError;

/// Failures that end a run early. Per-message problems never show up here;
/// they are counted in the run stats instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("object storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("mailbox call failed: {0}")]
    Mailbox(#[from] GmailClientError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl RunError {
    pub fn is_lock_held(&self) -> bool {
        matches!(self, RunError::State(StateError::LockHeld(_)))
    }
}

/// Outcome of one message that did not succeed.
#[derive(Debug, Error)]
pub enum ItemError {
    /// Counted and sampled; the run moves on. The payload is already
    /// sanitized, e.g. `HttpError(status=404)`.
    #[error("{0}")]
    Failed(String),
    /// Stops the pipeline and fails the run.
    #[error(transparent)]
    Fatal(RunError),
}

impl From<GmailClientError> for ItemError {
    fn from(err: GmailClientError) -> Self {
        let status = err
            .status()
            .map(|status| status.to_string())
            .unwrap_or_else(|| "none".to_string());
        ItemError::Failed(format!("{}(status={status})", err.category()))
    }
}

impl From<StorageError> for ItemError {
    fn from(err: StorageError) -> Self {
        ItemError::Failed(format!("StorageError(code={})", err.code()))
    }
}

impl From<StateError> for ItemError {
    fn from(err: StateError) -> Self {
        ItemError::Fatal(RunError::State(err))
    }
}

impl From<std::io::Error> for ItemError {
    fn from(err: std::io::Error) -> Self {
        ItemError::Failed(format!("CodecError(code={:?})", err.kind()))
    }
}
