//! Events emitted by a completion worker back to the UI context.

use serde::{Deserialize, Serialize};

/// Generation token assigned by the caller when a worker is started.
///
/// Tokens increase monotonically for the lifetime of the process, so an
/// event can be matched against the request that is still current.
pub type Epoch = u64;

/// Progress of one completion request.
///
/// `text` is always the full reply accumulated so far, never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompletionEvent {
    /// More text arrived
    Increment { epoch: Epoch, text: String },
    /// Stream finished; carries the complete reply
    Completed { epoch: Epoch, text: String },
    /// Request failed or was cancelled
    Failed { epoch: Epoch, error: String },
}

impl CompletionEvent {
    pub fn epoch(&self) -> Epoch {
        match self {
            CompletionEvent::Increment { epoch, .. } => *epoch,
            CompletionEvent::Completed { epoch, .. } => *epoch,
            CompletionEvent::Failed { epoch, .. } => *epoch,
        }
    }

    /// Whether this event ends the stream for its epoch.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompletionEvent::Increment { .. })
    }
}
