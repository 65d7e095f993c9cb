//! Error types for the logbook.

use thiserror::Error;

use dsnet_core::{BlockId, CoreError, DatasetId, EntryId, ValidationError};
use dsnet_store::StoreError;

/// Errors from log application, logsync and ref resolution.
#[derive(Debug, Error)]
pub enum LogbookError {
    /// The entry's parent is not in the log.
    #[error("invalid parent: entry {entry} references unknown parent {parent}")]
    InvalidParent { entry: EntryId, parent: EntryId },

    /// The entry failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No lineage, head or commit matches the ref.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// The lineage has no entries.
    #[error("unknown dataset: {0}")]
    UnknownDataset(DatasetId),

    /// The lineage was deleted.
    #[error("dataset deleted: {0}")]
    Deleted(DatasetId),

    /// A head compare-and-swap lost the race.
    #[error("head conflict on {dataset}: expected {expected:?}, found {actual:?}")]
    HeadConflict {
        dataset: DatasetId,
        expected: Option<BlockId>,
        actual: Option<BlockId>,
    },

    /// The peer sent something that doesn't answer the request.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer failed the request for a reason outside this taxonomy.
    #[error("remote error: {0}")]
    Remote(String),

    /// Transport-level error talking to a peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// Timeout waiting for a peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Decoding failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl LogbookError {
    /// Transport failures may be retried; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogbookError::Transport(_) | LogbookError::Timeout(_))
    }
}

/// Result type for logbook operations.
pub type Result<T> = std::result::Result<T, LogbookError>;
