//! Error types for the node.

use thiserror::Error;

use dsnet_core::{BlockId, CoreError, DatasetId};
use dsnet_dsync::{DsyncError, RejectReason};
use dsnet_logbook::LogbookError;
use dsnet_store::StoreError;

use crate::messages::RemoteError;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Block transfer error.
    #[error("dsync error: {0}")]
    Dsync(#[from] DsyncError),

    /// Log or ref error.
    #[error("logbook error: {0}")]
    Logbook(#[from] LogbookError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Encoding or validation error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A remote answered with an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// No remote with this name in the node config.
    #[error("unknown remote: {0}")]
    UnknownRemote(String),

    /// A live dataset already has this name.
    #[error("dataset already exists: {0}")]
    DatasetExists(String),

    /// The request was refused under this node's policy.
    #[error("rejected: {0}")]
    Rejected(RejectReason),

    /// A version path that the lineage never committed.
    #[error("no commit of {path} in lineage {dataset}")]
    NotCommitted {
        dataset: DatasetId,
        path: BlockId,
    },

    /// A whole push or pull ran past the sync timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A peer answered with the wrong response kind.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
}

impl NodeError {
    /// Whether the operation may succeed if tried again unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Dsync(e) => e.is_retryable(),
            NodeError::Logbook(e) => e.is_retryable(),
            NodeError::Remote(e) => matches!(e, RemoteError::Transport(_) | RemoteError::Timeout(_)),
            NodeError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<NodeError> for RemoteError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Dsync(e) => e.into(),
            NodeError::Logbook(e) => e.into(),
            NodeError::Remote(e) => e,
            NodeError::Rejected(reason) => RemoteError::Rejected(reason),
            NodeError::NotCommitted { dataset, path } => RemoteError::NotCommitted { dataset, path },
            NodeError::Timeout(reason) => RemoteError::Timeout(reason),
            other => RemoteError::Internal(other.to_string()),
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
