//! Error types for the dsync module.

use thiserror::Error;

use dsnet_core::BlockId;

use crate::messages::{RejectReason, SessionId};
use crate::session::SessionState;

/// Errors that can occur during block transfer.
#[derive(Debug, Error)]
pub enum DsyncError {
    /// The version root is not held locally.
    #[error("ref not found: {0}")]
    RefNotFound(BlockId),

    /// A block linked from a present root is missing.
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    /// The remote refused the session under its policy.
    #[error("rejected by remote: {0}")]
    Rejected(RejectReason),

    /// Block bytes don't hash to the claimed id.
    #[error("hash mismatch: claimed {claimed}, actual {actual}")]
    HashMismatch { claimed: BlockId, actual: BlockId },

    /// No live session with this id.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// `Complete` arrived before every requested block.
    #[error("incomplete transfer: {missing} blocks outstanding")]
    IncompleteTransfer { missing: usize },

    /// The received DAG has dangling links or disagrees with its manifest.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The session already failed.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// A block that was never requested.
    #[error("unexpected block: {0}")]
    UnexpectedBlock(BlockId),

    /// State machine misuse.
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote failed the request for a reason outside this taxonomy.
    #[error("remote error: {0}")]
    Remote(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] dsnet_store::StoreError),

    /// Block decoding failed.
    #[error("core error: {0}")]
    Core(#[from] dsnet_core::CoreError),
}

impl DsyncError {
    /// Transport failures may be retried; integrity and policy failures never.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DsyncError::Transport(_) | DsyncError::Timeout(_))
    }
}

/// Result type for dsync operations.
pub type Result<T> = std::result::Result<T, DsyncError>;
