//! Dsync protocol message types.
//!
//! A push is a sequence of request/response exchanges:
//!
//! ```text
//! Pusher                               Remote coordinator
//!   |-------- Push(manifest) ---------->|
//!   |<------- Accepted{missing} --------|   (or Rejected{reason})
//!   |-------- PutBlock ... ------------>|   one per missing block
//!   |<------- BlockAccepted ------------|
//!   |-------- Complete ---------------->|
//!   |<------- Completed ----------------|
//! ```
//!
//! A pull is `Pull(root)` followed by `GetBlock` for each missing block.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use dsnet_core::{BlockId, DatasetId, Manifest};

/// Message size limits.
pub mod limits {
    /// Max encoded size of any request or response.
    pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;
    /// Max blocks in one manifest.
    pub const MAX_MANIFEST_ENTRIES: usize = 100_000;
    /// Max bytes in one block.
    pub const MAX_BLOCK_BYTES: usize = 4 * 1024 * 1024;
}

/// Server-generated session identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    /// Generate a random session id.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.to_hex())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Which way blocks flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Push,
    Pull,
}

/// Why a remote refused a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Total manifest size exceeds the remote's limit.
    SizePolicy { size: u64, limit: u64 },
    /// The remote does not accept pushes.
    Disabled,
    /// The owner or dataset isn't on the remote's allow list.
    NotAllowed,
    /// The remote is at its concurrent session cap.
    TooManySessions,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SizePolicy { size, limit } => {
                write!(f, "payload of {} bytes exceeds limit of {}", size, limit)
            }
            RejectReason::Disabled => f.write_str("remote does not accept pushes"),
            RejectReason::NotAllowed => f.write_str("not on the remote's allow list"),
            RejectReason::TooManySessions => f.write_str("too many concurrent sessions"),
        }
    }
}

/// Offer of a version to a remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Lineage the version belongs to.
    pub dataset: DatasetId,
    /// Dataset owner, checked against the allow list.
    pub username: String,
    /// Dataset name, checked against the allow list.
    pub name: String,
    pub manifest: Manifest,
}

/// The remote's answer to a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiateResponse {
    Accepted {
        session_id: SessionId,
        /// Exactly the blocks the remote lacks, in manifest order.
        missing: Vec<BlockId>,
        /// The remote's head for the dataset when the session opened.
        prior_head: Option<BlockId>,
    },
    Rejected {
        reason: RejectReason,
    },
}

/// Request for the manifest of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub root: BlockId,
}

/// Result of a successful `Complete`, identical on every retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteReport {
    pub session_id: SessionId,
    pub dataset: DatasetId,
    /// Owner and name as the pusher gave them.
    pub username: String,
    pub name: String,
    pub root: BlockId,
    /// Blocks newly written to the store.
    pub blocks_committed: usize,
    pub prior_head: Option<BlockId>,
}

/// All dsync requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DsyncRequest {
    Push(PushRequest),
    PutBlock {
        session_id: SessionId,
        id: BlockId,
        data: Bytes,
    },
    Complete {
        session_id: SessionId,
    },
    Pull(PullRequest),
    GetBlock {
        id: BlockId,
    },
}

/// All dsync responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DsyncResponse {
    Negotiated(NegotiateResponse),
    BlockAccepted { fresh: bool },
    Completed(CompleteReport),
    Manifest(Manifest),
    Block { id: BlockId, data: Bytes },
}

impl DsyncRequest {
    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> Result<(), &'static str> {
        match self {
            DsyncRequest::Push(req) => {
                if req.manifest.entries.len() > limits::MAX_MANIFEST_ENTRIES {
                    return Err("too many manifest entries");
                }
            }
            DsyncRequest::PutBlock { data, .. } => {
                if data.len() > limits::MAX_BLOCK_BYTES {
                    return Err("block too large");
                }
            }
            DsyncRequest::Complete { .. } | DsyncRequest::Pull(_) | DsyncRequest::GetBlock { .. } => {}
        }
        Ok(())
    }

    /// Whether repeating this request after a transport failure is safe.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, DsyncRequest::Push(_))
    }
}
