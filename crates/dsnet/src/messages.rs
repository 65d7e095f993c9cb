//! The request envelope a node answers.
//!
//! Every exchange between two nodes is one [`RemoteRequest`] and one
//! [`RemoteResponse`]. Failures travel as [`RemoteResponse::Error`] so the
//! caller sees the same taxonomy the remote raised.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dsnet_core::{BlockId, DatasetId, Ref};
use dsnet_dsync::{limits, DsyncError, DsyncRequest, DsyncResponse, RejectReason, Retryable, SessionId};
use dsnet_logbook::{LogbookError, LogsyncRequest, LogsyncResponse, ResolvedRef};

/// Ref table requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RefRequest {
    /// Resolve a ref to a lineage and version path.
    Resolve(Ref),
    /// Every live ref the remote can resolve.
    List,
    /// Move the head to a completed session's root.
    Finalize { session_id: SessionId },
    /// Clear the head for a ref.
    Remove { reference: Ref },
}

/// Ref table responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RefResponse {
    Resolved(ResolvedRef),
    Listed(Vec<ResolvedRef>),
    Finalized { dataset: DatasetId, head: BlockId },
    Removed { dataset: DatasetId, previous: Option<BlockId> },
}

/// Everything one node can ask another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteRequest {
    Dsync(DsyncRequest),
    Logsync(LogsyncRequest),
    Refs(RefRequest),
}

/// Answers to [`RemoteRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteResponse {
    Dsync(DsyncResponse),
    Logsync(LogsyncResponse),
    Refs(RefResponse),
    Error(RemoteError),
}

impl RemoteRequest {
    /// Whether repeating this request after a transport failure is safe.
    pub fn is_idempotent(&self) -> bool {
        match self {
            RemoteRequest::Dsync(request) => request.is_idempotent(),
            RemoteRequest::Logsync(_) => true,
            RemoteRequest::Refs(RefRequest::Remove { .. }) => false,
            RemoteRequest::Refs(_) => true,
        }
    }

    /// Short name for logs and fault matching.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteRequest::Dsync(DsyncRequest::Push(_)) => "push",
            RemoteRequest::Dsync(DsyncRequest::PutBlock { .. }) => "put_block",
            RemoteRequest::Dsync(DsyncRequest::Complete { .. }) => "complete",
            RemoteRequest::Dsync(DsyncRequest::Pull(_)) => "pull",
            RemoteRequest::Dsync(DsyncRequest::GetBlock { .. }) => "get_block",
            RemoteRequest::Logsync(LogsyncRequest::Heads { .. }) => "logsync_heads",
            RemoteRequest::Logsync(LogsyncRequest::Pull { .. }) => "logsync_pull",
            RemoteRequest::Logsync(LogsyncRequest::Push { .. }) => "logsync_push",
            RemoteRequest::Refs(RefRequest::Resolve(_)) => "resolve",
            RemoteRequest::Refs(RefRequest::List) => "list",
            RemoteRequest::Refs(RefRequest::Finalize { .. }) => "finalize",
            RemoteRequest::Refs(RefRequest::Remove { .. }) => "remove",
        }
    }
}

impl RemoteResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteResponse::Dsync(_) => "dsync",
            RemoteResponse::Logsync(_) => "logsync",
            RemoteResponse::Refs(_) => "refs",
            RemoteResponse::Error(_) => "error",
        }
    }
}

/// A failure as seen across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RemoteError {
    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("rejected by remote: {0}")]
    Rejected(RejectReason),

    #[error("hash mismatch: claimed {claimed}, actual {actual}")]
    HashMismatch { claimed: BlockId, actual: BlockId },

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("incomplete transfer: {missing} blocks outstanding")]
    IncompleteTransfer { missing: usize },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("session failed: {0}")]
    SessionFailed(String),

    #[error("unexpected block: {0}")]
    UnexpectedBlock(BlockId),

    #[error("no commit of {path} in lineage {dataset}")]
    NotCommitted { dataset: DatasetId, path: BlockId },

    #[error("head conflict on {dataset}: expected {expected:?}, found {actual:?}")]
    HeadConflict {
        dataset: DatasetId,
        expected: Option<BlockId>,
        actual: Option<BlockId>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("remote failure: {0}")]
    Internal(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport(_) | RemoteError::Timeout(_))
    }
}

impl From<DsyncError> for RemoteError {
    fn from(e: DsyncError) -> Self {
        match e {
            DsyncError::RefNotFound(id) | DsyncError::BlockNotFound(id) => RemoteError::BlockNotFound(id),
            DsyncError::Rejected(reason) => RemoteError::Rejected(reason),
            DsyncError::HashMismatch { claimed, actual } => RemoteError::HashMismatch { claimed, actual },
            DsyncError::UnknownSession(id) => RemoteError::UnknownSession(id),
            DsyncError::IncompleteTransfer { missing } => RemoteError::IncompleteTransfer { missing },
            DsyncError::VerificationFailed(reason) => RemoteError::VerificationFailed(reason),
            DsyncError::SessionFailed(reason) => RemoteError::SessionFailed(reason),
            DsyncError::UnexpectedBlock(id) => RemoteError::UnexpectedBlock(id),
            DsyncError::InvalidMessage(reason) => RemoteError::InvalidRequest(reason),
            DsyncError::Transport(reason) => RemoteError::Transport(reason),
            DsyncError::Timeout(reason) => RemoteError::Timeout(reason),
            other => RemoteError::Internal(other.to_string()),
        }
    }
}

impl From<LogbookError> for RemoteError {
    fn from(e: LogbookError) -> Self {
        match e {
            LogbookError::RefNotFound(reference) => RemoteError::RefNotFound(reference),
            LogbookError::HeadConflict {
                dataset,
                expected,
                actual,
            } => RemoteError::HeadConflict {
                dataset,
                expected,
                actual,
            },
            LogbookError::InvalidMessage(reason) => RemoteError::InvalidRequest(reason),
            LogbookError::Transport(reason) => RemoteError::Transport(reason),
            LogbookError::Timeout(reason) => RemoteError::Timeout(reason),
            other => RemoteError::Internal(other.to_string()),
        }
    }
}

impl From<RemoteError> for DsyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::BlockNotFound(id) => DsyncError::BlockNotFound(id),
            RemoteError::Rejected(reason) => DsyncError::Rejected(reason),
            RemoteError::HashMismatch { claimed, actual } => DsyncError::HashMismatch { claimed, actual },
            RemoteError::UnknownSession(id) => DsyncError::UnknownSession(id),
            RemoteError::IncompleteTransfer { missing } => DsyncError::IncompleteTransfer { missing },
            RemoteError::VerificationFailed(reason) => DsyncError::VerificationFailed(reason),
            RemoteError::SessionFailed(reason) => DsyncError::SessionFailed(reason),
            RemoteError::UnexpectedBlock(id) => DsyncError::UnexpectedBlock(id),
            RemoteError::InvalidRequest(reason) => DsyncError::InvalidMessage(reason),
            RemoteError::Transport(reason) => DsyncError::Transport(reason),
            RemoteError::Timeout(reason) => DsyncError::Timeout(reason),
            other => DsyncError::Remote(other.to_string()),
        }
    }
}

impl From<RemoteError> for LogbookError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::RefNotFound(reference) => LogbookError::RefNotFound(reference),
            RemoteError::HeadConflict {
                dataset,
                expected,
                actual,
            } => LogbookError::HeadConflict {
                dataset,
                expected,
                actual,
            },
            RemoteError::InvalidRequest(reason) => LogbookError::InvalidMessage(reason),
            RemoteError::Transport(reason) => LogbookError::Transport(reason),
            RemoteError::Timeout(reason) => LogbookError::Timeout(reason),
            other => LogbookError::Remote(other.to_string()),
        }
    }
}

/// Encode a message as CBOR, enforcing [`limits::MAX_MESSAGE_BYTES`].
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, RemoteError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| RemoteError::InvalidRequest(format!("encode failed: {}", e)))?;
    check_size(buf.len())?;
    Ok(buf)
}

/// Decode a CBOR message, enforcing [`limits::MAX_MESSAGE_BYTES`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RemoteError> {
    check_size(bytes.len())?;
    ciborium::from_reader(bytes).map_err(|e| RemoteError::InvalidRequest(format!("decode failed: {}", e)))
}

fn check_size(len: usize) -> Result<(), RemoteError> {
    if len > limits::MAX_MESSAGE_BYTES {
        return Err(RemoteError::InvalidRequest(format!(
            "message of {} bytes exceeds limit of {}",
            len,
            limits::MAX_MESSAGE_BYTES
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dsnet_core::{Block, EntryBuilder, Keypair, Manifest, ManifestEntry};
    use dsnet_dsync::{NegotiateResponse, PushRequest};
    use std::collections::BTreeMap;

    #[test]
    fn test_envelope_survives_cbor() {
        let kp = Keypair::from_seed(&[3; 32]);
        let init = EntryBuilder::init("alice", "cities").timestamp(1).sign(&kp);
        let mut since = BTreeMap::new();
        since.insert(kp.public_key(), init.compute_id());

        let requests = vec![
            RemoteRequest::Logsync(LogsyncRequest::Push {
                dataset: init.dataset(),
                entries: vec![init.clone()],
            }),
            RemoteRequest::Logsync(LogsyncRequest::Pull {
                dataset: init.dataset(),
                since,
            }),
            RemoteRequest::Refs(RefRequest::Resolve(Ref::new("alice", "cities"))),
        ];
        for request in requests {
            let decoded: RemoteRequest = decode(&encode(&request).unwrap()).unwrap();
            assert_eq!(decoded.kind(), request.kind());
            assert_eq!(encode(&decoded).unwrap(), encode(&request).unwrap());
        }

        let block = Block::raw(b"payload");
        let put = RemoteRequest::Dsync(DsyncRequest::PutBlock {
            session_id: SessionId([7; 16]),
            id: block.id(),
            data: block.data().clone(),
        });
        match decode::<RemoteRequest>(&encode(&put).unwrap()).unwrap() {
            RemoteRequest::Dsync(DsyncRequest::PutBlock { id, data, .. }) => {
                assert_eq!(id, block.id());
                assert_eq!(data, *block.data());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_errors_cross_the_wire() {
        let response = RemoteResponse::Error(RemoteError::Rejected(RejectReason::SizePolicy {
            size: 10,
            limit: 5,
        }));
        match decode::<RemoteResponse>(&encode(&response).unwrap()).unwrap() {
            RemoteResponse::Error(e) => {
                assert!(matches!(DsyncError::from(e), DsyncError::Rejected(RejectReason::SizePolicy { .. })))
            }
            other => panic!("unexpected {:?}", other),
        }

        let accepted = RemoteResponse::Dsync(DsyncResponse::Negotiated(NegotiateResponse::Accepted {
            session_id: SessionId([1; 16]),
            missing: vec![BlockId::of(b"a")],
            prior_head: None,
        }));
        assert_eq!(decode::<RemoteResponse>(&encode(&accepted).unwrap()).unwrap().kind(), "dsync");
    }

    #[test]
    fn test_oversized_message_is_refused() {
        let data = Bytes::from(vec![0u8; limits::MAX_MESSAGE_BYTES + 1]);
        let put = RemoteRequest::Dsync(DsyncRequest::PutBlock {
            session_id: SessionId([0; 16]),
            id: BlockId::ZERO,
            data,
        });
        assert!(matches!(encode(&put), Err(RemoteError::InvalidRequest(_))));
    }

    #[test]
    fn test_idempotency() {
        let root = BlockId::of(b"root");
        let push = RemoteRequest::Dsync(DsyncRequest::Push(PushRequest {
            dataset: DatasetId::ZERO,
            username: "alice".into(),
            name: "cities".into(),
            manifest: Manifest {
                root,
                entries: vec![ManifestEntry { id: root, size: 1 }],
            },
        }));
        assert!(!push.is_idempotent());
        let remove = RemoteRequest::Refs(RefRequest::Remove {
            reference: Ref::new("alice", "cities"),
        });
        assert!(!remove.is_idempotent());
        assert!(RemoteRequest::Refs(RefRequest::Finalize {
            session_id: SessionId([2; 16])
        })
        .is_idempotent());
        assert!(RemoteError::Timeout("slow".into()).is_retryable());
        assert!(!RemoteError::VerificationFailed("bad".into()).is_retryable());
    }
}
