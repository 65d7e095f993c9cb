//! The remote side of a dsync exchange, as seen by a client session.

use async_trait::async_trait;
use bytes::Bytes;

use dsnet_core::{BlockId, Manifest};

use crate::error::Result;
use crate::messages::{CompleteReport, NegotiateResponse, PullRequest, PushRequest, SessionId};

/// Typed dsync calls against a peer.
///
/// Implemented directly by [`RemoteSessionCoordinator`] for in-process use
/// and by network clients that carry the calls over a transport.
///
/// [`RemoteSessionCoordinator`]: crate::RemoteSessionCoordinator
#[async_trait]
pub trait DsyncRemote: Send + Sync {
    /// Offer a manifest; the remote accepts with its missing set or rejects.
    async fn push(&self, request: PushRequest) -> Result<NegotiateResponse>;

    /// Send one block of an accepted session. Returns `true` if it was new.
    async fn put_block(&self, session_id: SessionId, id: BlockId, data: Bytes) -> Result<bool>;

    /// Ask the remote to verify and commit. Idempotent.
    async fn complete(&self, session_id: SessionId) -> Result<CompleteReport>;

    /// Fetch the manifest of a version the remote holds.
    async fn pull(&self, request: PullRequest) -> Result<Manifest>;

    /// Fetch one block's bytes.
    async fn get_block(&self, id: BlockId) -> Result<Bytes>;
}
