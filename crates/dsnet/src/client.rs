//! Typed calls to one remote over a [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use dsnet_core::{BlockId, Manifest};
use dsnet_dsync::{
    CompleteReport, DsyncError, DsyncRemote, DsyncRequest, DsyncResponse, NegotiateResponse,
    PullRequest, PushRequest, RetryPolicy, SessionId,
};
use dsnet_logbook::{LogbookError, LogsyncRemote, LogsyncRequest, LogsyncResponse};

use crate::messages::{RefRequest, RefResponse, RemoteError, RemoteRequest, RemoteResponse};
use crate::transport::Transport;

/// A named remote reached through a transport.
///
/// Dsync calls are made once; [`DsyncSession`] already retries the ones
/// that are safe to repeat. Logsync and ref calls retry here.
///
/// [`DsyncSession`]: dsnet_dsync::DsyncSession
pub struct RemoteClient<'a> {
    transport: &'a dyn Transport,
    name: String,
    address: String,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl<'a> RemoteClient<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        name: impl Into<String>,
        address: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            name: name.into(),
            address: address.into(),
            retry,
            timeout: None,
        }
    }

    /// Give up on any single call after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// One request, with remote errors lifted out of the response.
    pub async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let kind = request.kind();
        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.call(&self.address, request))
                .await
                .map_err(|_| {
                    debug!(remote = %self.name, kind, ?limit, "request timed out");
                    RemoteError::Timeout(format!("{} request to {} after {:?}", kind, self.name, limit))
                })?,
            None => self.transport.call(&self.address, request).await,
        };
        match reply? {
            RemoteResponse::Error(e) => {
                debug!(remote = %self.name, kind, error = %e, "remote refused request");
                Err(e)
            }
            response => Ok(response),
        }
    }

    /// Like [`call`](Self::call), retrying idempotent requests on transport failure.
    pub async fn call_retrying(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        if !request.is_idempotent() {
            return self.call(request).await;
        }
        let kind = request.kind();
        self.retry.run(kind, || self.call(request.clone())).await
    }

    pub async fn refs(&self, request: RefRequest) -> Result<RefResponse, RemoteError> {
        match self.call_retrying(RemoteRequest::Refs(request)).await? {
            RemoteResponse::Refs(response) => Ok(response),
            other => Err(wrong_kind("refs", other.kind())),
        }
    }

    async fn dsync(&self, request: DsyncRequest) -> Result<DsyncResponse, RemoteError> {
        match self.call(RemoteRequest::Dsync(request)).await? {
            RemoteResponse::Dsync(response) => Ok(response),
            other => Err(wrong_kind("dsync", other.kind())),
        }
    }
}

fn wrong_kind(expected: &str, got: &str) -> RemoteError {
    RemoteError::InvalidRequest(format!("expected {} response, got {}", expected, got))
}

fn dsync_kind(response: &DsyncResponse) -> &'static str {
    match response {
        DsyncResponse::Negotiated(_) => "Negotiated",
        DsyncResponse::BlockAccepted { .. } => "BlockAccepted",
        DsyncResponse::Completed(_) => "Completed",
        DsyncResponse::Manifest(_) => "Manifest",
        DsyncResponse::Block { .. } => "Block",
    }
}

fn unexpected(expected: &str, got: &DsyncResponse) -> DsyncError {
    DsyncError::InvalidMessage(format!("expected {}, got {}", expected, dsync_kind(got)))
}

#[async_trait]
impl DsyncRemote for RemoteClient<'_> {
    async fn push(&self, request: PushRequest) -> dsnet_dsync::Result<NegotiateResponse> {
        match self.dsync(DsyncRequest::Push(request)).await? {
            DsyncResponse::Negotiated(response) => Ok(response),
            other => Err(unexpected("Negotiated", &other)),
        }
    }

    async fn put_block(&self, session_id: SessionId, id: BlockId, data: Bytes) -> dsnet_dsync::Result<bool> {
        match self
            .dsync(DsyncRequest::PutBlock { session_id, id, data })
            .await?
        {
            DsyncResponse::BlockAccepted { fresh } => Ok(fresh),
            other => Err(unexpected("BlockAccepted", &other)),
        }
    }

    async fn complete(&self, session_id: SessionId) -> dsnet_dsync::Result<CompleteReport> {
        match self.dsync(DsyncRequest::Complete { session_id }).await? {
            DsyncResponse::Completed(report) => Ok(report),
            other => Err(unexpected("Completed", &other)),
        }
    }

    async fn pull(&self, request: PullRequest) -> dsnet_dsync::Result<Manifest> {
        match self.dsync(DsyncRequest::Pull(request)).await? {
            DsyncResponse::Manifest(manifest) => Ok(manifest),
            other => Err(unexpected("Manifest", &other)),
        }
    }

    async fn get_block(&self, id: BlockId) -> dsnet_dsync::Result<Bytes> {
        match self.dsync(DsyncRequest::GetBlock { id }).await? {
            DsyncResponse::Block { id: sent, data } if sent == id => Ok(data),
            DsyncResponse::Block { id: sent, .. } => Err(DsyncError::InvalidMessage(format!(
                "asked for block {}, got {}",
                id, sent
            ))),
            other => Err(unexpected("Block", &other)),
        }
    }
}

#[async_trait]
impl LogsyncRemote for RemoteClient<'_> {
    async fn logsync(&self, request: LogsyncRequest) -> dsnet_logbook::Result<LogsyncResponse> {
        match self.call_retrying(RemoteRequest::Logsync(request)).await? {
            RemoteResponse::Logsync(response) => Ok(response),
            other => Err(LogbookError::InvalidMessage(format!(
                "expected logsync response, got {}",
                other.kind()
            ))),
        }
    }
}
