//! Receiving side of a push.
//!
//! The coordinator decides whether to accept a push, tracks each accepted
//! session until it completes or expires, and commits verified blocks to
//! the content store as one unit.
//!
//! Sessions live in a map under an `RwLock`; each session has its own
//! `Mutex`, so unrelated pushes never wait on each other. The map lock is
//! never acquired while a session lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dsnet_core::{Block, BlockId, CoreError, DatasetId, Manifest};
use dsnet_store::{ContentStore, RefStore};

use crate::error::{DsyncError, Result};
use crate::manifest::{build_manifest, missing_from_store, verify_complete};
use crate::messages::{
    limits, CompleteReport, NegotiateResponse, PullRequest, PushRequest, RejectReason, SessionId,
};
use crate::policy::PolicyConfig;
use crate::remote::DsyncRemote;
use crate::session::SessionState;

/// Snapshot of a server-side session, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub dataset: DatasetId,
    pub username: String,
    pub name: String,
    pub root: BlockId,
    pub state: SessionState,
    pub missing: usize,
    pub received: usize,
}

struct ServerSession {
    id: SessionId,
    dataset: DatasetId,
    username: String,
    name: String,
    manifest: Manifest,
    missing: Vec<BlockId>,
    expected: HashSet<BlockId>,
    staged: HashMap<BlockId, Block>,
    state: SessionState,
    prior_head: Option<BlockId>,
    deadline: Instant,
    report: Option<CompleteReport>,
}

impl ServerSession {
    fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed(reason.into());
        }
        self.staged.clear();
    }

    /// Reject access to a session past its deadline.
    fn check_live(&mut self, now: Instant) -> Result<()> {
        if now < self.deadline {
            return Ok(());
        }
        match self.state {
            SessionState::Completed => Err(DsyncError::UnknownSession(self.id)),
            _ => {
                self.fail("session expired");
                Err(DsyncError::SessionFailed("session expired".into()))
            }
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            dataset: self.dataset,
            username: self.username.clone(),
            name: self.name.clone(),
            root: self.manifest.root,
            state: self.state.clone(),
            missing: self.missing.len(),
            received: self.staged.len(),
        }
    }
}

struct Inner<S: ?Sized> {
    policy: PolicyConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<ServerSession>>>>,
    store: Arc<S>,
}

impl<S: ?Sized> Inner<S> {
    async fn session(&self, id: &SessionId) -> Result<Arc<Mutex<ServerSession>>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(DsyncError::UnknownSession(*id))
    }

    /// Drop the session if its deadline has passed. Returns `true` once the
    /// session is gone.
    async fn reap(&self, id: &SessionId) -> bool {
        let Ok(session) = self.session(id).await else {
            return true;
        };
        {
            let mut session = session.lock().await;
            if Instant::now() < session.deadline {
                return false;
            }
            if !session.state.is_terminal() {
                warn!(
                    session_id = %session.id,
                    dataset = %session.dataset,
                    staged = session.staged.len(),
                    "session expired"
                );
            }
            session.fail("session expired");
        }
        self.sessions.write().await.remove(id);
        debug!(session_id = %id, "session removed");
        true
    }
}

/// Expire one session at its deadline. Deadlines may move (completion
/// extends them), so the task re-reads it after each wake.
async fn expire<S: ?Sized>(inner: Weak<Inner<S>>, id: SessionId) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else { return };
            let Ok(session) = inner.session(&id).await else { return };
            let deadline = session.lock().await.deadline;
            deadline
        };
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = inner.upgrade() else { return };
        if inner.reap(&id).await {
            return;
        }
    }
}

/// Accepts, tracks and commits incoming pushes.
pub struct RemoteSessionCoordinator<S: ?Sized> {
    inner: Arc<Inner<S>>,
}

impl<S: ?Sized> Clone for RemoteSessionCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> RemoteSessionCoordinator<S>
where
    S: ContentStore + RefStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, policy: PolicyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                sessions: RwLock::new(HashMap::new()),
                store,
            }),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.inner.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Negotiate a push: reject under policy or accept with the missing set.
    pub async fn receive(&self, request: PushRequest) -> Result<NegotiateResponse> {
        let policy = &self.inner.policy;
        if let Some(reason) = policy.check(&request) {
            warn!(dataset = %request.dataset, username = %request.username, %reason, "push rejected");
            return Ok(NegotiateResponse::Rejected { reason });
        }

        let manifest = request.manifest;
        if manifest.entries.first().map(|e| e.id) != Some(manifest.root) {
            return Err(DsyncError::InvalidMessage(
                "manifest must start with its root".into(),
            ));
        }
        if manifest.len() > limits::MAX_MANIFEST_ENTRIES {
            return Err(DsyncError::InvalidMessage("too many manifest entries".into()));
        }

        let mut state = SessionState::Created;
        state.transition(SessionState::Negotiating)?;

        let store = &*self.inner.store;
        let missing = missing_from_store(store, &manifest).await?;
        let prior_head = store.get_head(&request.dataset).await?;

        let mut sessions = self.inner.sessions.write().await;
        let mut active = 0;
        for session in sessions.values() {
            if !session.lock().await.state.is_terminal() {
                active += 1;
            }
        }
        if active >= policy.max_sessions {
            let reason = RejectReason::TooManySessions;
            warn!(dataset = %request.dataset, active, %reason, "push rejected");
            return Ok(NegotiateResponse::Rejected { reason });
        }

        let session_id = SessionId::random();
        state.transition(SessionState::Transferring)?;
        info!(
            session_id = %session_id,
            dataset = %request.dataset,
            root = %manifest.root,
            blocks = manifest.len(),
            missing = missing.len(),
            "push accepted"
        );

        let session = ServerSession {
            id: session_id,
            dataset: request.dataset,
            username: request.username,
            name: request.name,
            expected: missing.iter().copied().collect(),
            missing: missing.clone(),
            manifest,
            staged: HashMap::new(),
            state,
            prior_head,
            deadline: Instant::now() + policy.session_timeout(),
            report: None,
        };
        sessions.insert(session_id, Arc::new(Mutex::new(session)));
        drop(sessions);

        tokio::spawn(expire(Arc::downgrade(&self.inner), session_id));

        Ok(NegotiateResponse::Accepted {
            session_id,
            missing,
            prior_head,
        })
    }

    /// Stage one block. Returns `true` if it was new to the session.
    pub async fn put_block(&self, session_id: SessionId, id: BlockId, data: Bytes) -> Result<bool> {
        let session = self.inner.session(&session_id).await?;
        let mut session = session.lock().await;
        session.check_live(Instant::now())?;

        match &session.state {
            SessionState::Transferring => {}
            SessionState::Completed if session.manifest.contains(&id) => return Ok(false),
            SessionState::Completed => return Err(DsyncError::UnexpectedBlock(id)),
            SessionState::Failed(reason) => return Err(DsyncError::SessionFailed(reason.clone())),
            other => {
                return Err(DsyncError::IllegalTransition {
                    from: other.clone(),
                    to: SessionState::Transferring,
                })
            }
        }

        if !session.expected.contains(&id) {
            return Err(DsyncError::UnexpectedBlock(id));
        }
        if session.staged.contains_key(&id) {
            return Ok(false);
        }
        if data.len() > limits::MAX_BLOCK_BYTES {
            return Err(DsyncError::InvalidMessage("block too large".into()));
        }

        let block = match Block::verified(id, data) {
            Ok(block) => block,
            Err(CoreError::BlockHashMismatch { claimed, actual }) => {
                warn!(
                    session_id = %session_id,
                    dataset = %session.dataset,
                    block = %claimed,
                    actual = %actual,
                    "block hash mismatch"
                );
                session.fail(format!("hash mismatch on {}", claimed));
                return Err(DsyncError::HashMismatch { claimed, actual });
            }
            Err(e) => return Err(e.into()),
        };

        session.staged.insert(id, block);
        debug!(
            session_id = %session_id,
            block = %id,
            received = session.staged.len(),
            expected = session.expected.len(),
            "block staged"
        );
        Ok(true)
    }

    /// Verify the received DAG and commit it. Idempotent by session id.
    pub async fn complete(&self, session_id: SessionId) -> Result<CompleteReport> {
        let session = self.inner.session(&session_id).await?;
        let mut session = session.lock().await;
        session.check_live(Instant::now())?;

        match &session.state {
            SessionState::Transferring => {}
            SessionState::Completed => {
                if let Some(report) = &session.report {
                    debug!(session_id = %session_id, "complete replayed");
                    return Ok(report.clone());
                }
            }
            SessionState::Failed(reason) => return Err(DsyncError::SessionFailed(reason.clone())),
            other => {
                return Err(DsyncError::IllegalTransition {
                    from: other.clone(),
                    to: SessionState::Verifying,
                })
            }
        }

        let outstanding = session.expected.len() - session.staged.len();
        if outstanding > 0 {
            return Err(DsyncError::IncompleteTransfer {
                missing: outstanding,
            });
        }

        session.state.transition(SessionState::Verifying)?;
        debug!(session_id = %session_id, "verifying");

        let store = &*self.inner.store;
        if let Err(e) = verify_complete(store, &session.staged, &session.manifest).await {
            warn!(session_id = %session_id, dataset = %session.dataset, error = %e, "verification failed");
            session.fail(e.to_string());
            return Err(e);
        }

        let blocks: Vec<Block> = session.staged.drain().map(|(_, b)| b).collect();
        let committed = match store.put_blocks(&blocks).await {
            Ok(n) => n,
            Err(e) => {
                session.fail(e.to_string());
                return Err(e.into());
            }
        };

        session.state.transition(SessionState::Completed)?;
        let report = CompleteReport {
            session_id,
            dataset: session.dataset,
            username: session.username.clone(),
            name: session.name.clone(),
            root: session.manifest.root,
            blocks_committed: committed,
            prior_head: session.prior_head,
        };
        session.report = Some(report.clone());
        session.deadline = Instant::now() + self.inner.policy.completed_retention();

        info!(
            session_id = %session_id,
            dataset = %session.dataset,
            root = %session.manifest.root,
            committed,
            "push completed"
        );
        Ok(report)
    }

    /// The report of a session that has completed.
    pub async fn completed_report(&self, session_id: SessionId) -> Result<CompleteReport> {
        let session = self.inner.session(&session_id).await?;
        let mut session = session.lock().await;
        session.check_live(Instant::now())?;
        match (&session.state, &session.report) {
            (SessionState::Completed, Some(report)) => Ok(report.clone()),
            (SessionState::Failed(reason), _) => Err(DsyncError::SessionFailed(reason.clone())),
            (state, _) => Err(DsyncError::InvalidMessage(format!(
                "session {} is {:?}, not completed",
                session_id, state
            ))),
        }
    }

    /// Roots of completed sessions still retained.
    pub async fn in_flight_roots(&self) -> Vec<BlockId> {
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let mut roots = Vec::new();
        for session in sessions {
            let session = session.lock().await;
            if session.state == SessionState::Completed {
                roots.push(session.manifest.root);
            }
        }
        roots
    }

    /// Every live session.
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.lock().await.summary());
        }
        out
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}

#[async_trait]
impl<S> DsyncRemote for RemoteSessionCoordinator<S>
where
    S: ContentStore + RefStore + ?Sized + 'static,
{
    async fn push(&self, request: PushRequest) -> Result<NegotiateResponse> {
        self.receive(request).await
    }

    async fn put_block(&self, session_id: SessionId, id: BlockId, data: Bytes) -> Result<bool> {
        RemoteSessionCoordinator::put_block(self, session_id, id, data).await
    }

    async fn complete(&self, session_id: SessionId) -> Result<CompleteReport> {
        RemoteSessionCoordinator::complete(self, session_id).await
    }

    async fn pull(&self, request: PullRequest) -> Result<Manifest> {
        build_manifest(&*self.inner.store, request.root).await
    }

    async fn get_block(&self, id: BlockId) -> Result<Bytes> {
        self.inner
            .store
            .get_block(&id)
            .await?
            .map(|b| b.data().clone())
            .ok_or(DsyncError::BlockNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::session::DsyncSession;
    use dsnet_core::{DatasetVersion, VersionBuilder};
    use dsnet_store::MemoryStore;
    use std::time::Duration;

    fn version(body: &[u8], commit: &str) -> DatasetVersion {
        VersionBuilder::new()
            .structure(b"schema".to_vec())
            .body(body.to_vec())
            .meta(b"meta".to_vec())
            .commit(commit.as_bytes().to_vec())
            .chunk_size(2)
            .build()
    }

    async fn request_for(store: &MemoryStore, v: &DatasetVersion) -> PushRequest {
        store.put_blocks(v.blocks()).await.unwrap();
        PushRequest {
            dataset: DatasetId::from_bytes([7; 32]),
            username: "alice".into(),
            name: "cities".into(),
            manifest: build_manifest(store, v.root()).await.unwrap(),
        }
    }

    fn coordinator(policy: PolicyConfig) -> RemoteSessionCoordinator<MemoryStore> {
        RemoteSessionCoordinator::new(Arc::new(MemoryStore::new()), policy)
    }

    async fn accept(
        coord: &RemoteSessionCoordinator<MemoryStore>,
        request: PushRequest,
    ) -> (SessionId, Vec<BlockId>) {
        match coord.receive(request).await.unwrap() {
            NegotiateResponse::Accepted {
                session_id, missing, ..
            } => (session_id, missing),
            other => panic!("expected accept, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_push_commits_blocks() {
        let local = MemoryStore::new();
        let v = version(b"aabbccdd", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig::default());

        let (sid, missing) = accept(&coord, request).await;
        assert_eq!(missing.len(), v.blocks().len());

        for id in &missing {
            let block = local.get_block(id).await.unwrap().unwrap();
            assert!(coord.put_block(sid, *id, block.data().clone()).await.unwrap());
        }
        let report = coord.complete(sid).await.unwrap();
        assert_eq!(report.blocks_committed, v.blocks().len());
        assert_eq!(report.root, v.root());
        for block in v.blocks() {
            assert!(coord.store().has_block(&block.id()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let local = MemoryStore::new();
        let v = version(b"aabb", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig::default());
        let (sid, missing) = accept(&coord, request).await;
        for id in &missing {
            let block = local.get_block(id).await.unwrap().unwrap();
            coord.put_block(sid, *id, block.data().clone()).await.unwrap();
        }

        let first = coord.complete(sid).await.unwrap();
        let second = coord.complete(sid).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(coord.store().list_blocks().await.unwrap().len(), v.blocks().len());

        // re-sending a block after completion is a no-op
        let block = local.get_block(&missing[0]).await.unwrap().unwrap();
        assert!(!coord.put_block(sid, missing[0], block.data().clone()).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_mismatch_fails_session_and_writes_nothing() {
        let local = MemoryStore::new();
        let v = version(b"aabbcc", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig::default());
        let (sid, missing) = accept(&coord, request).await;

        let good = local.get_block(&missing[0]).await.unwrap().unwrap();
        coord.put_block(sid, missing[0], good.data().clone()).await.unwrap();

        let err = coord
            .put_block(sid, missing[1], Bytes::from_static(b"\x00forged"))
            .await
            .unwrap_err();
        assert!(matches!(err, DsyncError::HashMismatch { claimed, .. } if claimed == missing[1]));

        let err = coord.complete(sid).await.unwrap_err();
        assert!(matches!(err, DsyncError::SessionFailed(_)));
        assert!(coord.store().list_blocks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_transfer_is_not_fatal() {
        let local = MemoryStore::new();
        let v = version(b"aabbcc", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig::default());
        let (sid, missing) = accept(&coord, request).await;

        let err = coord.complete(sid).await.unwrap_err();
        assert!(matches!(err, DsyncError::IncompleteTransfer { missing: n } if n == missing.len()));

        for id in &missing {
            let block = local.get_block(id).await.unwrap().unwrap();
            coord.put_block(sid, *id, block.data().clone()).await.unwrap();
        }
        assert!(coord.complete(sid).await.is_ok());
    }

    #[tokio::test]
    async fn test_unexpected_and_unknown() {
        let local = MemoryStore::new();
        let v = version(b"aabb", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig::default());
        let (sid, _) = accept(&coord, request).await;

        let stray = Block::raw(b"stray");
        let err = coord.put_block(sid, stray.id(), stray.data().clone()).await.unwrap_err();
        assert!(matches!(err, DsyncError::UnexpectedBlock(_)));

        let err = coord.complete(SessionId([9; 16])).await.unwrap_err();
        assert!(matches!(err, DsyncError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_only_missing_blocks_requested() {
        let local = MemoryStore::new();
        let v1 = version(b"aabbcc", "v1");
        let v2 = VersionBuilder::new()
            .structure(b"schema".to_vec())
            .body(b"aabbcc".to_vec())
            .meta(b"meta".to_vec())
            .commit(b"v1".to_vec())
            .chunk_size(2)
            .previous(v1.root())
            .build();

        let coord = coordinator(PolicyConfig::default());
        coord.store().put_blocks(v1.blocks()).await.unwrap();

        let request = request_for(&local, &v2).await;
        let (_, missing) = accept(&coord, request).await;
        assert_eq!(missing, vec![v2.root()]);
    }

    #[tokio::test]
    async fn test_policy_rejections() {
        let local = MemoryStore::new();
        let v = version(b"aabbcc", "v1");
        let request = request_for(&local, &v).await;

        let coord = coordinator(PolicyConfig {
            max_payload_bytes: Some(1),
            ..Default::default()
        });
        let resp = coord.receive(request.clone()).await.unwrap();
        assert!(matches!(
            resp,
            NegotiateResponse::Rejected {
                reason: RejectReason::SizePolicy { .. }
            }
        ));

        let coord = coordinator(PolicyConfig {
            max_sessions: 1,
            ..Default::default()
        });
        accept(&coord, request.clone()).await;
        let resp = coord.receive(request).await.unwrap();
        assert_eq!(
            resp,
            NegotiateResponse::Rejected {
                reason: RejectReason::TooManySessions
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_and_drops_staging() {
        let local = MemoryStore::new();
        let v = version(b"aabbcc", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig {
            session_timeout_ms: 1_000,
            ..Default::default()
        });
        let (sid, missing) = accept(&coord, request).await;
        let block = local.get_block(&missing[0]).await.unwrap().unwrap();
        coord.put_block(sid, missing[0], block.data().clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let err = coord.complete(sid).await.unwrap_err();
        assert!(matches!(
            err,
            DsyncError::UnknownSession(_) | DsyncError::SessionFailed(_)
        ));
        assert!(coord.store().list_blocks().await.unwrap().is_empty());
        assert_eq!(coord.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_session_retained_then_dropped() {
        let local = MemoryStore::new();
        let v = version(b"aabb", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig {
            session_timeout_ms: 1_000,
            completed_retention_ms: 5_000,
            ..Default::default()
        });
        let (sid, missing) = accept(&coord, request).await;
        for id in &missing {
            let block = local.get_block(id).await.unwrap().unwrap();
            coord.put_block(sid, *id, block.data().clone()).await.unwrap();
        }
        coord.complete(sid).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(coord.complete(sid).await.is_ok());
        assert_eq!(coord.in_flight_roots().await, vec![v.root()]);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(matches!(
            coord.complete(sid).await,
            Err(DsyncError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_client_session_push_and_pull() {
        let local = MemoryStore::new();
        let v = version(b"aabbccdd", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig::default());

        let outcome = DsyncSession::push(&local, &coord, "hub", request, RetryPolicy::none())
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.transferred, v.blocks().len());
        assert_eq!(outcome.committed, v.blocks().len());

        let fresh = MemoryStore::new();
        let outcome = DsyncSession::pull(&fresh, &coord, "hub", v.root(), RetryPolicy::none())
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.committed, v.blocks().len());
        assert_eq!(
            build_manifest(&fresh, v.root()).await.unwrap(),
            build_manifest(&local, v.root()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_client_session_fails_on_rejection() {
        let local = MemoryStore::new();
        let v = version(b"aabb", "v1");
        let request = request_for(&local, &v).await;
        let coord = coordinator(PolicyConfig {
            enabled: false,
            ..Default::default()
        });

        let mut session = DsyncSession::push(&local, &coord, "hub", request, RetryPolicy::none());
        let err = session.negotiate().await.unwrap_err();
        assert!(matches!(err, DsyncError::Rejected(RejectReason::Disabled)));
        assert!(matches!(session.state(), SessionState::Failed(_)));
    }
}
