//! Dsync session state machine.
//!
//! ```text
//! Created -> Negotiating -> Transferring -> Verifying -> Completed
//!     \            \              \              \
//!      +------------+--------------+--------------+--> Failed
//! ```
//!
//! The same [`SessionState`] backs client sessions here and the
//! coordinator's server-side records.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use dsnet_core::{Block, BlockId, Manifest};
use dsnet_store::ContentStore;

use crate::error::{DsyncError, Result};
use crate::manifest::{missing_from_store, verify_complete};
use crate::messages::{Direction, NegotiateResponse, PullRequest, PushRequest, SessionId};
use crate::remote::DsyncRemote;
use crate::retry::RetryPolicy;

/// Lifecycle of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Negotiating,
    Transferring,
    Verifying,
    Completed,
    /// Terminal failure with its reason.
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition(&self, to: &SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Created, Negotiating)
            | (Negotiating, Transferring)
            | (Transferring, Verifying)
            | (Verifying, Completed) => true,
            (from, Failed(_)) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Move to `to`, rejecting illegal edges.
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.can_transition(&to) {
            return Err(DsyncError::IllegalTransition {
                from: self.clone(),
                to,
            });
        }
        *self = to;
        Ok(())
    }
}

/// What a finished client session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub direction: Direction,
    /// Server session id (pushes only).
    pub session_id: Option<SessionId>,
    pub root: BlockId,
    /// Blocks moved over the wire.
    pub transferred: usize,
    /// Blocks newly written to the receiving store.
    pub committed: usize,
    /// The remote's head when a push session opened.
    pub prior_head: Option<BlockId>,
}

/// Client side of one push or pull.
///
/// Owns its missing and received sets for its lifetime. Pulled blocks are
/// staged in memory and reach the store only after verification, so
/// dropping a session mid-transfer writes nothing.
pub struct DsyncSession<'a, S: ?Sized, R: ?Sized> {
    store: &'a S,
    remote: &'a R,
    remote_name: String,
    direction: Direction,
    root: BlockId,
    push: Option<PushRequest>,
    manifest: Option<Manifest>,
    session_id: Option<SessionId>,
    missing: Vec<BlockId>,
    received: HashSet<BlockId>,
    staged: HashMap<BlockId, Block>,
    prior_head: Option<BlockId>,
    committed: usize,
    state: SessionState,
    retry: RetryPolicy,
}

impl<'a, S, R> DsyncSession<'a, S, R>
where
    S: ContentStore + ?Sized,
    R: DsyncRemote + ?Sized,
{
    /// A session sending `request.manifest` to `remote`.
    pub fn push(
        store: &'a S,
        remote: &'a R,
        remote_name: impl Into<String>,
        request: PushRequest,
        retry: RetryPolicy,
    ) -> Self {
        let root = request.manifest.root;
        let manifest = Some(request.manifest.clone());
        Self::new(store, remote, remote_name.into(), Direction::Push, root, Some(request), manifest, retry)
    }

    /// A session fetching the version at `root` from `remote`.
    pub fn pull(
        store: &'a S,
        remote: &'a R,
        remote_name: impl Into<String>,
        root: BlockId,
        retry: RetryPolicy,
    ) -> Self {
        Self::new(store, remote, remote_name.into(), Direction::Pull, root, None, None, retry)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        store: &'a S,
        remote: &'a R,
        remote_name: String,
        direction: Direction,
        root: BlockId,
        push: Option<PushRequest>,
        manifest: Option<Manifest>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            remote,
            remote_name,
            direction,
            root,
            push,
            manifest,
            session_id: None,
            missing: Vec::new(),
            received: HashSet::new(),
            staged: HashMap::new(),
            prior_head: None,
            committed: 0,
            state: SessionState::Created,
            retry,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Blocks the receiving side lacks, in manifest order.
    pub fn missing(&self) -> &[BlockId] {
        &self.missing
    }

    pub fn received(&self) -> &HashSet<BlockId> {
        &self.received
    }

    pub fn prior_head(&self) -> Option<BlockId> {
        self.prior_head
    }

    fn advance(&mut self, to: SessionState) -> Result<()> {
        debug!(
            remote = %self.remote_name,
            root = %self.root,
            from = ?self.state,
            to = ?to,
            "session transition"
        );
        self.state.transition(to)
    }

    /// Mark the session failed and hand back the error.
    fn fail(&mut self, err: DsyncError) -> DsyncError {
        if !self.state.is_terminal() {
            warn!(remote = %self.remote_name, root = %self.root, error = %err, "session failed");
            self.state = SessionState::Failed(err.to_string());
        }
        self.staged.clear();
        err
    }

    /// Negotiate the missing set.
    pub async fn negotiate(&mut self) -> Result<()> {
        self.advance(SessionState::Negotiating)?;
        match self.negotiate_inner().await {
            Ok(()) => self.advance(SessionState::Transferring),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn negotiate_inner(&mut self) -> Result<()> {
        match self.direction {
            Direction::Push => {
                let request = self
                    .push
                    .clone()
                    .ok_or_else(|| DsyncError::InvalidMessage("push session without request".into()))?;
                let manifest = request.manifest.clone();

                match self.remote.push(request).await? {
                    NegotiateResponse::Rejected { reason } => {
                        warn!(remote = %self.remote_name, %reason, "push rejected");
                        Err(DsyncError::Rejected(reason))
                    }
                    NegotiateResponse::Accepted {
                        session_id,
                        missing,
                        prior_head,
                    } => {
                        if let Some(stray) = missing.iter().find(|id| !manifest.contains(id)) {
                            return Err(DsyncError::InvalidMessage(format!(
                                "remote requested block {} outside the manifest",
                                stray
                            )));
                        }
                        debug!(%session_id, missing = missing.len(), "push accepted");
                        self.session_id = Some(session_id);
                        self.missing = missing;
                        self.prior_head = prior_head;
                        Ok(())
                    }
                }
            }
            Direction::Pull => {
                let remote = self.remote;
                let root = self.root;
                let manifest = self
                    .retry
                    .run("pull manifest", move || remote.pull(PullRequest { root }))
                    .await?;
                if manifest.root != root || manifest.entries.first().map(|e| e.id) != Some(root) {
                    return Err(DsyncError::InvalidMessage(
                        "manifest does not start at the requested root".into(),
                    ));
                }
                self.missing = missing_from_store(self.store, &manifest).await?;
                debug!(root = %root, missing = self.missing.len(), "pull negotiated");
                self.manifest = Some(manifest);
                Ok(())
            }
        }
    }

    /// Move every missing block. Returns the number transferred.
    pub async fn transfer(&mut self) -> Result<usize> {
        if self.state != SessionState::Transferring {
            return Err(DsyncError::IllegalTransition {
                from: self.state.clone(),
                to: SessionState::Transferring,
            });
        }
        match self.transfer_inner().await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn transfer_inner(&mut self) -> Result<usize> {
        let remote = self.remote;
        let mut transferred = 0;

        for id in self.missing.clone() {
            if self.received.contains(&id) {
                continue;
            }
            match self.direction {
                Direction::Push => {
                    let session_id = self
                        .session_id
                        .ok_or_else(|| DsyncError::InvalidMessage("no session id".into()))?;
                    let block = self
                        .store
                        .get_block(&id)
                        .await?
                        .ok_or(DsyncError::BlockNotFound(id))?;
                    let data = block.data().clone();
                    self.retry
                        .run("put block", || remote.put_block(session_id, id, data.clone()))
                        .await?;
                }
                Direction::Pull => {
                    let data = self
                        .retry
                        .run("get block", move || remote.get_block(id))
                        .await?;
                    let block = Block::verified(id, data).map_err(|e| match e {
                        dsnet_core::CoreError::BlockHashMismatch { claimed, actual } => {
                            warn!(block = %claimed, actual = %actual, "pulled block hash mismatch");
                            DsyncError::HashMismatch { claimed, actual }
                        }
                        other => DsyncError::Core(other),
                    })?;
                    self.staged.insert(id, block);
                }
            }
            self.received.insert(id);
            transferred += 1;
        }

        Ok(transferred)
    }

    /// Verify and commit. For pushes the remote does this; for pulls it
    /// happens locally.
    pub async fn complete(&mut self) -> Result<SessionOutcome> {
        self.advance(SessionState::Verifying)?;
        match self.complete_inner().await {
            Ok(()) => {
                self.advance(SessionState::Completed)?;
                Ok(SessionOutcome {
                    direction: self.direction,
                    session_id: self.session_id,
                    root: self.root,
                    transferred: self.received.len(),
                    committed: self.committed,
                    prior_head: self.prior_head,
                })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn complete_inner(&mut self) -> Result<()> {
        let outstanding = self
            .missing
            .iter()
            .filter(|id| !self.received.contains(id))
            .count();
        if outstanding > 0 {
            return Err(DsyncError::IncompleteTransfer {
                missing: outstanding,
            });
        }

        match self.direction {
            Direction::Push => {
                let remote = self.remote;
                let session_id = self
                    .session_id
                    .ok_or_else(|| DsyncError::InvalidMessage("no session id".into()))?;
                let report = self
                    .retry
                    .run("complete", move || remote.complete(session_id))
                    .await?;
                self.committed = report.blocks_committed;
                self.prior_head = report.prior_head;
            }
            Direction::Pull => {
                let manifest = self
                    .manifest
                    .as_ref()
                    .ok_or_else(|| DsyncError::InvalidMessage("pull without manifest".into()))?;
                verify_complete(self.store, &self.staged, manifest).await?;
                let blocks: Vec<Block> = self.staged.drain().map(|(_, b)| b).collect();
                self.committed = self.store.put_blocks(&blocks).await?;
            }
        }
        Ok(())
    }

    /// Negotiate, transfer and complete.
    pub async fn run(mut self) -> Result<SessionOutcome> {
        self.negotiate().await?;
        self.transfer().await?;
        self.complete().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = SessionState::Created;
        for next in [
            SessionState::Negotiating,
            SessionState::Transferring,
            SessionState::Verifying,
            SessionState::Completed,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for state in [
            SessionState::Created,
            SessionState::Negotiating,
            SessionState::Transferring,
            SessionState::Verifying,
        ] {
            let mut s = state.clone();
            s.transition(SessionState::Failed("boom".into())).unwrap();
        }
    }

    #[test]
    fn test_illegal_transitions() {
        let mut s = SessionState::Created;
        assert!(matches!(
            s.transition(SessionState::Transferring),
            Err(DsyncError::IllegalTransition { .. })
        ));

        let mut done = SessionState::Completed;
        assert!(done.transition(SessionState::Failed("late".into())).is_err());

        let mut failed = SessionState::Failed("x".into());
        assert!(failed.transition(SessionState::Negotiating).is_err());
        assert_eq!(failed, SessionState::Failed("x".into()));
    }
}
