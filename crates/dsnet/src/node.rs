//! The Node: one peer's store, logbook and sync endpoints.
//!
//! A node authors dataset history locally, pushes and pulls versions to
//! and from named remotes, and answers the same requests from other nodes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use dsnet_core::{
    BlockId, DagInfo, DatasetId, DatasetVersion, EntryBuilder, Keypair, LogEntry, Manifest,
    ManifestEntry, OpPayload, PublicKey, Ref,
};
use dsnet_dsync::{
    build_manifest, dag_info, DsyncError, DsyncRequest, DsyncResponse, DsyncSession,
    NegotiateResponse, PushRequest, RejectReason, RemoteSessionCoordinator, SessionId,
    SessionSummary,
};
use dsnet_logbook::{
    logsync, Lineage, Logbook, LogbookError, LogsyncReport, LogsyncRequest, RefResolver,
    ResolvedRef,
};
use dsnet_store::{now_millis, Store};

use crate::client::RemoteClient;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::gc::{self, GcReport};
use crate::messages::{RefRequest, RefResponse, RemoteRequest, RemoteResponse};
use crate::transport::{RemoteHandler, Transport};

/// What a finished push did.
#[derive(Debug, Clone)]
pub struct PushReport {
    pub dataset: DatasetId,
    pub root: BlockId,
    pub session_id: SessionId,
    /// Blocks sent over the wire.
    pub transferred: usize,
    /// Blocks the remote newly stored.
    pub committed: usize,
    /// The remote's head before this push.
    pub prior_head: Option<BlockId>,
    pub logsync: LogsyncReport,
}

/// What a finished pull did.
#[derive(Debug, Clone)]
pub struct PullReport {
    pub dataset: DatasetId,
    pub root: BlockId,
    /// Blocks fetched over the wire.
    pub transferred: usize,
    /// Blocks newly stored locally.
    pub committed: usize,
    pub logsync: LogsyncReport,
}

/// Counts describing a node's local state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub blocks: usize,
    pub datasets: usize,
    pub heads: usize,
    pub sessions: usize,
    pub dangling_entries: usize,
}

/// A dsnet peer.
///
/// Provides a unified API for:
/// - Creating datasets and committing versions
/// - Inspecting manifests and DAGs
/// - Pushing to and pulling from remotes
/// - Answering remote requests
/// - Collecting unreachable blocks
pub struct Node<S: ?Sized> {
    /// The identity that signs this node's log entries.
    keypair: Keypair,
    store: Arc<S>,
    logbook: Arc<Logbook<S>>,
    resolver: RefResolver<S>,
    coordinator: RemoteSessionCoordinator<S>,
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    /// Block writers hold it shared; a gc run holds it exclusively, so no
    /// block lands between marking and sweeping.
    sweep: RwLock<()>,
}

impl<S: Store + ?Sized + 'static> Node<S> {
    /// Open a node over `store`, rebuilding the log index from it.
    pub async fn open(
        keypair: Keypair,
        store: Arc<S>,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let logbook = Arc::new(Logbook::open(Arc::clone(&store)).await?);
        let resolver = RefResolver::new(Arc::clone(&logbook));
        let coordinator = RemoteSessionCoordinator::new(Arc::clone(&store), config.policy.clone());
        debug!(username = %config.username, author = %keypair.public_key(), "node opened");
        Ok(Self {
            keypair,
            store,
            logbook,
            resolver,
            coordinator,
            transport,
            config,
            sweep: RwLock::new(()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn logbook(&self) -> &Arc<Logbook<S>> {
        &self.logbook
    }

    pub fn resolver(&self) -> &RefResolver<S> {
        &self.resolver
    }

    pub fn coordinator(&self) -> &RemoteSessionCoordinator<S> {
        &self.coordinator
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Authoring
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a new lineage called `username/name`.
    pub async fn init_dataset(&self, name: &str) -> Result<DatasetId> {
        let username = self.config.username.clone();
        if let Some(existing) = self.logbook.find(&username, name).await {
            return Err(NodeError::DatasetExists(Ref::new(existing.username, existing.name).alias()));
        }

        let entry = EntryBuilder::init(username, name)
            .timestamp(now_millis())
            .sign(&self.keypair);
        let dataset = entry.dataset();
        self.logbook.append(entry).await?;
        info!(dataset = %dataset, name, "dataset created");
        Ok(dataset)
    }

    /// Store a version's blocks, log the commit, and move the head to it.
    pub async fn commit_version(
        &self,
        dataset: &DatasetId,
        version: &DatasetVersion,
        message: &str,
    ) -> Result<BlockId> {
        let _writing = self.sweep.read().await;
        let lineage = self.live_lineage(dataset).await?;
        let root = version.root();

        let written = self.store.put_blocks(version.blocks()).await?;
        let entry = EntryBuilder::commit(*dataset, lineage.latest, root, message)
            .timestamp(now_millis())
            .sign(&self.keypair);
        self.logbook.append(entry).await?;

        let head = self.resolver.recorded_head(dataset).await?;
        if head != Some(root) {
            self.resolver.update_head(dataset, head, Some(root)).await?;
        }
        info!(dataset = %dataset, root = %root, written, "version committed");
        Ok(root)
    }

    /// Log a rename. The old name stops resolving.
    pub async fn rename_dataset(&self, dataset: &DatasetId, name: &str) -> Result<()> {
        let lineage = self.live_lineage(dataset).await?;
        if let Some(existing) = self.logbook.find(&lineage.username, name).await {
            if existing.dataset != *dataset {
                return Err(NodeError::DatasetExists(Ref::new(existing.username, existing.name).alias()));
            }
        }

        let entry = EntryBuilder::rename(*dataset, lineage.latest, name)
            .timestamp(now_millis())
            .sign(&self.keypair);
        self.logbook.append(entry).await?;
        info!(dataset = %dataset, from = %lineage.name, to = name, "dataset renamed");
        Ok(())
    }

    /// Log a delete and clear the head.
    pub async fn delete_dataset(&self, dataset: &DatasetId) -> Result<()> {
        let lineage = self.live_lineage(dataset).await?;
        let entry = EntryBuilder::delete(*dataset, lineage.latest)
            .timestamp(now_millis())
            .sign(&self.keypair);
        self.logbook.append(entry).await?;

        let head = self.resolver.recorded_head(dataset).await?;
        if head.is_some() {
            self.resolver.update_head(dataset, head, None).await?;
        }
        info!(dataset = %dataset, "dataset deleted");
        Ok(())
    }

    async fn live_lineage(&self, dataset: &DatasetId) -> Result<Lineage> {
        let lineage = self
            .logbook
            .lineage(dataset)
            .await
            .ok_or(LogbookError::UnknownDataset(*dataset))?;
        if lineage.deleted {
            return Err(LogbookError::Deleted(*dataset).into());
        }
        Ok(lineage)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve a ref against the local logbook and head table.
    pub async fn resolve(&self, reference: &Ref) -> Result<ResolvedRef> {
        Ok(self.resolver.resolve(reference).await?)
    }

    /// Every live local ref.
    pub async fn list(&self) -> Result<Vec<ResolvedRef>> {
        Ok(self.resolver.list().await?)
    }

    /// The manifest of the version a ref resolves to.
    pub async fn manifest(&self, reference: &Ref) -> Result<Manifest> {
        let resolved = self.resolver.resolve(reference).await?;
        Ok(build_manifest(&*self.store, resolved.path).await?)
    }

    /// The rows of `manifest` this node doesn't hold, in manifest order.
    pub async fn missing_manifest(&self, manifest: &Manifest) -> Result<Vec<ManifestEntry>> {
        let mut missing = Vec::new();
        for entry in &manifest.entries {
            if !self.store.has_block(&entry.id).await? {
                missing.push(*entry);
            }
        }
        Ok(missing)
    }

    /// Manifest, component labels and total size of the version a ref
    /// resolves to.
    pub async fn dag_info(&self, reference: &Ref) -> Result<DagInfo> {
        let resolved = self.resolver.resolve(reference).await?;
        Ok(dag_info(&*self.store, resolved.path).await?)
    }

    /// Receiving sessions currently held for pushers.
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        self.coordinator.sessions().await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus {
            blocks: self.store.list_blocks().await?.len(),
            datasets: self.logbook.lineages().await.len(),
            heads: self.store.list_heads().await?.len(),
            sessions: self.coordinator.session_count().await,
            dangling_entries: self.logbook.dangling().await.len(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Push / Pull
    // ─────────────────────────────────────────────────────────────────────────

    fn client(&self, remote: &str) -> Result<RemoteClient<'_>> {
        let config = self
            .config
            .remotes
            .get(remote)
            .ok_or_else(|| NodeError::UnknownRemote(remote.to_string()))?;
        Ok(RemoteClient::new(
            &*self.transport,
            remote,
            config.address.clone(),
            self.config.sync.retry.clone(),
        )
        .with_timeout(self.config.sync.request_timeout()))
    }

    /// Send the version a ref resolves to, then its history, then move the
    /// remote's head.
    ///
    /// The remote receives only the blocks it lacks. The whole exchange is
    /// bounded by the sync timeout.
    pub async fn push(&self, remote: &str, reference: &Ref) -> Result<PushReport> {
        let client = self.client(remote)?;
        let limit = self.config.sync.sync_timeout();
        tokio::time::timeout(limit, self.push_to(&client, reference))
            .await
            .map_err(|_| NodeError::Timeout(format!("push of {} to {} after {:?}", reference, remote, limit)))?
    }

    async fn push_to(&self, client: &RemoteClient<'_>, reference: &Ref) -> Result<PushReport> {
        let resolved = self.resolver.resolve(reference).await?;
        let manifest = build_manifest(&*self.store, resolved.path).await?;
        let request = PushRequest {
            dataset: resolved.dataset,
            username: resolved.username.clone(),
            name: resolved.name.clone(),
            manifest,
        };

        let outcome = DsyncSession::push(
            &*self.store,
            client,
            client.name(),
            request,
            self.config.sync.retry.clone(),
        )
        .run()
        .await?;
        let session_id = outcome
            .session_id
            .ok_or_else(|| DsyncError::InvalidMessage("push finished without a session id".into()))?;

        let logsync = logsync::sync(&*self.logbook, client, resolved.dataset).await?;

        let head = match client.refs(RefRequest::Finalize { session_id }).await? {
            RefResponse::Finalized { head, .. } => head,
            other => return Err(unexpected_ref("Finalized", &other)),
        };

        info!(
            remote = client.name(),
            session_id = %session_id,
            dataset = %resolved.dataset,
            head = %head,
            transferred = outcome.transferred,
            "push finished"
        );
        Ok(PushReport {
            dataset: resolved.dataset,
            root: outcome.root,
            session_id,
            transferred: outcome.transferred,
            committed: outcome.committed,
            prior_head: outcome.prior_head,
            logsync,
        })
    }

    /// Fetch the version a ref resolves to on `remote`, then its history,
    /// then move the local head.
    ///
    /// The head moves from the value it had when the pull started, so a
    /// local commit made meanwhile surfaces as a head conflict.
    pub async fn pull(&self, remote: &str, reference: &Ref) -> Result<PullReport> {
        let client = self.client(remote)?;
        let limit = self.config.sync.sync_timeout();
        tokio::time::timeout(limit, self.pull_from(&client, reference))
            .await
            .map_err(|_| NodeError::Timeout(format!("pull of {} from {} after {:?}", reference, remote, limit)))?
    }

    async fn pull_from(&self, client: &RemoteClient<'_>, reference: &Ref) -> Result<PullReport> {
        let _writing = self.sweep.read().await;
        let resolved = self.resolve_remote(client, reference).await?;
        let head = self.resolver.recorded_head(&resolved.dataset).await?;

        let outcome = DsyncSession::pull(
            &*self.store,
            client,
            client.name(),
            resolved.path,
            self.config.sync.retry.clone(),
        )
        .run()
        .await?;

        let logsync = logsync::fetch(&*self.logbook, client, resolved.dataset).await?;
        if !self.logbook.has_commit(&resolved.dataset, &resolved.path).await {
            return Err(NodeError::NotCommitted {
                dataset: resolved.dataset,
                path: resolved.path,
            });
        }

        if head != Some(resolved.path) {
            self.resolver
                .update_head(&resolved.dataset, head, Some(resolved.path))
                .await?;
        }

        info!(
            remote = client.name(),
            dataset = %resolved.dataset,
            head = %resolved.path,
            transferred = outcome.transferred,
            "pull finished"
        );
        Ok(PullReport {
            dataset: resolved.dataset,
            root: resolved.path,
            transferred: outcome.transferred,
            committed: outcome.committed,
            logsync,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remote Refs
    // ─────────────────────────────────────────────────────────────────────────

    /// What a ref resolves to on `remote`. Moves no blocks.
    pub async fn remote_status(&self, remote: &str, reference: &Ref) -> Result<ResolvedRef> {
        let client = self.client(remote)?;
        self.resolve_remote(&client, reference).await
    }

    /// Every live ref on `remote`.
    pub async fn remote_list(&self, remote: &str) -> Result<Vec<ResolvedRef>> {
        let client = self.client(remote)?;
        match client.refs(RefRequest::List).await? {
            RefResponse::Listed(refs) => Ok(refs),
            other => Err(unexpected_ref("Listed", &other)),
        }
    }

    /// Clear a ref's head on `remote`. Returns the head it had.
    pub async fn remove_from_remote(&self, remote: &str, reference: &Ref) -> Result<Option<BlockId>> {
        let client = self.client(remote)?;
        match client
            .refs(RefRequest::Remove {
                reference: reference.clone(),
            })
            .await?
        {
            RefResponse::Removed { dataset, previous } => {
                info!(remote, dataset = %dataset, ?previous, "removed from remote");
                Ok(previous)
            }
            other => Err(unexpected_ref("Removed", &other)),
        }
    }

    async fn resolve_remote(&self, client: &RemoteClient<'_>, reference: &Ref) -> Result<ResolvedRef> {
        match client.refs(RefRequest::Resolve(reference.clone())).await? {
            RefResponse::Resolved(resolved) => Ok(resolved),
            other => Err(unexpected_ref("Resolved", &other)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serving
    // ─────────────────────────────────────────────────────────────────────────

    /// Answer one request from another node.
    pub async fn handle_request(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        match request {
            RemoteRequest::Dsync(request) => Ok(RemoteResponse::Dsync(self.handle_dsync(request).await?)),
            RemoteRequest::Logsync(request) => {
                if let LogsyncRequest::Push { dataset, entries } = &request {
                    self.admit_history(dataset, entries).await?;
                }
                Ok(RemoteResponse::Logsync(
                    logsync::handle(&*self.logbook, request).await?,
                ))
            }
            RemoteRequest::Refs(request) => Ok(RemoteResponse::Refs(self.handle_refs(request).await?)),
        }
    }

    async fn handle_dsync(&self, request: DsyncRequest) -> Result<DsyncResponse> {
        request
            .validate_limits()
            .map_err(|e| DsyncError::InvalidMessage(e.to_string()))?;

        let response = match request {
            DsyncRequest::Push(request) => match self.check_claim(&request).await {
                Some(reason) => DsyncResponse::Negotiated(NegotiateResponse::Rejected { reason }),
                None => DsyncResponse::Negotiated(self.coordinator.receive(request).await?),
            },
            DsyncRequest::PutBlock { session_id, id, data } => DsyncResponse::BlockAccepted {
                fresh: self.coordinator.put_block(session_id, id, data).await?,
            },
            DsyncRequest::Complete { session_id } => {
                let _writing = self.sweep.read().await;
                DsyncResponse::Completed(self.coordinator.complete(session_id).await?)
            }
            DsyncRequest::Pull(request) => {
                DsyncResponse::Manifest(build_manifest(&*self.store, request.root).await?)
            }
            DsyncRequest::GetBlock { id } => {
                let block = self
                    .store
                    .get_block(&id)
                    .await?
                    .ok_or(DsyncError::BlockNotFound(id))?;
                DsyncResponse::Block {
                    id,
                    data: block.data().clone(),
                }
            }
        };
        Ok(response)
    }

    /// A push for a lineage this node already knows must come under its
    /// owner, and that lineage must pass the policy. The name may be ahead
    /// of ours until the rename arrives; finalize checks it.
    async fn check_claim(&self, request: &PushRequest) -> Option<RejectReason> {
        let lineage = self.logbook.lineage(&request.dataset).await?;
        if lineage.username != request.username {
            warn!(
                dataset = %request.dataset,
                claimed = %Ref::new(request.username.clone(), request.name.clone()).alias(),
                actual = %Ref::new(lineage.username, lineage.name).alias(),
                "push claims another owner"
            );
            return Some(RejectReason::NotAllowed);
        }
        self.coordinator
            .policy()
            .check_owner(&lineage.username, &lineage.name)
    }

    /// Refuse pushed history for a lineage this node wouldn't accept a
    /// push of.
    ///
    /// Owner and name come from the log: the lineage as already known, or
    /// the `Init` entry in the batch. Names the batch renames to must pass
    /// as well.
    async fn admit_history(&self, dataset: &DatasetId, entries: &[LogEntry]) -> Result<()> {
        let policy = self.coordinator.policy();
        if !policy.enabled {
            warn!(dataset = %dataset, "pushed history refused, pushes disabled");
            return Err(NodeError::Rejected(RejectReason::Disabled));
        }
        if policy.always_accept || policy.allow_list.is_none() {
            return Ok(());
        }

        let mut owner = self
            .logbook
            .lineage(dataset)
            .await
            .map(|lineage| (lineage.username, lineage.name));
        let mut names = Vec::new();
        for entry in entries.iter().filter(|e| e.dataset() == *dataset) {
            match entry.decode_payload() {
                Ok(OpPayload::Init { username, name }) if owner.is_none() => owner = Some((username, name)),
                Ok(OpPayload::Rename { name }) => names.push(name),
                _ => {}
            }
        }

        let Some((username, name)) = owner else {
            warn!(dataset = %dataset, "pushed history for an unknown lineage refused");
            return Err(NodeError::Rejected(RejectReason::NotAllowed));
        };
        names.push(name);
        for name in &names {
            if let Some(reason) = policy.check_owner(&username, name) {
                warn!(dataset = %dataset, username = %username, name = %name, %reason, "pushed history refused");
                return Err(NodeError::Rejected(reason));
            }
        }
        Ok(())
    }

    async fn handle_refs(&self, request: RefRequest) -> Result<RefResponse> {
        match request {
            RefRequest::Resolve(reference) => Ok(RefResponse::Resolved(self.resolver.resolve(&reference).await?)),
            RefRequest::List => Ok(RefResponse::Listed(self.resolver.list().await?)),
            RefRequest::Finalize { session_id } => self.finalize(session_id).await,
            RefRequest::Remove { reference } => self.remove(&reference).await,
        }
    }

    /// Move a dataset's head to a completed session's root.
    ///
    /// The logbook must already hold the commit, under the owner and name
    /// the pusher gave. The swap expects the head the session saw when it
    /// opened, so a concurrent push that finalized first surfaces as a head
    /// conflict. Finalizing twice is a no-op.
    async fn finalize(&self, session_id: SessionId) -> Result<RefResponse> {
        let report = self.coordinator.completed_report(session_id).await?;
        let not_committed = || NodeError::NotCommitted {
            dataset: report.dataset,
            path: report.root,
        };
        if !self.logbook.has_commit(&report.dataset, &report.root).await {
            return Err(not_committed());
        }
        let lineage = self.logbook.lineage(&report.dataset).await.ok_or_else(not_committed)?;
        if lineage.username != report.username || lineage.name != report.name {
            warn!(
                session_id = %session_id,
                dataset = %report.dataset,
                claimed = %Ref::new(report.username.clone(), report.name.clone()).alias(),
                actual = %Ref::new(lineage.username, lineage.name).alias(),
                "finalize refused, push named another lineage"
            );
            return Err(NodeError::Rejected(RejectReason::NotAllowed));
        }
        if let Some(reason) = self
            .coordinator
            .policy()
            .check_owner(&lineage.username, &lineage.name)
        {
            warn!(session_id = %session_id, dataset = %report.dataset, %reason, "finalize refused");
            return Err(NodeError::Rejected(reason));
        }

        let head = self.resolver.recorded_head(&report.dataset).await?;
        if head != Some(report.root) {
            self.resolver
                .update_head(&report.dataset, report.prior_head, Some(report.root))
                .await?;
            info!(session_id = %session_id, dataset = %report.dataset, head = %report.root, "head finalized");
        }
        Ok(RefResponse::Finalized {
            dataset: report.dataset,
            head: report.root,
        })
    }

    async fn remove(&self, reference: &Ref) -> Result<RefResponse> {
        let lineage = self.resolver.lineage(reference).await?;
        if let Some(reason) = self
            .coordinator
            .policy()
            .check_remove(&lineage.username, &lineage.name)
        {
            warn!(dataset = %lineage.dataset, reason = %reason, "remove rejected");
            return Err(NodeError::Rejected(reason));
        }

        let previous = self.resolver.recorded_head(&lineage.dataset).await?;
        if previous.is_some() {
            self.resolver.update_head(&lineage.dataset, previous, None).await?;
        }
        info!(dataset = %lineage.dataset, ?previous, "head removed");
        Ok(RefResponse::Removed {
            dataset: lineage.dataset,
            previous,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Garbage Collection
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete every block no head, commit or completed session reaches.
    pub async fn gc(&self) -> Result<GcReport> {
        let _sweeping = self.sweep.write().await;
        let mut roots: Vec<BlockId> = self
            .store
            .list_heads()
            .await?
            .into_iter()
            .map(|(_, head)| head)
            .collect();
        if self.config.gc.keep_history {
            roots.extend(self.logbook.commit_paths().await);
        }
        roots.extend(self.coordinator.in_flight_roots().await);

        gc::collect(&*self.store, roots, self.config.sync.batch_size, self.config.gc.dry_run).await
    }
}

fn unexpected_ref(expected: &'static str, got: &RefResponse) -> NodeError {
    let got = match got {
        RefResponse::Resolved(_) => "Resolved",
        RefResponse::Listed(_) => "Listed",
        RefResponse::Finalized { .. } => "Finalized",
        RefResponse::Removed { .. } => "Removed",
    };
    NodeError::UnexpectedResponse { expected, got }
}

#[async_trait]
impl<S: Store + ?Sized + 'static> RemoteHandler for Node<S> {
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        let kind = request.kind();
        match self.handle_request(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(kind, error = %e, "request failed");
                RemoteResponse::Error(e.into())
            }
        }
    }
}
