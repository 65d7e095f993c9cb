//! Logsync: exchanging log entries for one lineage.
//!
//! ```text
//! Local                                Peer
//!   |-------- Pull{since} ------------->|
//!   |<------- Entries ------------------|   merged locally
//!   |-------- Heads ------------------->|
//!   |<------- Heads{cursor} ------------|
//!   |-------- Push{entries} ----------->|
//!   |<------- Merged -------------------|
//! ```
//!
//! Every request is idempotent: re-sending entries the peer holds only
//! shows up as duplicates.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dsnet_core::{DatasetId, EntryId, LogEntry, PublicKey};
use dsnet_store::LogStore;

use crate::error::{LogbookError, Result};
use crate::logbook::Logbook;
use crate::merge::{causal_order, MergeReport};

/// Logsync requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogsyncRequest {
    /// The peer's per-author cursors for a lineage.
    Heads { dataset: DatasetId },
    /// Entries after the given per-author cursors.
    Pull {
        dataset: DatasetId,
        since: BTreeMap<PublicKey, EntryId>,
    },
    /// Entries for the peer to merge.
    Push {
        dataset: DatasetId,
        entries: Vec<LogEntry>,
    },
}

/// Logsync responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogsyncResponse {
    Heads {
        dataset: DatasetId,
        heads: BTreeMap<PublicKey, EntryId>,
        state_hash: Option<[u8; 32]>,
    },
    Entries {
        dataset: DatasetId,
        entries: Vec<LogEntry>,
    },
    Merged(MergeSummary),
}

/// Counts from a merge, as reported over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub buffered: usize,
    pub dropped: usize,
}

impl From<&MergeReport> for MergeSummary {
    fn from(report: &MergeReport) -> Self {
        Self {
            applied: report.applied.len(),
            duplicates: report.duplicates.len(),
            invalid: report.invalid.len(),
            buffered: report.buffered.len(),
            dropped: report.dropped.len(),
        }
    }
}

/// A peer that answers logsync requests.
#[async_trait]
pub trait LogsyncRemote: Send + Sync {
    async fn logsync(&self, request: LogsyncRequest) -> Result<LogsyncResponse>;
}

#[async_trait]
impl<S: LogStore + ?Sized> LogsyncRemote for Logbook<S> {
    async fn logsync(&self, request: LogsyncRequest) -> Result<LogsyncResponse> {
        handle(self, request).await
    }
}

/// Answer a logsync request from the local logbook.
pub async fn handle<S: LogStore + ?Sized>(
    logbook: &Logbook<S>,
    request: LogsyncRequest,
) -> Result<LogsyncResponse> {
    match request {
        LogsyncRequest::Heads { dataset } => Ok(LogsyncResponse::Heads {
            dataset,
            heads: logbook.author_heads(&dataset).await,
            state_hash: state_hash(logbook, &dataset).await?,
        }),
        LogsyncRequest::Pull { dataset, since } => Ok(LogsyncResponse::Entries {
            dataset,
            entries: logbook.entries_since(&dataset, &since).await?,
        }),
        LogsyncRequest::Push { dataset, entries } => {
            check_dataset(&dataset, &entries)?;
            let report = logbook.merge_foreign(entries).await?;
            debug!(
                dataset = %dataset,
                applied = report.applied.len(),
                duplicates = report.duplicates.len(),
                "merged pushed entries"
            );
            Ok(LogsyncResponse::Merged(MergeSummary::from(&report)))
        }
    }
}

fn check_dataset(dataset: &DatasetId, entries: &[LogEntry]) -> Result<()> {
    match entries.iter().find(|e| e.dataset() != *dataset) {
        Some(stray) => Err(LogbookError::InvalidMessage(format!(
            "entry {} belongs to {}, not {}",
            stray.compute_id(),
            stray.dataset(),
            dataset
        ))),
        None => Ok(()),
    }
}

/// Rolling blake3 over a lineage's entry ids in causal order.
///
/// The order is the one [`causal_order`] gives the full entry set, so two
/// nodes holding the same entries agree regardless of arrival order.
pub async fn state_hash<S: LogStore + ?Sized>(
    logbook: &Logbook<S>,
    dataset: &DatasetId,
) -> Result<Option<[u8; 32]>> {
    let entries = logbook.entries(dataset).await?;
    if entries.is_empty() {
        return Ok(None);
    }

    let keyed: HashMap<EntryId, LogEntry> =
        entries.into_iter().map(|e| (e.compute_id(), e)).collect();
    let (order, _) = causal_order(keyed, &HashSet::new());

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dsnet-lineage-v0:");
    hasher.update(dataset.as_bytes());
    for (id, _) in order {
        hasher.update(id.as_bytes());
    }
    Ok(Some(*hasher.finalize().as_bytes()))
}

/// Fetch what the peer has that we lack, and merge it.
pub async fn pull<S, R>(logbook: &Logbook<S>, remote: &R, dataset: DatasetId) -> Result<MergeReport>
where
    S: LogStore + ?Sized,
    R: LogsyncRemote + ?Sized,
{
    let since = logbook.author_heads(&dataset).await;
    match remote.logsync(LogsyncRequest::Pull { dataset, since }).await? {
        LogsyncResponse::Entries {
            dataset: answered,
            entries,
        } if answered == dataset => {
            check_dataset(&dataset, &entries)?;
            logbook.merge_foreign(entries).await
        }
        other => Err(unexpected("Entries", &other)),
    }
}

/// Send the peer what it lacks. Returns the peer's merge summary.
pub async fn push<S, R>(logbook: &Logbook<S>, remote: &R, dataset: DatasetId) -> Result<MergeSummary>
where
    S: LogStore + ?Sized,
    R: LogsyncRemote + ?Sized,
{
    let (heads, _) = remote_heads(remote, dataset).await?;
    let entries = logbook.entries_since(&dataset, &heads).await?;
    if entries.is_empty() {
        return Ok(MergeSummary::default());
    }

    let sent = entries.len();
    match remote.logsync(LogsyncRequest::Push { dataset, entries }).await? {
        LogsyncResponse::Merged(summary) => {
            debug!(dataset = %dataset, sent, applied = summary.applied, "pushed entries");
            Ok(summary)
        }
        other => Err(unexpected("Merged", &other)),
    }
}

async fn remote_heads<R: LogsyncRemote + ?Sized>(
    remote: &R,
    dataset: DatasetId,
) -> Result<(BTreeMap<PublicKey, EntryId>, Option<[u8; 32]>)> {
    match remote.logsync(LogsyncRequest::Heads { dataset }).await? {
        LogsyncResponse::Heads {
            dataset: answered,
            heads,
            state_hash,
        } if answered == dataset => Ok((heads, state_hash)),
        other => Err(unexpected("Heads", &other)),
    }
}

fn unexpected(wanted: &str, got: &LogsyncResponse) -> LogbookError {
    let got = match got {
        LogsyncResponse::Heads { .. } => "Heads",
        LogsyncResponse::Entries { .. } => "Entries",
        LogsyncResponse::Merged(_) => "Merged",
    };
    LogbookError::InvalidMessage(format!("expected {}, got {}", wanted, got))
}

/// Outcome of a full logsync round.
#[derive(Debug, Clone, Default)]
pub struct LogsyncReport {
    pub pulled: MergeReport,
    pub pushed: MergeSummary,
    /// Entries still waiting on parents after the round.
    pub dangling: Vec<EntryId>,
    /// Both sides hash the lineage identically.
    pub converged: bool,
}

/// Pull, push, then compare state hashes.
pub async fn sync<S, R>(logbook: &Logbook<S>, remote: &R, dataset: DatasetId) -> Result<LogsyncReport>
where
    S: LogStore + ?Sized,
    R: LogsyncRemote + ?Sized,
{
    let pulled = pull(logbook, remote, dataset).await?;
    let pushed = push(logbook, remote, dataset).await?;
    finish_round(logbook, remote, dataset, pulled, pushed).await
}

/// Pull, then compare state hashes. Sends the peer nothing, so it works
/// against peers that refuse pushed history.
pub async fn fetch<S, R>(logbook: &Logbook<S>, remote: &R, dataset: DatasetId) -> Result<LogsyncReport>
where
    S: LogStore + ?Sized,
    R: LogsyncRemote + ?Sized,
{
    let pulled = pull(logbook, remote, dataset).await?;
    finish_round(logbook, remote, dataset, pulled, MergeSummary::default()).await
}

async fn finish_round<S, R>(
    logbook: &Logbook<S>,
    remote: &R,
    dataset: DatasetId,
    pulled: MergeReport,
    pushed: MergeSummary,
) -> Result<LogsyncReport>
where
    S: LogStore + ?Sized,
    R: LogsyncRemote + ?Sized,
{
    let (_, remote_hash) = remote_heads(remote, dataset).await?;
    let local_hash = state_hash(logbook, &dataset).await?;
    let converged = remote_hash.is_some() && remote_hash == local_hash;

    let dangling: Vec<EntryId> = logbook
        .dangling()
        .await
        .iter()
        .filter(|e| e.dataset() == dataset)
        .map(|e| e.compute_id())
        .collect();
    if !dangling.is_empty() {
        warn!(dataset = %dataset, count = dangling.len(), "dangling log entries after logsync");
    }

    info!(
        dataset = %dataset,
        pulled = pulled.applied.len(),
        pushed = pushed.applied,
        converged,
        "logsync round finished"
    );

    Ok(LogsyncReport {
        pulled,
        pushed,
        dangling,
        converged,
    })
}
