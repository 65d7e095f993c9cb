//! The logbook: an arena of immutable, hash-linked log entries.
//!
//! Entries are keyed by [`EntryId`] and persisted through a [`LogStore`].
//! The logbook keeps an in-memory index of each lineage (owner, current
//! name, commits) and a buffer of foreign entries whose parents haven't
//! arrived yet. Application is serialized per lineage; lineages never wait
//! on each other.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use dsnet_core::{
    validate_entry, BlockId, DatasetId, EntryId, LogEntry, OpPayload, PublicKey, ValidationError,
};
use dsnet_store::{now_millis, Fork, InsertResult, LogStore};

use crate::error::{LogbookError, Result};
use crate::merge::{causal_order, MergeReport};

/// Bounds on what a logbook holds on behalf of peers.
pub mod limits {
    /// Entries buffered per lineage while their parents are missing.
    pub const MAX_PENDING: usize = 1024;
}

/// Everything the log says about one dataset lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    pub dataset: DatasetId,
    /// Author of the `Init` entry.
    pub owner: PublicKey,
    pub username: String,
    /// Current name: the latest `Rename`, or the `Init` name.
    pub name: String,
    pub created_at: i64,
    /// Last applied entry.
    pub latest: EntryId,
    /// Committed version paths, in application order.
    pub commits: Vec<BlockId>,
    pub deleted: bool,
    /// Number of applied entries.
    pub len: usize,
}

impl Lineage {
    pub fn latest_commit(&self) -> Option<BlockId> {
        self.commits.last().copied()
    }
}

#[derive(Default)]
struct Index {
    lineages: HashMap<DatasetId, Lineage>,
    /// First child of a parent per author, for fork detection.
    children: HashMap<(EntryId, PublicKey), EntryId>,
    /// Last applied entry per author per lineage.
    author_heads: HashMap<DatasetId, BTreeMap<PublicKey, EntryId>>,
}

impl Index {
    /// Fold an applied entry into the index. Returns the earlier sibling
    /// when the entry forks its author's chain.
    fn observe(&mut self, id: EntryId, entry: &LogEntry) -> Option<EntryId> {
        let dataset = entry.dataset();
        let author = *entry.author();

        let fork = entry.parent().and_then(|parent| {
            match self.children.entry((parent, author)) {
                Entry::Occupied(first) => Some(*first.get()),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                    None
                }
            }
        });

        self.author_heads
            .entry(dataset)
            .or_default()
            .insert(author, id);

        match entry.decode_payload() {
            Ok(OpPayload::Init { username, name }) => {
                self.lineages.insert(
                    dataset,
                    Lineage {
                        dataset,
                        owner: author,
                        username,
                        name,
                        created_at: entry.timestamp(),
                        latest: id,
                        commits: Vec::new(),
                        deleted: false,
                        len: 1,
                    },
                );
            }
            payload => {
                if let Some(lineage) = self.lineages.get_mut(&dataset) {
                    lineage.latest = id;
                    lineage.len += 1;
                    match payload {
                        Ok(OpPayload::Commit { path, .. }) => lineage.commits.push(path),
                        Ok(OpPayload::Rename { name }) => lineage.name = name,
                        Ok(OpPayload::Delete) => lineage.deleted = true,
                        _ => {}
                    }
                }
            }
        }

        fork
    }
}

enum Applied {
    New { fork: bool },
    Duplicate,
}

/// Append-only store of dataset histories.
pub struct Logbook<S: ?Sized> {
    index: RwLock<Index>,
    pending: Mutex<HashMap<DatasetId, HashMap<EntryId, LogEntry>>>,
    locks: Mutex<HashMap<DatasetId, Arc<Mutex<()>>>>,
    max_pending: usize,
    store: Arc<S>,
}

impl<S: LogStore + ?Sized> Logbook<S> {
    /// Open a logbook over `store`, indexing what it already holds.
    pub async fn open(store: Arc<S>) -> Result<Self> {
        let mut index = Index::default();
        for dataset in store.list_datasets().await? {
            for entry in store.entries_for_dataset(&dataset).await? {
                index.observe(entry.compute_id(), &entry);
            }
        }
        debug!(lineages = index.lineages.len(), "logbook opened");

        Ok(Self {
            index: RwLock::new(index),
            pending: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            max_pending: limits::MAX_PENDING,
            store,
        })
    }

    /// Buffer at most `max` parentless entries per lineage.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn lineage_lock(&self, dataset: DatasetId) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(dataset).or_default().clone()
    }

    /// Apply one validated entry. The caller holds the lineage lock.
    async fn apply_locked(&self, id: EntryId, entry: &LogEntry) -> Result<Applied> {
        let dataset = entry.dataset();

        if let Some(parent) = entry.parent() {
            match self.store.get_entry(&parent).await? {
                None => return Err(LogbookError::InvalidParent { entry: id, parent }),
                Some(p) if p.dataset() != dataset => {
                    return Err(ValidationError::ForeignParent { entry: id, parent }.into())
                }
                Some(_) => {}
            }
        }

        if let InsertResult::AlreadyExists = self.store.insert_entry(entry).await? {
            return Ok(Applied::Duplicate);
        }

        let first = self.index.write().await.observe(id, entry);
        let mut fork = false;
        if let (Some(first), Some(parent)) = (first, entry.parent()) {
            warn!(
                dataset = %dataset,
                author = %entry.author(),
                parent = %parent,
                first = %first,
                entry = %id,
                "fork detected"
            );
            self.store
                .record_fork(&Fork {
                    dataset,
                    author: *entry.author(),
                    parent,
                    entry_id: id,
                    detected_at: now_millis(),
                })
                .await?;
            fork = true;
        }

        debug!(dataset = %dataset, entry = %id, op = ?entry.op(), "entry applied");
        Ok(Applied::New { fork })
    }

    /// Append a locally authored entry. Its parent must already be in the
    /// log. Appending an existing entry is a no-op.
    pub async fn append(&self, entry: LogEntry) -> Result<EntryId> {
        validate_entry(&entry)?;
        let id = entry.compute_id();
        let lock = self.lineage_lock(entry.dataset()).await;
        let _guard = lock.lock().await;
        self.apply_locked(id, &entry).await?;
        Ok(id)
    }

    /// Merge entries received from a peer.
    ///
    /// Valid entries are applied in causal order; entries whose parent is
    /// missing are buffered and retried on later calls. A lineage buffers
    /// at most `max_pending` entries: those already waiting keep their
    /// place and newcomers past the cap are dropped.
    pub async fn merge_foreign(&self, entries: Vec<LogEntry>) -> Result<MergeReport> {
        let mut by_dataset: BTreeMap<DatasetId, Vec<LogEntry>> = BTreeMap::new();
        for entry in entries {
            by_dataset.entry(entry.dataset()).or_default().push(entry);
        }

        let mut report = MergeReport::default();
        for (dataset, entries) in by_dataset {
            report.absorb(self.merge_lineage(dataset, entries).await?);
        }
        Ok(report)
    }

    async fn merge_lineage(&self, dataset: DatasetId, entries: Vec<LogEntry>) -> Result<MergeReport> {
        let lock = self.lineage_lock(dataset).await;
        let _guard = lock.lock().await;

        let mut report = MergeReport::default();
        let mut candidates = self
            .pending
            .lock()
            .await
            .remove(&dataset)
            .unwrap_or_default();
        let waiting: HashSet<EntryId> = candidates.keys().copied().collect();

        for entry in entries {
            let id = entry.compute_id();
            if candidates.contains_key(&id) || self.store.has_entry(&id).await? {
                report.duplicates.push(id);
                continue;
            }
            if let Err(e) = validate_entry(&entry) {
                warn!(dataset = %dataset, entry = %id, error = %e, "rejected foreign entry");
                report.invalid.push((id, e.to_string()));
                continue;
            }
            candidates.insert(id, entry);
        }

        let mut present = HashSet::new();
        for entry in candidates.values() {
            if let Some(parent) = entry.parent() {
                if !candidates.contains_key(&parent) && self.store.has_entry(&parent).await? {
                    present.insert(parent);
                }
            }
        }

        let (order, mut leftover) = causal_order(candidates, &present);
        let mut order = order.into_iter();
        let mut failure = None;
        while let Some((id, entry)) = order.next() {
            match self.apply_locked(id, &entry).await {
                Ok(Applied::New { fork }) => {
                    report.applied.push(id);
                    if fork {
                        report.forks.push(id);
                    }
                }
                Ok(Applied::Duplicate) => report.duplicates.push(id),
                // Its parent was rejected earlier in this pass.
                Err(LogbookError::InvalidParent { .. }) => {
                    leftover.insert(id, entry);
                }
                Err(LogbookError::Validation(e)) => {
                    warn!(dataset = %dataset, entry = %id, error = %e, "rejected foreign entry");
                    report.invalid.push((id, e.to_string()));
                }
                Err(e) => {
                    leftover.insert(id, entry);
                    leftover.extend(order.by_ref());
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut kept: Vec<(EntryId, LogEntry)> = leftover.into_iter().collect();
        kept.sort_by_key(|(id, entry)| (!waiting.contains(id), entry.timestamp(), *id));
        let overflow = kept.split_off(kept.len().min(self.max_pending));
        if !overflow.is_empty() {
            warn!(
                dataset = %dataset,
                dropped = overflow.len(),
                limit = self.max_pending,
                "pending buffer full, dropping entries"
            );
            let mut dropped: Vec<EntryId> = overflow.into_iter().map(|(id, _)| id).collect();
            dropped.sort();
            report.dropped = dropped;
        }

        let mut buffered: Vec<EntryId> = kept.iter().map(|(id, _)| *id).collect();
        buffered.sort();
        report.buffered = buffered;
        if !kept.is_empty() {
            debug!(dataset = %dataset, buffered = kept.len(), "entries waiting on parents");
            self.pending.lock().await.insert(dataset, kept.into_iter().collect());
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Buffered entries whose parents never arrived, oldest first.
    pub async fn dangling(&self) -> Vec<LogEntry> {
        let pending = self.pending.lock().await;
        let mut entries: Vec<LogEntry> = pending
            .values()
            .flat_map(|entries| entries.values().cloned())
            .collect();
        entries.sort_by_key(|e| (e.timestamp(), e.compute_id()));
        entries
    }

    pub async fn get(&self, id: &EntryId) -> Result<Option<LogEntry>> {
        Ok(self.store.get_entry(id).await?)
    }

    pub async fn contains(&self, id: &EntryId) -> Result<bool> {
        Ok(self.store.has_entry(id).await?)
    }

    /// All entries of a lineage, in application order.
    pub async fn entries(&self, dataset: &DatasetId) -> Result<Vec<LogEntry>> {
        Ok(self.store.entries_for_dataset(dataset).await?)
    }

    pub async fn lineage(&self, dataset: &DatasetId) -> Option<Lineage> {
        self.index.read().await.lineages.get(dataset).cloned()
    }

    pub async fn lineages(&self) -> Vec<Lineage> {
        let mut all: Vec<Lineage> = self.index.read().await.lineages.values().cloned().collect();
        all.sort_by(|a, b| (&a.username, &a.name).cmp(&(&b.username, &b.name)));
        all
    }

    /// The live lineage currently called `username/name`. If several
    /// match, the most recently created wins.
    pub async fn find(&self, username: &str, name: &str) -> Option<Lineage> {
        self.index
            .read()
            .await
            .lineages
            .values()
            .filter(|l| !l.deleted && l.username == username && l.name == name)
            .max_by_key(|l| (l.created_at, l.dataset))
            .cloned()
    }

    /// Whether `path` was committed in `dataset`.
    pub async fn has_commit(&self, dataset: &DatasetId, path: &BlockId) -> bool {
        self.index
            .read()
            .await
            .lineages
            .get(dataset)
            .map_or(false, |l| l.commits.contains(path))
    }

    /// Every committed path across all lineages.
    pub async fn commit_paths(&self) -> Vec<BlockId> {
        self.index
            .read()
            .await
            .lineages
            .values()
            .flat_map(|l| l.commits.iter().copied())
            .collect()
    }

    /// Last applied entry per author.
    pub async fn author_heads(&self, dataset: &DatasetId) -> BTreeMap<PublicKey, EntryId> {
        self.index
            .read()
            .await
            .author_heads
            .get(dataset)
            .cloned()
            .unwrap_or_default()
    }

    /// Entries a peer with cursor `since` lacks: for each author, the
    /// entries after the cursor, or all of them if the cursor is unknown.
    pub async fn entries_since(
        &self,
        dataset: &DatasetId,
        since: &BTreeMap<PublicKey, EntryId>,
    ) -> Result<Vec<LogEntry>> {
        let entries = self.store.entries_for_dataset(dataset).await?;

        let mut cursor_at: HashMap<PublicKey, usize> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            if since.get(entry.author()) == Some(&entry.compute_id()) {
                cursor_at.insert(*entry.author(), i);
            }
        }

        Ok(entries
            .into_iter()
            .enumerate()
            .filter(|(i, entry)| cursor_at.get(entry.author()).map_or(true, |at| i > at))
            .map(|(_, entry)| entry)
            .collect())
    }

    pub async fn forks(&self, dataset: &DatasetId) -> Result<Vec<Fork>> {
        Ok(self.store.get_forks(dataset).await?)
    }
}
