//! Store traits: the abstract interfaces for block, log and ref persistence.
//!
//! These traits keep the sync layers storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use dsnet_core::{Block, BlockId, DatasetId, EntryId, LogEntry, PublicKey};

use crate::error::Result;

/// Result of inserting a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Entry was appended; carries its application sequence number.
    Inserted(u64),
    /// Entry already exists (idempotent - not an error).
    AlreadyExists,
}

/// Result of a head compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// The head now holds the new value.
    Swapped,
    /// The head did not hold the expected value; nothing was written.
    Conflict { actual: Option<BlockId> },
}

/// Evidence that one author produced two entries with the same parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    pub dataset: DatasetId,
    pub author: PublicKey,
    /// The shared parent.
    pub parent: EntryId,
    /// The entry that arrived second.
    pub entry_id: EntryId,
    /// When the fork was detected (Unix ms).
    pub detected_at: i64,
}

/// Content-addressed block storage.
///
/// Blocks are immutable: putting a block that already exists is a no-op.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Get a block by id.
    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>>;

    /// Check whether a block exists.
    async fn has_block(&self, id: &BlockId) -> Result<bool>;

    /// Store one block. Returns `true` if it was new.
    async fn put_block(&self, block: &Block) -> Result<bool>;

    /// Store many blocks as one unit: either all land or none do.
    ///
    /// Returns the number of blocks that were new.
    async fn put_blocks(&self, blocks: &[Block]) -> Result<usize>;

    /// Delete blocks. Missing ids are ignored. Returns the number removed.
    async fn delete_blocks(&self, ids: &[BlockId]) -> Result<usize>;

    /// Every stored block id.
    async fn list_blocks(&self) -> Result<Vec<BlockId>>;
}

/// Append-only storage for log entries.
///
/// Entries are kept in application order: the sequence number returned by
/// [`LogStore::insert_entry`] increases monotonically across the store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an entry. The caller has already validated it and checked
    /// that its parent is present.
    async fn insert_entry(&self, entry: &LogEntry) -> Result<InsertResult>;

    /// Get an entry by id.
    async fn get_entry(&self, id: &EntryId) -> Result<Option<LogEntry>>;

    /// Check whether an entry exists.
    async fn has_entry(&self, id: &EntryId) -> Result<bool>;

    /// All entries of a lineage, in application order.
    async fn entries_for_dataset(&self, dataset: &DatasetId) -> Result<Vec<LogEntry>>;

    /// Every lineage with at least one entry.
    async fn list_datasets(&self) -> Result<Vec<DatasetId>>;

    /// Record evidence of a same-author fork.
    async fn record_fork(&self, fork: &Fork) -> Result<()>;

    /// All fork evidence for a lineage.
    async fn get_forks(&self, dataset: &DatasetId) -> Result<Vec<Fork>>;
}

/// The per-dataset head table.
#[async_trait]
pub trait RefStore: Send + Sync {
    /// Current head path of a lineage.
    async fn get_head(&self, dataset: &DatasetId) -> Result<Option<BlockId>>;

    /// Atomically replace the head if it currently equals `expected`.
    ///
    /// `None` as `expected` means "no head recorded"; `None` as `new`
    /// clears the head.
    async fn compare_and_swap_head(
        &self,
        dataset: &DatasetId,
        expected: Option<BlockId>,
        new: Option<BlockId>,
    ) -> Result<CasResult>;

    /// Every recorded head.
    async fn list_heads(&self) -> Result<Vec<(DatasetId, BlockId)>>;
}

/// A backend providing all three stores.
pub trait Store: ContentStore + LogStore + RefStore {}

impl<T: ContentStore + LogStore + RefStore> Store for T {}
