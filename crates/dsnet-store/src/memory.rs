//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;

use dsnet_core::{Block, BlockId, DatasetId, EntryId, LogEntry};

use crate::error::{Result, StoreError};
use crate::traits::{CasResult, ContentStore, Fork, InsertResult, LogStore, RefStore};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Block bytes indexed by id.
    blocks: HashMap<BlockId, Bytes>,

    /// Entries indexed by id.
    entries: HashMap<EntryId, LogEntry>,

    /// Application order per lineage.
    by_dataset: HashMap<DatasetId, Vec<EntryId>>,

    /// Next application sequence number.
    next_seq: u64,

    /// Head table.
    heads: HashMap<DatasetId, BlockId>,

    /// Fork evidence.
    forks: HashMap<DatasetId, Vec<Fork>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner {
                next_seq: 1,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>> {
        let inner = self.read()?;
        Ok(inner.blocks.get(id).map(|data| Block::from_bytes(data.clone())))
    }

    async fn has_block(&self, id: &BlockId) -> Result<bool> {
        Ok(self.read()?.blocks.contains_key(id))
    }

    async fn put_block(&self, block: &Block) -> Result<bool> {
        let mut inner = self.write()?;
        if inner.blocks.contains_key(&block.id()) {
            return Ok(false);
        }
        inner.blocks.insert(block.id(), block.data().clone());
        Ok(true)
    }

    async fn put_blocks(&self, blocks: &[Block]) -> Result<usize> {
        // One write guard for the whole batch.
        let mut inner = self.write()?;
        let mut added = 0;
        for block in blocks {
            if !inner.blocks.contains_key(&block.id()) {
                inner.blocks.insert(block.id(), block.data().clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn delete_blocks(&self, ids: &[BlockId]) -> Result<usize> {
        let mut inner = self.write()?;
        Ok(ids
            .iter()
            .filter(|id| inner.blocks.remove(*id).is_some())
            .count())
    }

    async fn list_blocks(&self) -> Result<Vec<BlockId>> {
        let mut ids: Vec<BlockId> = self.read()?.blocks.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn insert_entry(&self, entry: &LogEntry) -> Result<InsertResult> {
        let mut inner = self.write()?;

        let id = entry.compute_id();
        if inner.entries.contains_key(&id) {
            return Ok(InsertResult::AlreadyExists);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(id, entry.clone());
        inner.by_dataset.entry(entry.dataset()).or_default().push(id);

        Ok(InsertResult::Inserted(seq))
    }

    async fn get_entry(&self, id: &EntryId) -> Result<Option<LogEntry>> {
        Ok(self.read()?.entries.get(id).cloned())
    }

    async fn has_entry(&self, id: &EntryId) -> Result<bool> {
        Ok(self.read()?.entries.contains_key(id))
    }

    async fn entries_for_dataset(&self, dataset: &DatasetId) -> Result<Vec<LogEntry>> {
        let inner = self.read()?;
        Ok(inner
            .by_dataset
            .get(dataset)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.entries.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetId>> {
        let mut ids: Vec<DatasetId> = self.read()?.by_dataset.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn record_fork(&self, fork: &Fork) -> Result<()> {
        let mut inner = self.write()?;
        let forks = inner.forks.entry(fork.dataset).or_default();
        let known: HashSet<(EntryId, EntryId)> =
            forks.iter().map(|f| (f.parent, f.entry_id)).collect();
        if !known.contains(&(fork.parent, fork.entry_id)) {
            forks.push(fork.clone());
        }
        Ok(())
    }

    async fn get_forks(&self, dataset: &DatasetId) -> Result<Vec<Fork>> {
        Ok(self.read()?.forks.get(dataset).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl RefStore for MemoryStore {
    async fn get_head(&self, dataset: &DatasetId) -> Result<Option<BlockId>> {
        Ok(self.read()?.heads.get(dataset).copied())
    }

    async fn compare_and_swap_head(
        &self,
        dataset: &DatasetId,
        expected: Option<BlockId>,
        new: Option<BlockId>,
    ) -> Result<CasResult> {
        let mut inner = self.write()?;
        let actual = inner.heads.get(dataset).copied();
        if actual != expected {
            return Ok(CasResult::Conflict { actual });
        }
        match new {
            Some(path) => inner.heads.insert(*dataset, path),
            None => inner.heads.remove(dataset),
        };
        Ok(CasResult::Swapped)
    }

    async fn list_heads(&self) -> Result<Vec<(DatasetId, BlockId)>> {
        let mut heads: Vec<_> = self.read()?.heads.iter().map(|(d, p)| (*d, *p)).collect();
        heads.sort();
        Ok(heads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsnet_core::{EntryBuilder, Keypair};

    #[tokio::test]
    async fn test_block_put_is_idempotent() {
        let store = MemoryStore::new();
        let block = Block::raw(b"chunk");

        assert!(store.put_block(&block).await.unwrap());
        assert!(!store.put_block(&block).await.unwrap());
        assert!(store.has_block(&block.id()).await.unwrap());
        assert_eq!(store.get_block(&block.id()).await.unwrap(), Some(block));
    }

    #[tokio::test]
    async fn test_put_and_delete_many() {
        let store = MemoryStore::new();
        let blocks: Vec<_> = (0..4u8).map(|i| Block::raw(&[i])).collect();

        assert_eq!(store.put_blocks(&blocks).await.unwrap(), 4);
        assert_eq!(store.put_blocks(&blocks[..2]).await.unwrap(), 0);
        assert_eq!(store.list_blocks().await.unwrap().len(), 4);

        let gone = store
            .delete_blocks(&[blocks[0].id(), BlockId::of(b"absent")])
            .await
            .unwrap();
        assert_eq!(gone, 1);
        assert!(!store.has_block(&blocks[0].id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_keep_application_order() {
        let store = MemoryStore::new();
        let kp = Keypair::generate();
        let init = EntryBuilder::init("alice", "cities").timestamp(1).sign(&kp);
        let commit = EntryBuilder::commit(init.dataset(), init.compute_id(), BlockId::of(b"v1"), "v1")
            .timestamp(2)
            .sign(&kp);

        assert_eq!(store.insert_entry(&init).await.unwrap(), InsertResult::Inserted(1));
        assert_eq!(store.insert_entry(&commit).await.unwrap(), InsertResult::Inserted(2));
        assert_eq!(store.insert_entry(&init).await.unwrap(), InsertResult::AlreadyExists);

        let entries = store.entries_for_dataset(&init.dataset()).await.unwrap();
        assert_eq!(entries, vec![init.clone(), commit]);
        assert_eq!(store.list_datasets().await.unwrap(), vec![init.dataset()]);
    }

    #[tokio::test]
    async fn test_head_cas() {
        let store = MemoryStore::new();
        let dataset = DatasetId::from_bytes([1; 32]);
        let v1 = BlockId::of(b"v1");
        let v2 = BlockId::of(b"v2");

        assert_eq!(
            store.compare_and_swap_head(&dataset, None, Some(v1)).await.unwrap(),
            CasResult::Swapped
        );
        assert_eq!(
            store.compare_and_swap_head(&dataset, None, Some(v2)).await.unwrap(),
            CasResult::Conflict { actual: Some(v1) }
        );
        assert_eq!(
            store.compare_and_swap_head(&dataset, Some(v1), Some(v2)).await.unwrap(),
            CasResult::Swapped
        );
        assert_eq!(store.get_head(&dataset).await.unwrap(), Some(v2));

        store.compare_and_swap_head(&dataset, Some(v2), None).await.unwrap();
        assert!(store.list_heads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fork_recording_dedups() {
        let store = MemoryStore::new();
        let fork = Fork {
            dataset: DatasetId::from_bytes([2; 32]),
            author: Keypair::generate().public_key(),
            parent: EntryId::from_bytes([3; 32]),
            entry_id: EntryId::from_bytes([4; 32]),
            detected_at: 10,
        };
        store.record_fork(&fork).await.unwrap();
        store.record_fork(&fork).await.unwrap();
        assert_eq!(store.get_forks(&fork.dataset).await.unwrap(), vec![fork]);
    }
}
