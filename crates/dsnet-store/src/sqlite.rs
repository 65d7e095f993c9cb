//! SQLite implementation of the store traits.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use dsnet_core::{Block, BlockId, DatasetId, EntryId, LogEntry, PublicKey};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::now_millis;
use crate::traits::{CasResult, ContentStore, Fork, InsertResult, LogStore, RefStore};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(format!("connection mutex: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn blob32(bytes: Vec<u8>, column: &str) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData(format!("{} is not 32 bytes", column)))
}

fn row_to_fork(
    dataset: Vec<u8>,
    author: Vec<u8>,
    parent: Vec<u8>,
    entry_id: Vec<u8>,
    detected_at: i64,
) -> Result<Fork> {
    Ok(Fork {
        dataset: DatasetId(blob32(dataset, "dataset")?),
        author: PublicKey(blob32(author, "author")?),
        parent: EntryId(blob32(parent, "parent")?),
        entry_id: EntryId(blob32(entry_id, "entry_id")?),
        detected_at,
    })
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>> {
        let id = *id;
        self.run(move |conn| {
            let data: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM blocks WHERE block_id = ?1",
                    params![id.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|d| Block::verified(id, d).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn has_block(&self, id: &BlockId) -> Result<bool> {
        let id = *id;
        self.run(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM blocks WHERE block_id = ?1)",
                params![id.0.as_slice()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn put_block(&self, block: &Block) -> Result<bool> {
        Ok(self.put_blocks(std::slice::from_ref(block)).await? == 1)
    }

    async fn put_blocks(&self, blocks: &[Block]) -> Result<usize> {
        let blocks = blocks.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let now = now_millis();
            let mut added = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO blocks (block_id, data, size, stored_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for block in &blocks {
                    added += stmt.execute(params![
                        block.id().0.as_slice(),
                        block.data().as_ref(),
                        block.size() as i64,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(added)
        })
        .await
    }

    async fn delete_blocks(&self, ids: &[BlockId]) -> Result<usize> {
        let ids = ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM blocks WHERE block_id = ?1")?;
                for id in &ids {
                    removed += stmt.execute(params![id.0.as_slice()])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn list_blocks(&self) -> Result<Vec<BlockId>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT block_id FROM blocks ORDER BY block_id")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|b| blob32(b, "block_id").map(BlockId))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn insert_entry(&self, entry: &LogEntry) -> Result<InsertResult> {
        let entry = entry.clone();
        self.run(move |conn| {
            let id = entry.compute_id();
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM entries WHERE entry_id = ?1)",
                params![id.0.as_slice()],
                |row| row.get(0),
            )?;
            if exists {
                return Ok(InsertResult::AlreadyExists);
            }

            conn.execute(
                "INSERT INTO entries (
                    entry_id, dataset, author, op, parent, timestamp,
                    canonical_bytes, applied_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.0.as_slice(),
                    entry.dataset().0.as_slice(),
                    entry.author().0.as_slice(),
                    entry.op().to_u8() as i64,
                    entry.parent().as_ref().map(|p| p.0.to_vec()),
                    entry.timestamp(),
                    entry.canonical_bytes(),
                    now_millis(),
                ],
            )?;

            Ok(InsertResult::Inserted(conn.last_insert_rowid() as u64))
        })
        .await
    }

    async fn get_entry(&self, id: &EntryId) -> Result<Option<LogEntry>> {
        let id = *id;
        self.run(move |conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT canonical_bytes FROM entries WHERE entry_id = ?1",
                    params![id.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            bytes
                .map(|b| LogEntry::from_canonical_bytes(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn has_entry(&self, id: &EntryId) -> Result<bool> {
        let id = *id;
        self.run(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM entries WHERE entry_id = ?1)",
                params![id.0.as_slice()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn entries_for_dataset(&self, dataset: &DatasetId) -> Result<Vec<LogEntry>> {
        let dataset = *dataset;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT canonical_bytes FROM entries WHERE dataset = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![dataset.0.as_slice()], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter()
                .map(|b| LogEntry::from_canonical_bytes(b).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetId>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT dataset FROM entries ORDER BY dataset")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|b| blob32(b, "dataset").map(DatasetId))
                .collect()
        })
        .await
    }

    async fn record_fork(&self, fork: &Fork) -> Result<()> {
        let fork = fork.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO forks (dataset, author, parent, entry_id, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fork.dataset.0.as_slice(),
                    fork.author.0.as_slice(),
                    fork.parent.0.as_slice(),
                    fork.entry_id.0.as_slice(),
                    fork.detected_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_forks(&self, dataset: &DatasetId) -> Result<Vec<Fork>> {
        let dataset = *dataset;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT dataset, author, parent, entry_id, detected_at
                 FROM forks WHERE dataset = ?1 ORDER BY detected_at, entry_id",
            )?;
            let rows = stmt
                .query_map(params![dataset.0.as_slice()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<rusqlite::Result<Vec<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>, i64)>>>()?;
            rows.into_iter()
                .map(|(d, a, p, e, t)| row_to_fork(d, a, p, e, t))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl RefStore for SqliteStore {
    async fn get_head(&self, dataset: &DatasetId) -> Result<Option<BlockId>> {
        let dataset = *dataset;
        self.run(move |conn| {
            let path: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT path FROM heads WHERE dataset = ?1",
                    params![dataset.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            path.map(|p| blob32(p, "path").map(BlockId)).transpose()
        })
        .await
    }

    async fn compare_and_swap_head(
        &self,
        dataset: &DatasetId,
        expected: Option<BlockId>,
        new: Option<BlockId>,
    ) -> Result<CasResult> {
        let dataset = *dataset;
        self.run(move |conn| {
            // IMMEDIATE takes the write lock before the read.
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let current: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT path FROM heads WHERE dataset = ?1",
                    params![dataset.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            let actual = current.map(|p| blob32(p, "path").map(BlockId)).transpose()?;

            if actual != expected {
                return Ok(CasResult::Conflict { actual });
            }

            match new {
                Some(path) => {
                    tx.execute(
                        "INSERT INTO heads (dataset, path, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(dataset) DO UPDATE SET
                            path = excluded.path,
                            updated_at = excluded.updated_at",
                        params![dataset.0.as_slice(), path.0.as_slice(), now_millis()],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM heads WHERE dataset = ?1",
                        params![dataset.0.as_slice()],
                    )?;
                }
            }
            tx.commit()?;
            Ok(CasResult::Swapped)
        })
        .await
    }

    async fn list_heads(&self) -> Result<Vec<(DatasetId, BlockId)>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT dataset, path FROM heads ORDER BY dataset")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(d, p)| Ok((DatasetId(blob32(d, "dataset")?), BlockId(blob32(p, "path")?))))
                .collect()
        })
        .await
    }
}
