//! # dsnet store
//!
//! Storage abstraction for dsnet. Provides trait-based interfaces for block,
//! log entry and head persistence with SQLite and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`ContentStore`] - Content-addressed blocks
//! - [`LogStore`] - Append-only log entries in application order
//! - [`RefStore`] - Per-dataset head table with compare-and-swap
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dsnet_core::Block;
//! use dsnet_store::{ContentStore, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("node.db").unwrap();
//!     let block = Block::raw(b"hello");
//!     store.put_block(&block).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent writes**: storing a block or entry twice is a no-op
//! - **Atomic batches**: `put_blocks` lands every block or none
//! - **CAS heads**: head updates never overwrite a value the caller didn't see
//! - **Fork evidence**: same-author forks are recorded, never resolved

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CasResult, ContentStore, Fork, InsertResult, LogStore, RefStore, Store};

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
