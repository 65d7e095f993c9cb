//! Mark-sweep garbage collection for the block store.
//!
//! A block is live if it is reachable from a root: a recorded head, a
//! committed path in the logbook, or the root of a completed session whose
//! head has not been finalized yet. Everything else is swept.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use dsnet_core::BlockId;
use dsnet_dsync::reachable;
use dsnet_store::ContentStore;

use crate::error::Result;

/// Statistics from a collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// Distinct roots marked from.
    pub roots: usize,
    /// Blocks reachable from the roots.
    pub live: usize,
    /// Unreachable blocks found.
    pub candidates: usize,
    /// Blocks actually deleted. Zero on a dry run.
    pub swept: usize,
    pub dry_run: bool,
}

impl GcReport {
    /// True if any blocks were deleted.
    pub fn did_sweep(&self) -> bool {
        self.swept > 0
    }
}

/// Mark from `roots`, then delete everything unmarked in batches.
///
/// Roots absent from the store are ignored. A root that is present but
/// links to a missing block aborts the run before anything is deleted.
pub async fn collect<S: ContentStore + ?Sized>(
    store: &S,
    roots: impl IntoIterator<Item = BlockId>,
    batch_size: usize,
    dry_run: bool,
) -> Result<GcReport> {
    let roots: BTreeSet<BlockId> = roots.into_iter().collect();

    // Mark
    let live = reachable(store, roots.iter().copied()).await?;

    // Sweep
    let candidates: Vec<BlockId> = store
        .list_blocks()
        .await?
        .into_iter()
        .filter(|id| !live.contains(id))
        .collect();

    let mut swept = 0;
    if !dry_run {
        for batch in candidates.chunks(batch_size.max(1)) {
            swept += store.delete_blocks(batch).await?;
        }
    }

    info!(
        roots = roots.len(),
        live = live.len(),
        candidates = candidates.len(),
        swept,
        dry_run,
        "gc sweep finished"
    );

    Ok(GcReport {
        roots: roots.len(),
        live: live.len(),
        candidates: candidates.len(),
        swept,
        dry_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsnet_core::{Block, VersionBuilder};
    use dsnet_store::MemoryStore;

    #[tokio::test]
    async fn test_sweeps_only_unreachable() {
        let store = MemoryStore::new();
        let version = |body: &[u8]| {
            VersionBuilder::new()
                .structure(b"csv".to_vec())
                .body(body.to_vec())
                .meta(b"title: cities".to_vec())
                .commit(b"snapshot".to_vec())
                .build()
        };
        let kept = version(b"kept body");
        let dropped = version(b"dropped body");
        store.put_blocks(kept.blocks()).await.unwrap();
        store.put_blocks(dropped.blocks()).await.unwrap();
        let stray = Block::raw(b"stray");
        store.put_block(&stray).await.unwrap();

        let report = collect(&store, [kept.root()], 2, false).await.unwrap();
        assert_eq!(report.roots, 1);
        assert_eq!(report.live, kept.blocks().len());
        assert!(report.did_sweep());

        for block in kept.blocks() {
            assert!(store.has_block(&block.id()).await.unwrap());
        }
        assert!(!store.has_block(&dropped.root()).await.unwrap());
        assert!(!store.has_block(&stray.id()).await.unwrap());
        assert_eq!(store.list_blocks().await.unwrap().len(), kept.blocks().len());
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let store = MemoryStore::new();
        let stray = Block::raw(b"stray");
        store.put_block(&stray).await.unwrap();

        let report = collect(&store, [BlockId::of(b"absent root")], 16, true).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.swept, 0);
        assert!(store.has_block(&stray.id()).await.unwrap());
    }
}
