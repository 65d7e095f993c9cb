//! Manifest building and diffing.
//!
//! All functions here are pure functions of block hashes: two peers holding
//! the same DAG produce byte-identical manifests, and a diff depends only on
//! which ids each side holds.

use std::collections::{BTreeMap, HashMap, HashSet};

use dsnet_core::{Block, BlockId, DagInfo, Manifest, ManifestEntry};
use dsnet_store::ContentStore;

use crate::error::{DsyncError, Result};

/// Walk the DAG rooted at `root`, reading blocks from `staged` first and
/// then from `store`. Returns the manifest in depth-first pre-order.
async fn walk<S: ContentStore + ?Sized>(
    store: &S,
    staged: &HashMap<BlockId, Block>,
    root: BlockId,
) -> Result<Manifest> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }

        let block = match staged.get(&id) {
            Some(block) => block.clone(),
            None => match store.get_block(&id).await? {
                Some(block) => block,
                None if id == root => return Err(DsyncError::RefNotFound(root)),
                None => return Err(DsyncError::BlockNotFound(id)),
            },
        };

        entries.push(ManifestEntry {
            id,
            size: block.size(),
        });

        // Reverse so the first link is visited first.
        for link in block.links()?.into_iter().rev() {
            if !seen.contains(&link.id) {
                stack.push(link.id);
            }
        }
    }

    Ok(Manifest { root, entries })
}

/// Build the manifest for a version held in `store`.
///
/// Fails with `RefNotFound` if the root is absent and `BlockNotFound` if the
/// root is present but a linked block is not.
pub async fn build_manifest<S: ContentStore + ?Sized>(store: &S, root: BlockId) -> Result<Manifest> {
    walk(store, &HashMap::new(), root).await
}

/// Blocks of `remote` that `local` doesn't list, in `remote` order.
pub fn diff(local: &Manifest, remote: &Manifest) -> Vec<BlockId> {
    let have: HashSet<BlockId> = local.ids().collect();
    remote.ids().filter(|id| !have.contains(id)).collect()
}

/// Blocks of `manifest` that `store` doesn't hold, in manifest order.
pub async fn missing_from_store<S: ContentStore + ?Sized>(
    store: &S,
    manifest: &Manifest,
) -> Result<Vec<BlockId>> {
    let mut missing = Vec::new();
    for id in manifest.ids() {
        if !store.has_block(&id).await? {
            missing.push(id);
        }
    }
    Ok(missing)
}

/// Manifest plus component labels and total size, for pre-flight checks.
pub async fn dag_info<S: ContentStore + ?Sized>(store: &S, root: BlockId) -> Result<DagInfo> {
    let manifest = build_manifest(store, root).await?;

    let mut labels = BTreeMap::new();
    if let Some(root_block) = store.get_block(&root).await? {
        for link in root_block.links()? {
            if let Some(index) = manifest.entries.iter().position(|e| e.id == link.id) {
                labels.insert(link.name, index);
            }
        }
    }

    Ok(DagInfo {
        total_size: manifest.total_size(),
        manifest,
        labels,
    })
}

/// Every block reachable from `roots`. Roots missing from the store are
/// skipped.
pub async fn reachable<S: ContentStore + ?Sized>(
    store: &S,
    roots: impl IntoIterator<Item = BlockId>,
) -> Result<HashSet<BlockId>> {
    let mut live = HashSet::new();
    for root in roots {
        if live.contains(&root) {
            continue;
        }
        match build_manifest(store, root).await {
            Ok(manifest) => live.extend(manifest.ids()),
            Err(DsyncError::RefNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(live)
}

/// Re-walk a received DAG over staged blocks plus the store and check it
/// matches the manifest the sender claimed.
pub async fn verify_complete<S: ContentStore + ?Sized>(
    store: &S,
    staged: &HashMap<BlockId, Block>,
    claimed: &Manifest,
) -> Result<()> {
    let walked = match walk(store, staged, claimed.root).await {
        Ok(m) => m,
        Err(DsyncError::RefNotFound(id)) | Err(DsyncError::BlockNotFound(id)) => {
            return Err(DsyncError::VerificationFailed(format!("dangling link to {}", id)));
        }
        Err(e) => return Err(e),
    };

    if &walked != claimed {
        return Err(DsyncError::VerificationFailed(
            "manifest does not match received DAG".into(),
        ));
    }
    Ok(())
}
