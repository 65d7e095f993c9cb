//! Dataset version construction.
//!
//! A version is a DAG whose root node links four named components:
//! `structure`, `body`, `meta` and `commit`. The body is itself a node
//! linking fixed-size raw chunks, so an unchanged body between two versions
//! shares every chunk block. The root's inline payload holds the path of the
//! previous version, if any.

use crate::block::{Block, DagNode};
use crate::types::BlockId;

/// Default body chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Component labels linked from a version root, in link order.
pub const COMPONENTS: [&str; 4] = ["structure", "body", "meta", "commit"];

/// An immutable snapshot: its root path plus every block reachable from it.
#[derive(Debug, Clone)]
pub struct DatasetVersion {
    root: BlockId,
    blocks: Vec<Block>,
}

impl DatasetVersion {
    /// The version path.
    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Every block of the version, root first.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Path of the superseded version, read back from the root payload.
    pub fn previous(&self) -> Option<BlockId> {
        let root = self.blocks.first()?.as_node().ok()?;
        BlockId::try_from(root.payload.as_ref()).ok()
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    /// Sum of block sizes, counting shared blocks once.
    pub fn total_size(&self) -> u64 {
        let mut seen = std::collections::HashSet::new();
        self.blocks
            .iter()
            .filter(|b| seen.insert(b.id()))
            .map(|b| b.size())
            .sum()
    }
}

/// Builder for [`DatasetVersion`].
#[derive(Debug, Clone)]
pub struct VersionBuilder {
    structure: Vec<u8>,
    body: Vec<u8>,
    meta: Vec<u8>,
    commit: Vec<u8>,
    previous: Option<BlockId>,
    chunk_size: usize,
}

impl Default for VersionBuilder {
    fn default() -> Self {
        Self {
            structure: Vec::new(),
            body: Vec::new(),
            meta: Vec::new(),
            commit: Vec::new(),
            previous: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl VersionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn structure(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.structure = bytes.into();
        self
    }

    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = bytes.into();
        self
    }

    pub fn meta(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.meta = bytes.into();
        self
    }

    pub fn commit(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.commit = bytes.into();
        self
    }

    /// Record the path this version supersedes.
    pub fn previous(mut self, path: BlockId) -> Self {
        self.previous = Some(path);
        self
    }

    /// Body chunk size in bytes. Zero is treated as one.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Assemble the DAG.
    pub fn build(self) -> DatasetVersion {
        let chunks: Vec<Block> = if self.body.is_empty() {
            Vec::new()
        } else {
            self.body.chunks(self.chunk_size).map(Block::raw).collect()
        };

        let mut body_node = DagNode::new();
        for (i, chunk) in chunks.iter().enumerate() {
            body_node = body_node.link(i.to_string(), chunk);
        }
        let body = body_node.into_block();

        let structure = Block::raw(&self.structure);
        let meta = Block::raw(&self.meta);
        let commit = Block::raw(&self.commit);

        let root = DagNode::new()
            .link(COMPONENTS[0], &structure)
            .link(COMPONENTS[1], &body)
            .link(COMPONENTS[2], &meta)
            .link(COMPONENTS[3], &commit)
            .payload(
                self.previous
                    .map(|p| p.0.to_vec())
                    .unwrap_or_default(),
            )
            .into_block();

        let mut blocks = Vec::with_capacity(chunks.len() + 5);
        blocks.push(root.clone());
        blocks.push(structure);
        blocks.push(body);
        blocks.extend(chunks);
        blocks.push(meta);
        blocks.push(commit);

        DatasetVersion {
            root: root.id(),
            blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(body: &[u8], message: &str) -> DatasetVersion {
        VersionBuilder::new()
            .structure(b"csv".to_vec())
            .body(body.to_vec())
            .meta(b"title: cities".to_vec())
            .commit(message.as_bytes().to_vec())
            .chunk_size(4)
            .build()
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = sample(b"0123456789ab", "v1");
        let b = sample(b"0123456789ab", "v1");
        assert_eq!(a.root(), b.root());
        // root + structure + body node + 3 chunks + meta + commit
        assert_eq!(a.blocks().len(), 8);
    }

    #[test]
    fn test_root_links_components_in_order() {
        let v = sample(b"abcdefgh", "v1");
        let root = v.blocks()[0].as_node().unwrap();
        let names: Vec<&str> = root.links.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, COMPONENTS);
    }

    #[test]
    fn test_versions_share_body_chunks() {
        let v1 = sample(b"abcdefgh", "v1");
        let v2 = sample(b"abcdefgh", "v2");
        assert_ne!(v1.root(), v2.root());

        let ids1: std::collections::HashSet<_> = v1.blocks().iter().map(|b| b.id()).collect();
        let fresh: Vec<_> = v2
            .blocks()
            .iter()
            .filter(|b| !ids1.contains(&b.id()))
            .collect();
        // new root and new commit block only
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn test_previous_only_changes_root() {
        let v1 = sample(b"abcdefgh", "v1");
        let v2 = VersionBuilder::new()
            .structure(b"csv".to_vec())
            .body(b"abcdefgh".to_vec())
            .meta(b"title: cities".to_vec())
            .commit(b"v1".to_vec())
            .chunk_size(4)
            .previous(v1.root())
            .build();

        assert_eq!(v2.previous(), Some(v1.root()));
        assert_eq!(v1.previous(), None);
        let ids1: std::collections::HashSet<_> = v1.blocks().iter().map(|b| b.id()).collect();
        let fresh = v2.blocks().iter().filter(|b| !ids1.contains(&b.id())).count();
        assert_eq!(fresh, 1);
    }

    #[test]
    fn test_empty_body() {
        let v = VersionBuilder::new().build();
        let body = v.blocks()[2].as_node().unwrap();
        assert!(body.links.is_empty());
    }

    #[test]
    fn test_total_size_counts_shared_once() {
        // structure, meta and commit are all empty raw blocks with the same id
        let v = VersionBuilder::new().body(b"x".to_vec()).build();
        let distinct: std::collections::HashSet<_> = v.blocks().iter().map(|b| b.id()).collect();
        assert!(distinct.len() < v.blocks().len());
        let expected: u64 = v
            .blocks()
            .iter()
            .filter(|b| distinct.contains(&b.id()))
            .map(|b| (b.id(), b.size()))
            .collect::<std::collections::HashMap<_, _>>()
            .values()
            .sum();
        assert_eq!(v.total_size(), expected);
    }
}
