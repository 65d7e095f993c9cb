//! Golden test vectors for deterministic verification.
//!
//! Block ids and manifest bytes must match bit-for-bit across peers. These
//! vectors pin the block framing, the canonical CBOR of DAG nodes and the
//! canonical CBOR of manifests to fixed hex values.

use dsnet_core::{Block, DagNode, Manifest, ManifestEntry};

/// A golden block: the bytes it is built from and the id they must hash to.
#[derive(Debug, Clone)]
pub struct BlockVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// Full encoded block (codec tag included), hex.
    pub data_hex: &'static str,
    /// Expected BLAKE3 id, hex.
    pub expected_id: &'static str,
}

/// Id of the empty byte string.
pub const EMPTY_HASH: &str = "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262";

/// Id of `Block::raw(b"hello")`.
pub const RAW_HELLO_ID: &str = "d0416d535eed961023fa692b60977a04a89bd5f37d7c03ef08f58fa72e402361";

/// Id of `Block::raw(b"")`.
pub const RAW_EMPTY_ID: &str = "2d3adedff11b61f14c886e35afa036736dcd87a74d27b5c1510225d0f592e213";

/// Encoded node with one link named `data` to `Block::raw(b"hello")`.
pub const NODE_HEX: &str = "01a20081a3006464617461015820d0416d535eed961023fa692b60977a04a89bd5f37d7c03ef08f58fa72e40236102060140";

/// Id of [`NODE_HEX`].
pub const NODE_ID: &str = "77bf63e07cf98f0a9835f1e03b7b02507c42385a5881d00771a833e8bfc42966";

/// Canonical manifest bytes of the DAG rooted at [`NODE_ID`].
pub const MANIFEST_HEX: &str = "a200582077bf63e07cf98f0a9835f1e03b7b02507c42385a5881d00771a833e8bfc42966018282582077bf63e07cf98f0a9835f1e03b7b02507c42385a5881d00771a833e8bfc429661832825820d0416d535eed961023fa692b60977a04a89bd5f37d7c03ef08f58fa72e40236106";

/// BLAKE3 of [`MANIFEST_HEX`].
pub const MANIFEST_HASH: &str = "235f7fad675f73f7f308b71f27dedb4083a61aa393f62571827250bbff95c14c";

/// Get all golden block vectors.
pub fn all_vectors() -> Vec<BlockVector> {
    vec![
        BlockVector {
            name: "raw hello",
            data_hex: "0068656c6c6f",
            expected_id: RAW_HELLO_ID,
        },
        BlockVector {
            name: "raw empty",
            data_hex: "00",
            expected_id: RAW_EMPTY_ID,
        },
        BlockVector {
            name: "node linking raw hello",
            data_hex: NODE_HEX,
            expected_id: NODE_ID,
        },
    ]
}

/// The DAG the node and manifest vectors describe: root first, then leaf.
pub fn reference_dag() -> (Block, Block) {
    let leaf = Block::raw(b"hello");
    let root = DagNode::new().link("data", &leaf).into_block();
    (root, leaf)
}

/// The manifest of [`reference_dag`], built by hand.
pub fn reference_manifest() -> Manifest {
    let (root, leaf) = reference_dag();
    Manifest {
        root: root.id(),
        entries: vec![
            ManifestEntry {
                id: root.id(),
                size: root.size(),
            },
            ManifestEntry {
                id: leaf.id(),
                size: leaf.size(),
            },
        ],
    }
}

/// Check every vector, returning `(name, matches, actual_id)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let data = hex::decode(v.data_hex).unwrap_or_default();
            let actual = Block::from_bytes(data).id().to_hex();
            (v.name.to_string(), actual == v.expected_id, actual)
        })
        .collect()
}
