//! Manifests: the ordered block list of one dataset version.
//!
//! A manifest is derived, never stored. Order is a depth-first pre-order
//! walk from the root following links in link order, each block listed once
//! at first visit. The encoded form is canonical CBOR, so any two peers that
//! hold the same DAG produce byte-identical manifests.

use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::canonical::{decode_canonical, encode_value, key, MapReader};
use crate::error::CoreError;
use crate::types::BlockId;

/// One manifest row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: BlockId,
    pub size: u64,
}

/// Ordered `(BlockId, size)` list plus the root path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub root: BlockId,
    pub entries: Vec<ManifestEntry>,
}

mod keys {
    pub const ROOT: u64 = 0;
    pub const ENTRIES: u64 = 1;
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all block sizes.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Block ids in manifest order.
    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn size_of(&self, id: &BlockId) -> Option<u64> {
        self.entries.iter().find(|e| &e.id == id).map(|e| e.size)
    }

    /// Canonical bytes. Entries are encoded as `[id, size]` pairs.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let entries = self
            .entries
            .iter()
            .map(|e| {
                Value::Array(vec![
                    Value::Bytes(e.id.0.to_vec()),
                    Value::Integer(e.size.into()),
                ])
            })
            .collect();
        encode_value(&Value::Map(vec![
            (key(keys::ROOT), Value::Bytes(self.root.0.to_vec())),
            (key(keys::ENTRIES), Value::Array(entries)),
        ]))
    }

    /// Decode canonical bytes. Duplicate entries are rejected.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let value =
            decode_canonical(bytes).map_err(|e| CoreError::MalformedManifest(e.to_string()))?;
        let map = MapReader::new("manifest", &value)?;
        let root = BlockId(map.bytes32(keys::ROOT, "root")?);

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for item in map.array(keys::ENTRIES, "entries")? {
            let pair = match item {
                Value::Array(pair) if pair.len() == 2 => pair,
                _ => return Err(CoreError::MalformedManifest("entry must be [id, size]".into())),
            };
            let id = match &pair[0] {
                Value::Bytes(b) => BlockId::try_from(b.as_slice())
                    .map_err(|_| CoreError::MalformedManifest("id must be 32 bytes".into()))?,
                _ => return Err(CoreError::MalformedManifest("id must be bytes".into())),
            };
            let size = match &pair[1] {
                Value::Integer(i) => u64::try_from(i128::from(*i))
                    .map_err(|_| CoreError::MalformedManifest("size out of range".into()))?,
                _ => return Err(CoreError::MalformedManifest("size must be integer".into())),
            };
            if !seen.insert(id) {
                return Err(CoreError::MalformedManifest(format!("duplicate block {}", id)));
            }
            entries.push(ManifestEntry { id, size });
        }

        if entries.first().map(|e| e.id) != Some(root) {
            return Err(CoreError::MalformedManifest("first entry must be the root".into()));
        }
        Ok(Self { root, entries })
    }
}

/// Pre-flight summary of a version DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagInfo {
    pub manifest: Manifest,
    /// Component label to manifest index for the root's named links.
    pub labels: BTreeMap<String, usize>,
    pub total_size: u64,
}
