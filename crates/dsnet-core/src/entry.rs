//! Log entries: signed, hash-linked operation records.
//!
//! Every entry belongs to one dataset lineage and, except for `Init`, names
//! its parent. Entries by one author form an oplog chain; the oplogs of all
//! authors for a lineage compose the logbook DAG.

use bytes::Bytes;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::canonical::{decode_canonical, encode_value, key, MapReader};
use crate::crypto::{Keypair, PublicKey, Signature};
use crate::error::CoreError;
use crate::types::{BlockId, DatasetId, EntryId};

/// The current entry schema version.
pub const ENTRY_VERSION: u8 = 0;

/// The operation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpType {
    /// Creates the lineage. Has no parent.
    Init = 1,
    /// Records a new version path.
    Commit = 2,
    /// Changes the dataset's human name.
    Rename = 3,
    /// Marks the dataset deleted.
    Delete = 4,
}

impl OpType {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Commit),
            3 => Some(Self::Rename),
            4 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Decoded entry payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpPayload {
    Init { username: String, name: String },
    Commit { path: BlockId, message: String },
    Rename { name: String },
    Delete,
}

impl OpPayload {
    pub fn op(&self) -> OpType {
        match self {
            Self::Init { .. } => OpType::Init,
            Self::Commit { .. } => OpType::Commit,
            Self::Rename { .. } => OpType::Rename,
            Self::Delete => OpType::Delete,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let map = match self {
            Self::Init { username, name } => vec![
                (key(0), Value::Text(username.clone())),
                (key(1), Value::Text(name.clone())),
            ],
            Self::Commit { path, message } => vec![
                (key(0), Value::Bytes(path.0.to_vec())),
                (key(1), Value::Text(message.clone())),
            ],
            Self::Rename { name } => vec![(key(0), Value::Text(name.clone()))],
            Self::Delete => Vec::new(),
        };
        encode_value(&Value::Map(map))
    }

    pub fn decode(op: OpType, bytes: &[u8]) -> Result<Self, CoreError> {
        let value = decode_canonical(bytes)?;
        let map = MapReader::new("payload", &value)?;
        Ok(match op {
            OpType::Init => Self::Init {
                username: map.text(0, "username")?.to_string(),
                name: map.text(1, "name")?.to_string(),
            },
            OpType::Commit => Self::Commit {
                path: BlockId(map.bytes32(0, "path")?),
                message: map.text(1, "message")?.to_string(),
            },
            OpType::Rename => Self::Rename {
                name: map.text(0, "name")?.to_string(),
            },
            OpType::Delete => Self::Delete,
        })
    }
}

/// Entry metadata covered by the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Schema version (currently 0).
    pub version: u8,

    pub op: OpType,

    /// Author-claimed timestamp (Unix milliseconds). Untrusted.
    pub timestamp: i64,

    pub author: PublicKey,

    /// Lineage this entry belongs to.
    pub dataset: DatasetId,

    /// Causal predecessor. `None` only for `Init`.
    pub parent: Option<EntryId>,

    /// blake3 of the payload bytes.
    pub payload_hash: [u8; 32],
}

mod keys {
    pub const VERSION: u64 = 0;
    pub const OP: u64 = 1;
    pub const TIMESTAMP: u64 = 2;
    pub const AUTHOR: u64 = 3;
    pub const DATASET: u64 = 4;
    pub const PARENT: u64 = 5;
    pub const PAYLOAD_HASH: u64 = 6;

    pub const HEADER: u64 = 0;
    pub const PAYLOAD: u64 = 1;
    pub const SIGNATURE: u64 = 2;
}

impl EntryHeader {
    fn to_cbor_value(&self) -> Value {
        Value::Map(vec![
            (key(keys::VERSION), Value::Integer(self.version.into())),
            (key(keys::OP), Value::Integer(self.op.to_u8().into())),
            (key(keys::TIMESTAMP), Value::Integer(self.timestamp.into())),
            (key(keys::AUTHOR), Value::Bytes(self.author.0.to_vec())),
            (key(keys::DATASET), Value::Bytes(self.dataset.0.to_vec())),
            (
                key(keys::PARENT),
                match self.parent {
                    Some(p) => Value::Bytes(p.0.to_vec()),
                    None => Value::Null,
                },
            ),
            (key(keys::PAYLOAD_HASH), Value::Bytes(self.payload_hash.to_vec())),
        ])
    }

    fn from_cbor_value(value: &Value) -> Result<Self, CoreError> {
        let map = MapReader::new("header", value)?;
        let version = u8::try_from(map.uint(keys::VERSION, "version")?)
            .map_err(|_| CoreError::MalformedEntry("version out of range".into()))?;
        let op_raw = u8::try_from(map.uint(keys::OP, "op")?)
            .map_err(|_| CoreError::MalformedEntry("op out of range".into()))?;
        let op = OpType::from_u8(op_raw)
            .ok_or_else(|| CoreError::MalformedEntry(format!("unknown op {}", op_raw)))?;
        let timestamp = i64::try_from(map.int(keys::TIMESTAMP, "timestamp")?)
            .map_err(|_| CoreError::MalformedEntry("timestamp out of range".into()))?;

        Ok(Self {
            version,
            op,
            timestamp,
            author: PublicKey(map.bytes32(keys::AUTHOR, "author")?),
            dataset: DatasetId(map.bytes32(keys::DATASET, "dataset")?),
            parent: map.opt_bytes32(keys::PARENT, "parent")?.map(EntryId),
            payload_hash: map.bytes32(keys::PAYLOAD_HASH, "payload_hash")?,
        })
    }

    /// Canonical header bytes, the prefix of the signed message.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        encode_value(&self.to_cbor_value())
    }
}

/// A complete entry: header, payload and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub header: EntryHeader,

    /// Canonical CBOR payload, interpreted according to `header.op`.
    pub payload: Bytes,

    /// Ed25519 signature over `canonical_header || payload`.
    pub signature: Signature,
}

impl LogEntry {
    /// Canonical bytes of the whole entry.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        encode_value(&Value::Map(vec![
            (key(keys::HEADER), self.header.to_cbor_value()),
            (key(keys::PAYLOAD), Value::Bytes(self.payload.to_vec())),
            (key(keys::SIGNATURE), Value::Bytes(self.signature.0.to_vec())),
        ]))
    }

    /// Decode from canonical bytes.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let value = decode_canonical(bytes)?;
        let map = MapReader::new("entry", &value)?;
        let header_value = map
            .get(keys::HEADER)
            .ok_or_else(|| CoreError::MalformedEntry("missing header".into()))?;
        let header = EntryHeader::from_cbor_value(header_value)?;
        let payload = Bytes::copy_from_slice(map.bytes(keys::PAYLOAD, "payload")?);
        let signature: [u8; 64] = map
            .bytes(keys::SIGNATURE, "signature")?
            .try_into()
            .map_err(|_| CoreError::MalformedEntry("signature must be 64 bytes".into()))?;

        Ok(Self {
            header,
            payload,
            signature: Signature(signature),
        })
    }

    /// Compute the entry id (blake3 of canonical bytes).
    pub fn compute_id(&self) -> EntryId {
        EntryId(*blake3::hash(&self.canonical_bytes()).as_bytes())
    }

    /// The message the author signed.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut message = self.header.canonical_bytes();
        message.extend_from_slice(&self.payload);
        message
    }

    pub fn op(&self) -> OpType {
        self.header.op
    }

    pub fn author(&self) -> &PublicKey {
        &self.header.author
    }

    pub fn dataset(&self) -> DatasetId {
        self.header.dataset
    }

    pub fn parent(&self) -> Option<EntryId> {
        self.header.parent
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn decode_payload(&self) -> Result<OpPayload, CoreError> {
        OpPayload::decode(self.header.op, &self.payload)
    }

    /// The version path, for commit entries.
    pub fn commit_path(&self) -> Option<BlockId> {
        match self.decode_payload() {
            Ok(OpPayload::Commit { path, .. }) => Some(path),
            _ => None,
        }
    }
}

/// Builder for signed entries.
pub struct EntryBuilder {
    payload: OpPayload,
    dataset: Option<DatasetId>,
    parent: Option<EntryId>,
    timestamp: i64,
}

impl EntryBuilder {
    /// Start a lineage. The dataset id is derived from the signer, names
    /// and timestamp when the entry is signed.
    pub fn init(username: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            payload: OpPayload::Init {
                username: username.into(),
                name: name.into(),
            },
            dataset: None,
            parent: None,
            timestamp: 0,
        }
    }

    pub fn commit(dataset: DatasetId, parent: EntryId, path: BlockId, message: impl Into<String>) -> Self {
        Self {
            payload: OpPayload::Commit {
                path,
                message: message.into(),
            },
            dataset: Some(dataset),
            parent: Some(parent),
            timestamp: 0,
        }
    }

    pub fn rename(dataset: DatasetId, parent: EntryId, name: impl Into<String>) -> Self {
        Self {
            payload: OpPayload::Rename { name: name.into() },
            dataset: Some(dataset),
            parent: Some(parent),
            timestamp: 0,
        }
    }

    pub fn delete(dataset: DatasetId, parent: EntryId) -> Self {
        Self {
            payload: OpPayload::Delete,
            dataset: Some(dataset),
            parent: Some(parent),
            timestamp: 0,
        }
    }

    /// Set the timestamp.
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.timestamp = ts;
        self
    }

    /// Override the parent.
    pub fn parent(mut self, parent: Option<EntryId>) -> Self {
        self.parent = parent;
        self
    }

    /// Override the dataset id.
    pub fn dataset(mut self, dataset: DatasetId) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Build and sign the entry.
    pub fn sign(self, keypair: &Keypair) -> LogEntry {
        let author = keypair.public_key();
        let dataset = match (&self.dataset, &self.payload) {
            (Some(d), _) => *d,
            (None, OpPayload::Init { username, name }) => {
                DatasetId::derive(&author, username, name, self.timestamp)
            }
            (None, _) => DatasetId::ZERO,
        };

        let payload = Bytes::from(self.payload.encode());
        let header = EntryHeader {
            version: ENTRY_VERSION,
            op: self.payload.op(),
            timestamp: self.timestamp,
            author,
            dataset,
            parent: self.parent,
            payload_hash: *blake3::hash(&payload).as_bytes(),
        };

        let mut message = header.canonical_bytes();
        message.extend_from_slice(&payload);
        let signature = keypair.sign(&message);

        LogEntry {
            header,
            payload,
            signature,
        }
    }
}
