//! Blocks: immutable, content-addressed byte chunks.
//!
//! Every block starts with a one-byte codec tag. Raw leaves carry opaque
//! bytes; DAG nodes carry a canonical CBOR body listing named links to other
//! blocks. A dataset version is the DAG reachable from one root node.

use bytes::Bytes;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::canonical::{decode_canonical, encode_value, key, MapReader};
use crate::error::CoreError;
use crate::types::BlockId;

/// Codec tag stored in the first byte of every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Codec {
    /// Opaque leaf bytes.
    Raw = 0x00,
    /// A [`DagNode`] encoded as canonical CBOR.
    Node = 0x01,
}

impl Codec {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Raw),
            0x01 => Some(Self::Node),
            _ => None,
        }
    }
}

/// A named edge from one node to another block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Label of the edge (component name, or chunk index).
    pub name: String,
    /// Target block.
    pub id: BlockId,
    /// Size in bytes of the target block itself.
    pub size: u64,
}

/// An interior DAG node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DagNode {
    /// Ordered outgoing links. Order is significant for manifests.
    pub links: Vec<Link>,
    /// Inline data carried by the node.
    pub payload: Bytes,
}

mod keys {
    pub const LINKS: u64 = 0;
    pub const PAYLOAD: u64 = 1;

    pub const LINK_NAME: u64 = 0;
    pub const LINK_ID: u64 = 1;
    pub const LINK_SIZE: u64 = 2;
}

impl DagNode {
    /// Create an empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a link to `block`.
    pub fn link(mut self, name: impl Into<String>, block: &Block) -> Self {
        self.links.push(Link {
            name: name.into(),
            id: block.id(),
            size: block.size(),
        });
        self
    }

    /// Set the inline payload.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Find a link by name.
    pub fn find(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name == name)
    }

    fn to_cbor_value(&self) -> Value {
        let links = self
            .links
            .iter()
            .map(|l| {
                Value::Map(vec![
                    (key(keys::LINK_NAME), Value::Text(l.name.clone())),
                    (key(keys::LINK_ID), Value::Bytes(l.id.0.to_vec())),
                    (key(keys::LINK_SIZE), Value::Integer(l.size.into())),
                ])
            })
            .collect();

        Value::Map(vec![
            (key(keys::LINKS), Value::Array(links)),
            (key(keys::PAYLOAD), Value::Bytes(self.payload.to_vec())),
        ])
    }

    fn from_cbor_value(value: &Value) -> Result<Self, CoreError> {
        let map = MapReader::new("node", value)?;
        let mut links = Vec::new();
        for item in map.array(keys::LINKS, "links")? {
            let link = MapReader::new("link", item)?;
            links.push(Link {
                name: link.text(keys::LINK_NAME, "name")?.to_string(),
                id: BlockId(link.bytes32(keys::LINK_ID, "id")?),
                size: link.uint(keys::LINK_SIZE, "size")?,
            });
        }
        let payload = Bytes::copy_from_slice(map.bytes(keys::PAYLOAD, "payload")?);
        Ok(Self { links, payload })
    }

    /// Encode into a block.
    pub fn into_block(self) -> Block {
        let mut data = vec![Codec::Node as u8];
        data.extend_from_slice(&encode_value(&self.to_cbor_value()));
        Block::from_bytes(data)
    }
}

/// An immutable content-addressed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    id: BlockId,
    data: Bytes,
}

impl Block {
    /// Wrap encoded bytes, computing the id.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            id: BlockId::of(&data),
            data,
        }
    }

    /// Build a raw leaf block from payload bytes.
    pub fn raw(payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(Codec::Raw as u8);
        data.extend_from_slice(payload);
        Self::from_bytes(data)
    }

    /// Accept bytes claimed to hash to `claimed`. Fails on mismatch.
    pub fn verified(claimed: BlockId, data: impl Into<Bytes>) -> Result<Self, CoreError> {
        let block = Self::from_bytes(data);
        if block.id != claimed {
            return Err(CoreError::BlockHashMismatch {
                claimed,
                actual: block.id,
            });
        }
        Ok(block)
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Stored size in bytes, codec tag included.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn codec(&self) -> Result<Codec, CoreError> {
        let tag = *self
            .data
            .first()
            .ok_or_else(|| CoreError::MalformedBlock("empty block".into()))?;
        Codec::from_u8(tag).ok_or(CoreError::UnknownCodec(tag))
    }

    /// Payload of a raw leaf.
    pub fn raw_payload(&self) -> Result<&[u8], CoreError> {
        match self.codec()? {
            Codec::Raw => Ok(&self.data[1..]),
            Codec::Node => Err(CoreError::MalformedBlock("expected raw block".into())),
        }
    }

    /// Decode as a DAG node.
    pub fn as_node(&self) -> Result<DagNode, CoreError> {
        match self.codec()? {
            Codec::Node => {
                let value = decode_canonical(&self.data[1..])
                    .map_err(|e| CoreError::MalformedBlock(e.to_string()))?;
                DagNode::from_cbor_value(&value)
            }
            Codec::Raw => Err(CoreError::MalformedBlock("expected node block".into())),
        }
    }

    /// Outgoing links, empty for raw leaves.
    pub fn links(&self) -> Result<Vec<Link>, CoreError> {
        match self.codec()? {
            Codec::Raw => Ok(Vec::new()),
            Codec::Node => Ok(self.as_node()?.links),
        }
    }
}
