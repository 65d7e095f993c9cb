//! # dsnet core
//!
//! Pure primitives for dsnet: blocks, dataset versions, manifests, log
//! entries, refs and canonicalization.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over content-addressed and signed data structures.
//!
//! ## Key Types
//!
//! - [`Block`] - Immutable content-addressed byte chunk
//! - [`DatasetVersion`] - DAG of blocks rooted at one path
//! - [`Manifest`] - Ordered block list of a version
//! - [`LogEntry`] - Signed, hash-linked operation record
//! - [`Ref`] - `username/name[@path]`
//!
//! ## Canonicalization
//!
//! Nodes, manifests and entries are encoded using deterministic CBOR. See
//! [`canonical`] module.

pub mod block;
pub mod canonical;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod manifest;
pub mod refs;
pub mod types;
pub mod validation;
pub mod version;

pub use block::{Block, Codec, DagNode, Link};
pub use crypto::{Keypair, PublicKey, Signature};
pub use entry::{EntryBuilder, EntryHeader, LogEntry, OpPayload, OpType, ENTRY_VERSION};
pub use error::{CoreError, ValidationError};
pub use manifest::{DagInfo, Manifest, ManifestEntry};
pub use refs::Ref;
pub use types::{BlockId, DatasetId, EntryId, PATH_PREFIX};
pub use validation::{validate_entry, validate_entry_structure};
pub use version::{DatasetVersion, VersionBuilder, COMPONENTS, DEFAULT_CHUNK_SIZE};
