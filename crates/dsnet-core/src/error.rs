//! Error types for dsnet core.

use thiserror::Error;

use crate::types::{BlockId, EntryId};

/// Errors raised while encoding, decoding or signing core structures.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("block hash mismatch: claimed {claimed:?}, actual {actual:?}")]
    BlockHashMismatch { claimed: BlockId, actual: BlockId },

    #[error("unknown block codec: {0:#04x}")]
    UnknownCodec(u8),

    #[error("malformed block: {0}")]
    MalformedBlock(String),

    #[error("malformed entry: {0}")]
    MalformedEntry(String),

    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("invalid ref {input:?}: {reason}")]
    InvalidRef { input: String, reason: String },

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for log entry structure and signatures.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("signature verification failed")]
    SignatureFailed,

    #[error("payload hash does not match header")]
    PayloadHashMismatch,

    #[error("unsupported entry version: {0}")]
    UnsupportedVersion(u8),

    #[error("init entry must not have a parent")]
    InitWithParent,

    #[error("{0:?} entry requires a parent")]
    MissingParent(crate::entry::OpType),

    #[error("init entry dataset id does not match its payload")]
    DatasetIdMismatch,

    #[error("entry {entry:?} has parent {parent:?} from another dataset")]
    ForeignParent { entry: EntryId, parent: EntryId },

    #[error("payload does not decode for op: {0}")]
    BadPayload(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidSignature | CoreError::InvalidPublicKey => {
                ValidationError::SignatureFailed
            }
            other => ValidationError::BadPayload(other.to_string()),
        }
    }
}
