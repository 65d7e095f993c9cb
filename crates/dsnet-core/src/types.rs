//! Strong type definitions for dsnet.
//!
//! Every identifier is a 32-byte newtype so a block hash can never be passed
//! where a log entry hash is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::PublicKey;

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            /// The all-zero identifier (sentinel).
            pub const ZERO: Self = Self([0u8; 32]);
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; 32] = slice.try_into()?;
                Ok(Self(arr))
            }
        }
    };
}

hash_id!(
    /// Content address of a block: `blake3(block_bytes)`.
    ///
    /// The root block id of a dataset version doubles as the version's path.
    BlockId,
    "BlockId"
);

hash_id!(
    /// Content address of a log entry: `blake3(canonical_entry_bytes)`.
    EntryId,
    "EntryId"
);

hash_id!(
    /// Identifier of a dataset lineage, fixed at `Init` time.
    ///
    /// Renames never change it, so every author's oplog for the dataset
    /// shares one lineage key.
    DatasetId,
    "DatasetId"
);

/// Prefix used when rendering a version path.
pub const PATH_PREFIX: &str = "/dsnet/";

impl BlockId {
    /// Hash block bytes into their content address.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Render as a version path (`/dsnet/<hex>`).
    pub fn to_path(&self) -> String {
        format!("{}{}", PATH_PREFIX, self.to_hex())
    }
}

impl FromStr for BlockId {
    type Err = hex::FromHexError;

    /// Accepts either bare hex or a `/dsnet/<hex>` path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.strip_prefix(PATH_PREFIX).unwrap_or(s))
    }
}

impl DatasetId {
    /// Derive the lineage id from the data recorded in the `Init` entry.
    pub fn derive(owner: &PublicKey, username: &str, name: &str, created_at: i64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"dsnet-dataset-v0:");
        hasher.update(owner.as_bytes());
        hasher.update(b":");
        hasher.update(username.as_bytes());
        hasher.update(b"/");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(&created_at.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}
