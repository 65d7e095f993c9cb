//! # dsnet logbook
//!
//! Append-only, hash-linked dataset history and its sync protocol.
//!
//! ## Key Types
//!
//! - [`Logbook`] - Arena of immutable entries with causal merge
//! - [`MergeReport`] - What a merge applied, skipped and buffered
//! - [`LogsyncRequest`] / [`LogsyncResponse`] - Logsync wire messages
//! - [`RefResolver`] - `username/name[@path]` resolution and head CAS
//!
//! ## Design Notes
//!
//! - **Causal application**: an entry is applied only after its parent
//! - **Deterministic order**: concurrent entries apply by `(timestamp, id)`
//! - **Buffered gaps**: entries with missing parents wait across merges
//! - **Forks are evidence**: same-author forks are recorded, never resolved
//! - **CAS heads**: head conflicts are surfaced, never auto-merged

pub mod error;
pub mod logbook;
pub mod logsync;
pub mod merge;
pub mod resolver;

pub use error::{LogbookError, Result};
pub use logbook::{limits, Lineage, Logbook};
pub use logsync::{
    state_hash, LogsyncRemote, LogsyncReport, LogsyncRequest, LogsyncResponse, MergeSummary,
};
pub use merge::{causal_order, MergeReport};
pub use resolver::{RefResolver, ResolvedRef};
