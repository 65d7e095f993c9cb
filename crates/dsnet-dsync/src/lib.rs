//! # dsnet dsync
//!
//! Content-addressed transfer of dataset versions between nodes.
//!
//! ## Overview
//!
//! A version is a DAG of blocks. Its manifest lists every block once, in
//! depth-first pre-order. Two peers compare manifests against their stores
//! and move exactly the blocks the receiver lacks.
//!
//! ## Key Properties
//!
//! - **Deterministic**: identical versions produce byte-identical manifests
//! - **Minimal**: only missing blocks cross the wire
//! - **Verified**: every block is hash-checked; the DAG is re-walked before commit
//! - **Atomic**: received blocks reach the store as one unit or not at all
//! - **Idempotent**: `Complete` and re-sent blocks are safe to repeat
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dsnet_dsync::{build_manifest, DsyncSession, PolicyConfig, PushRequest,
//!     RemoteSessionCoordinator, RetryPolicy};
//! use dsnet_store::MemoryStore;
//!
//! async fn example(local: MemoryStore, request: PushRequest) {
//!     let remote = RemoteSessionCoordinator::new(Arc::new(MemoryStore::new()), PolicyConfig::default());
//!     let outcome = DsyncSession::push(&local, &remote, "hub", request, RetryPolicy::default())
//!         .run()
//!         .await
//!         .unwrap();
//!     println!("sent {} blocks", outcome.transferred);
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Pusher                               Remote
//!   |-------- Push(manifest) ---------->|
//!   |<------- Accepted{missing} --------|
//!   |-------- PutBlock x N ------------>|
//!   |-------- Complete ---------------->|
//!   |<------- Completed ----------------|
//! ```

pub mod coordinator;
pub mod error;
pub mod manifest;
pub mod messages;
pub mod policy;
pub mod remote;
pub mod retry;
pub mod session;

pub use coordinator::{RemoteSessionCoordinator, SessionSummary};
pub use error::{DsyncError, Result};
pub use manifest::{build_manifest, dag_info, diff, missing_from_store, reachable, verify_complete};
pub use messages::{
    limits, CompleteReport, Direction, DsyncRequest, DsyncResponse, NegotiateResponse,
    PullRequest, PushRequest, RejectReason, SessionId,
};
pub use policy::PolicyConfig;
pub use remote::DsyncRemote;
pub use retry::{RetryPolicy, Retryable};
pub use session::{DsyncSession, SessionOutcome, SessionState};
