//! # dsnet
//!
//! Peer-to-peer dataset synchronization. A node stores dataset versions as
//! content-addressed block DAGs, keeps each dataset's history in a signed,
//! hash-linked log, and moves both between peers.
//!
//! ## Overview
//!
//! - **Versions**: a root block linking structure, body, meta and commit
//! - **Manifests**: the ordered block list of a version, derived and deterministic
//! - **Dsync**: push and pull that move only the blocks the other side lacks
//! - **Logsync**: causal merge of log entries between peers
//! - **Refs**: `username/name[@path]` resolved through the log, heads moved by CAS
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dsnet::core::{Keypair, Ref, VersionBuilder};
//! use dsnet::store::MemoryStore;
//! use dsnet::transport::memory::MemoryNetwork;
//! use dsnet::{Node, NodeConfig};
//!
//! async fn example() {
//!     let network = MemoryNetwork::new();
//!     let transport = Arc::new(network.transport(Duration::from_secs(30)));
//!
//!     let config = NodeConfig {
//!         username: "alice".into(),
//!         ..NodeConfig::default()
//!     }
//!     .with_remote("hub", "hub.local");
//!     let node = Node::open(Keypair::generate(), Arc::new(MemoryStore::new()), config, transport)
//!         .await
//!         .unwrap();
//!
//!     let dataset = node.init_dataset("cities").await.unwrap();
//!     let version = VersionBuilder::new().body(b"name,pop\n".to_vec()).build();
//!     node.commit_version(&dataset, &version, "first").await.unwrap();
//!
//!     // Send it to the peer serving "hub.local"
//!     node.push("hub", &Ref::new("alice", "cities")).await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `dsnet::core` - Blocks, versions, manifests, log entries, refs
//! - `dsnet::store` - Storage traits, SQLite and in-memory stores
//! - `dsnet::dsync` - Block transfer sessions and the remote coordinator
//! - `dsnet::logbook` - Log arena, logsync and ref resolution

pub mod client;
pub mod config;
pub mod error;
pub mod gc;
pub mod messages;
pub mod node;
pub mod transport;

// Re-export component crates
pub use dsnet_core as core;
pub use dsnet_dsync as dsync;
pub use dsnet_logbook as logbook;
pub use dsnet_store as store;

// Re-export main types for convenience
pub use client::RemoteClient;
pub use config::{GcConfig, NodeConfig, RemoteConfig, SyncConfig};
pub use error::{NodeError, Result};
pub use gc::GcReport;
pub use messages::{RefRequest, RefResponse, RemoteError, RemoteRequest, RemoteResponse};
pub use node::{Node, NodeStatus, PullReport, PushReport};
pub use transport::{RemoteHandler, Transport};

// Re-export commonly used types from the component crates
pub use dsnet_core::{BlockId, DatasetId, DatasetVersion, Keypair, Manifest, Ref, VersionBuilder};
pub use dsnet_dsync::{PolicyConfig, RejectReason, RetryPolicy};
pub use dsnet_logbook::ResolvedRef;
