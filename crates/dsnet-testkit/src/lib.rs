//! # dsnet Testkit
//!
//! Testing utilities for dsnet.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: Fixed block ids and manifest bytes that every peer must reproduce
//! - **Generators**: Proptest strategies for versions and log lineages
//! - **Fixtures**: The reference versions and nodes wired to an in-memory network
//!
//! ## Golden Vectors
//!
//! ```rust
//! use dsnet_testkit::vectors::verify_all_vectors;
//!
//! for (name, matches, id) in verify_all_vectors() {
//!     assert!(matches, "{}: {}", name, id);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use dsnet_testkit::generators::{version_from_params, VersionParams};
//!
//! proptest! {
//!     #[test]
//!     fn root_is_deterministic(params: VersionParams) {
//!         let a = version_from_params(&params);
//!         let b = version_from_params(&params);
//!         prop_assert_eq!(a.root(), b.root());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use dsnet_testkit::fixtures::{v1, TestNet};
//!
//! let net = TestNet::new();
//! let alice = net.peer("alice", 1, &["hub"]).await;
//! let hub = net.peer("hub", 2, &[]).await;
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{keypair, multi_party_keypairs, node_config, v1, v2, TestNet};
pub use generators::{lineage_from_params, version_from_params, LineageParams, VersionParams};
pub use vectors::{all_vectors, verify_all_vectors, BlockVector};

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber. Safe to call from every test.
///
/// Honors `RUST_LOG`, defaulting to `debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::DEBUG.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}
