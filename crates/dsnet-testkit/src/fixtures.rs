//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: deterministic keys, the
//! reference `v1`/`v2` dataset versions, and nodes wired to a shared
//! in-memory network.

use std::sync::Arc;
use std::time::Duration;

use dsnet::transport::memory::MemoryNetwork;
use dsnet::{Node, NodeConfig, RetryPolicy};
use dsnet_core::{DatasetVersion, Keypair, VersionBuilder};
use dsnet_store::MemoryStore;

/// Body of the reference version: five distinct 8-byte chunks.
pub const BODY: &[u8] = b"berlin;3moscow;1tokyo;14paris;02lagos;15";

/// Chunk size that splits [`BODY`] into five chunks.
pub const CHUNK_SIZE: usize = 8;

/// Deterministic keypair for party `n`.
pub fn keypair(n: u8) -> Keypair {
    let mut seed = [0u8; 32];
    seed[0] = n;
    seed[31] = 0x5a;
    Keypair::from_seed(&seed)
}

/// Create multiple keypairs for multi-party tests.
pub fn multi_party_keypairs(count: usize) -> Vec<Keypair> {
    (0..count).map(|i| keypair(i as u8)).collect()
}

fn reference_builder() -> VersionBuilder {
    VersionBuilder::new()
        .structure(b"format: csv".to_vec())
        .body(BODY.to_vec())
        .meta(b"title: world cities".to_vec())
        .commit(b"initial import".to_vec())
        .chunk_size(CHUNK_SIZE)
}

/// The reference first version: ten distinct blocks.
///
/// Root, structure, body node, five body chunks, meta and commit.
pub fn v1() -> DatasetVersion {
    reference_builder().build()
}

/// A successor of `previous` with identical components.
///
/// Only the root differs, so against `v1` it shares nine blocks.
pub fn v2(previous: &DatasetVersion) -> DatasetVersion {
    reference_builder().previous(previous.root()).build()
}

/// A version with its own body, sharing structure and meta with [`v1`].
pub fn version_with_body(body: &[u8]) -> DatasetVersion {
    VersionBuilder::new()
        .structure(b"format: csv".to_vec())
        .body(body.to_vec())
        .meta(b"title: world cities".to_vec())
        .commit(b"edit".to_vec())
        .chunk_size(CHUNK_SIZE)
        .build()
}

/// Retry fast so failure tests don't wait on real backoff.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

/// A config for `username` that reaches each of `remotes` at the address
/// of the same name.
pub fn node_config(username: &str, remotes: &[&str]) -> NodeConfig {
    let mut config = NodeConfig {
        username: username.to_string(),
        ..NodeConfig::default()
    };
    config.sync.retry = fast_retry();
    for remote in remotes {
        config = config.with_remote(*remote, *remote);
    }
    config
}

/// Nodes on one in-memory network.
pub struct TestNet {
    pub network: Arc<MemoryNetwork>,
    pub request_timeout: Duration,
}

impl TestNet {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Open a memory-backed node serving at `address`.
    pub async fn node(&self, address: &str, config: NodeConfig, keypair: Keypair) -> Arc<Node<MemoryStore>> {
        let transport = Arc::new(self.network.transport(self.request_timeout));
        let node = Node::open(keypair, Arc::new(MemoryStore::new()), config, transport)
            .await
            .expect("open node");
        let node = Arc::new(node);
        self.network.serve(address, node.clone()).await;
        node
    }

    /// A node for `username` at the address of the same name, with
    /// `remotes` configured.
    pub async fn peer(&self, username: &str, seed: u8, remotes: &[&str]) -> Arc<Node<MemoryStore>> {
        self.node(username, node_config(username, remotes), keypair(seed))
            .await
    }
}

impl Default for TestNet {
    fn default() -> Self {
        Self::new()
    }
}
