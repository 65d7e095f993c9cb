//! Proptest generators for property-based testing.

use proptest::prelude::*;

use dsnet_core::{BlockId, DatasetVersion, EntryBuilder, Keypair, LogEntry, VersionBuilder};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random BlockId.
pub fn block_id() -> impl Strategy<Value = BlockId> {
    any::<[u8; 32]>().prop_map(BlockId::from_bytes)
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a dataset or user name.
pub fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}".prop_map(String::from)
}

/// Parameters for generating a dataset version.
#[derive(Debug, Clone)]
pub struct VersionParams {
    pub structure: Vec<u8>,
    pub body: Vec<u8>,
    pub meta: Vec<u8>,
    pub commit: Vec<u8>,
    pub chunk_size: usize,
}

impl Arbitrary for VersionParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (payload(32), payload(2048), payload(64), payload(32), 1usize..=512)
            .prop_map(|(structure, body, meta, commit, chunk_size)| VersionParams {
                structure,
                body,
                meta,
                commit,
                chunk_size,
            })
            .boxed()
    }
}

/// Build a version from parameters.
pub fn version_from_params(params: &VersionParams) -> DatasetVersion {
    VersionBuilder::new()
        .structure(params.structure.clone())
        .body(params.body.clone())
        .meta(params.meta.clone())
        .commit(params.commit.clone())
        .chunk_size(params.chunk_size)
        .build()
}

/// Parameters for generating one author's lineage: an init followed by
/// commits, with arbitrary (not necessarily increasing) timestamps.
#[derive(Debug, Clone)]
pub struct LineageParams {
    pub seed: [u8; 32],
    pub username: String,
    pub name: String,
    pub timestamps: Vec<i64>,
}

impl Arbitrary for LineageParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            any::<[u8; 32]>(),
            name(),
            name(),
            prop::collection::vec(0i64..=1_700_000_000_000i64, 1..12),
        )
            .prop_map(|(seed, username, name, timestamps)| LineageParams {
                seed,
                username,
                name,
                timestamps,
            })
            .boxed()
    }
}

/// Build the entries of a lineage, parents first.
///
/// The first timestamp goes to the init entry; each later one to a commit
/// whose path is derived from its position.
pub fn lineage_from_params(params: &LineageParams) -> Vec<LogEntry> {
    let keypair = Keypair::from_seed(&params.seed);
    let mut timestamps = params.timestamps.iter().copied();
    let init = EntryBuilder::init(params.username.clone(), params.name.clone())
        .timestamp(timestamps.next().unwrap_or(0))
        .sign(&keypair);

    let dataset = init.dataset();
    let mut parent = init.compute_id();
    let mut entries = vec![init];
    for (i, ts) in timestamps.enumerate() {
        let path = BlockId::of(format!("version {}", i).as_bytes());
        let entry = EntryBuilder::commit(dataset, parent, path, format!("commit {}", i))
            .timestamp(ts)
            .sign(&keypair);
        parent = entry.compute_id();
        entries.push(entry);
    }
    entries
}
