//! Log merge convergence across arrival orders and across nodes.

use std::sync::Arc;

use proptest::prelude::*;

use dsnet::core::{BlockId, EntryBuilder, LogEntry};
use dsnet::logbook::{logsync, Logbook};
use dsnet::store::MemoryStore;
use dsnet::Ref;
use dsnet_testkit::fixtures::{v1, v2, version_with_body, TestNet};
use dsnet_testkit::generators::{lineage_from_params, LineageParams};
use dsnet_testkit::keypair;

async fn logbook() -> Logbook<MemoryStore> {
    Logbook::open(Arc::new(MemoryStore::new())).await.unwrap()
}

fn arrivals() -> impl Strategy<Value = (Vec<LogEntry>, Vec<LogEntry>, usize)> {
    any::<LineageParams>().prop_flat_map(|params| {
        let entries = lineage_from_params(&params);
        (Just(entries.clone()), Just(entries).prop_shuffle(), 1usize..=4)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_any_arrival_order_converges((ordered, shuffled, batch) in arrivals()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let reference = logbook().await;
            reference.merge_foreign(ordered.clone()).await.unwrap();

            let book = logbook().await;
            for chunk in shuffled.chunks(batch) {
                book.merge_foreign(chunk.to_vec()).await.unwrap();
            }

            let dataset = ordered[0].dataset();
            assert!(book.dangling().await.is_empty());
            assert_eq!(book.entries(&dataset).await.unwrap().len(), ordered.len());
            assert_eq!(book.lineage(&dataset).await, reference.lineage(&dataset).await);
            assert_eq!(
                logsync::state_hash(&book, &dataset).await.unwrap(),
                logsync::state_hash(&reference, &dataset).await.unwrap()
            );

            let replay = book.merge_foreign(shuffled).await.unwrap();
            assert!(!replay.changed());
            assert_eq!(replay.duplicates.len(), ordered.len());
        });
    }
}

#[tokio::test]
async fn test_child_before_parent_is_buffered() {
    let kp = keypair(1);
    let a = EntryBuilder::init("alice", "cities").timestamp(1_000).sign(&kp);
    let b = EntryBuilder::commit(a.dataset(), a.compute_id(), BlockId::of(b"v1"), "v1")
        .timestamp(2_000)
        .sign(&kp);
    let c = EntryBuilder::commit(a.dataset(), b.compute_id(), BlockId::of(b"v2"), "v2")
        .timestamp(3_000)
        .sign(&kp);

    let book = logbook().await;
    let report = book.merge_foreign(vec![c.clone()]).await.unwrap();
    assert_eq!(report.buffered, vec![c.compute_id()]);
    assert!(book.lineage(&a.dataset()).await.is_none());

    let report = book.merge_foreign(vec![a.clone()]).await.unwrap();
    assert_eq!(report.applied, vec![a.compute_id()]);
    assert_eq!(book.dangling().await, vec![c.clone()]);

    let report = book.merge_foreign(vec![b.clone()]).await.unwrap();
    assert_eq!(report.applied, vec![b.compute_id(), c.compute_id()]);
    assert!(book.dangling().await.is_empty());

    let lineage = book.lineage(&a.dataset()).await.unwrap();
    assert_eq!(lineage.commits, vec![BlockId::of(b"v1"), BlockId::of(b"v2")]);
    assert_eq!(lineage.latest, c.compute_id());
}

#[tokio::test]
async fn test_dangling_entries_show_in_status() {
    let net = TestNet::new();
    let node = net.peer("alice", 1, &[]).await;

    let kp = keypair(7);
    let a = EntryBuilder::init("carol", "towns").timestamp(1_000).sign(&kp);
    let b = EntryBuilder::commit(a.dataset(), a.compute_id(), BlockId::of(b"v1"), "v1")
        .timestamp(2_000)
        .sign(&kp);

    node.logbook().merge_foreign(vec![b]).await.unwrap();
    assert_eq!(node.status().await.unwrap().dangling_entries, 1);

    node.logbook().merge_foreign(vec![a]).await.unwrap();
    let status = node.status().await.unwrap();
    assert_eq!(status.dangling_entries, 0);
    assert_eq!(status.datasets, 1);
}

#[tokio::test]
async fn test_two_authors_converge_through_a_hub() {
    let net = TestNet::new();
    let hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;
    let bob = net.peer("bob", 2, &["hub"]).await;
    let cities = Ref::new("alice", "cities");

    let v1 = v1();
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();
    alice.push("hub", &cities).await.unwrap();
    bob.pull("hub", &cities).await.unwrap();

    // Concurrent commits on top of the same entry, one per author.
    let ours = version_with_body(b"oslo;0");
    let theirs = v2(&v1);
    alice.commit_version(&dataset, &ours, "alice edit").await.unwrap();
    bob.commit_version(&dataset, &theirs, "bob touch").await.unwrap();

    bob.push("hub", &cities).await.unwrap();
    alice.push("hub", &cities).await.unwrap();
    let report = alice.pull("hub", &cities).await.unwrap();
    assert!(report.logsync.converged);
    bob.pull("hub", &cities).await.unwrap();

    let expected = logsync::state_hash(hub.logbook().as_ref(), &dataset).await.unwrap();
    assert!(expected.is_some());
    assert_eq!(logsync::state_hash(alice.logbook().as_ref(), &dataset).await.unwrap(), expected);
    assert_eq!(logsync::state_hash(bob.logbook().as_ref(), &dataset).await.unwrap(), expected);

    for node in [&hub, &alice, &bob] {
        assert!(node.logbook().has_commit(&dataset, &ours.root()).await);
        assert!(node.logbook().has_commit(&dataset, &theirs.root()).await);
        assert_eq!(node.logbook().author_heads(&dataset).await.len(), 2);
        assert!(node.logbook().forks(&dataset).await.unwrap().is_empty());
    }

    // The hub's head is the last push to finalize.
    assert_eq!(hub.resolve(&cities).await.unwrap().path, ours.root());
    assert_eq!(bob.resolve(&cities).await.unwrap().path, ours.root());
}
