//! Push and pull between nodes on an in-memory network.
//!
//! Covers block-level dedup, idempotent completion, integrity under
//! corruption, transport retry, the head compare-and-swap and the push
//! policy as applied to history and finalize.

use std::time::Duration;

use dsnet::dsync::{DsyncError, DsyncSession, PushRequest, RejectReason};
use dsnet::logbook::{logsync, LogbookError, LogsyncRequest};
use dsnet::store::RefStore;
use dsnet::transport::memory::Fault;
use dsnet::{NodeError, Ref, RefRequest, RemoteClient, RemoteError, RemoteRequest};
use dsnet_testkit::fixtures::{fast_retry, node_config, v1, v2, version_with_body, TestNet};
use dsnet_testkit::{init_tracing, keypair};

fn cities() -> Ref {
    Ref::new("alice", "cities")
}

#[tokio::test]
async fn test_first_push_sends_every_block() {
    init_tracing();
    let net = TestNet::new();
    let hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let v1 = v1();
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();

    let report = alice.push("hub", &cities()).await.unwrap();
    assert_eq!(report.root, v1.root());
    assert_eq!(report.transferred, 10);
    assert_eq!(report.committed, 10);
    assert_eq!(report.prior_head, None);
    assert!(report.logsync.converged);
    assert_eq!(net.network.request_count("hub", "put_block").await, 10);

    let resolved = hub.resolve(&cities()).await.unwrap();
    assert_eq!(resolved.dataset, dataset);
    assert_eq!(resolved.path, v1.root());
    assert_eq!(hub.status().await.unwrap().blocks, 10);
}

#[tokio::test]
async fn test_incremental_push_sends_only_the_new_root() {
    let net = TestNet::new();
    let hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let v1 = v1();
    let v2 = v2(&v1);
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();

    alice.commit_version(&dataset, &v2, "touch").await.unwrap();
    let report = alice.push("hub", &cities()).await.unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(report.committed, 1);
    assert_eq!(report.prior_head, Some(v1.root()));
    assert_eq!(net.network.request_count("hub", "put_block").await, 11);

    assert_eq!(hub.resolve(&cities()).await.unwrap().path, v2.root());
    assert_eq!(hub.status().await.unwrap().blocks, 11);
}

#[tokio::test]
async fn test_lost_complete_reply_is_retried_idempotently() {
    let net = TestNet::new();
    let hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let v1 = v1();
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();

    net.network
        .inject("hub", Fault::DropReplies { kind: "complete", count: 1 })
        .await;
    let report = alice.push("hub", &cities()).await.unwrap();

    // The first reply was lost after the hub committed; the retry replays it.
    assert_eq!(net.network.request_count("hub", "complete").await, 2);
    assert_eq!(report.committed, 10);
    assert_eq!(hub.status().await.unwrap().blocks, 10);
    assert_eq!(hub.resolve(&cities()).await.unwrap().path, v1.root());
}

#[tokio::test]
async fn test_corrupted_push_writes_nothing() {
    let net = TestNet::new();
    let hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1(), "initial import").await.unwrap();

    net.network.inject("hub", Fault::CorruptBlocks).await;
    let err = alice.push("hub", &cities()).await.unwrap_err();
    assert!(
        matches!(err, NodeError::Dsync(DsyncError::HashMismatch { .. })),
        "unexpected error: {err}"
    );

    // A failed session stops at the first bad block.
    assert_eq!(net.network.request_count("hub", "put_block").await, 1);
    assert_eq!(hub.status().await.unwrap().blocks, 0);
    assert!(hub.resolve(&cities()).await.is_err());
}

#[tokio::test]
async fn test_corrupted_pull_writes_nothing() {
    let net = TestNet::new();
    let _hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;
    let bob = net.peer("bob", 2, &["hub"]).await;

    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1(), "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();

    net.network.inject("hub", Fault::CorruptBlocks).await;
    let err = bob.pull("hub", &cities()).await.unwrap_err();
    assert!(
        matches!(err, NodeError::Dsync(DsyncError::HashMismatch { .. })),
        "unexpected error: {err}"
    );
    assert_eq!(bob.status().await.unwrap().blocks, 0);

    net.network.heal("hub").await;
    let report = bob.pull("hub", &cities()).await.unwrap();
    assert_eq!(report.transferred, 10);
}

#[tokio::test]
async fn test_pull_fetches_version_and_history() {
    let net = TestNet::new();
    let _hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;
    let bob = net.peer("bob", 2, &["hub"]).await;

    let v1 = v1();
    let v2 = v2(&v1);
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();

    let report = bob.pull("hub", &cities()).await.unwrap();
    assert_eq!(report.dataset, dataset);
    assert_eq!(report.root, v1.root());
    assert_eq!(report.transferred, 10);
    assert_eq!(report.committed, 10);
    assert_eq!(report.logsync.pulled.applied.len(), 2);

    let lineage = bob.logbook().lineage(&dataset).await.unwrap();
    assert_eq!(lineage.owner, alice.public_key());
    assert_eq!(bob.resolve(&cities()).await.unwrap().path, v1.root());

    // Byte-identical manifests on both peers
    let ours = bob.manifest(&cities()).await.unwrap();
    let theirs = alice.manifest(&cities()).await.unwrap();
    assert_eq!(ours.to_canonical_bytes(), theirs.to_canonical_bytes());

    alice.commit_version(&dataset, &v2, "touch").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();
    let report = bob.pull("hub", &cities()).await.unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(bob.resolve(&cities()).await.unwrap().path, v2.root());
}

#[tokio::test]
async fn test_pull_of_pinned_older_version() {
    let net = TestNet::new();
    let _hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;
    let bob = net.peer("bob", 2, &["hub"]).await;

    let v1 = v1();
    let edited = version_with_body(b"oslo;0");
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();
    alice.commit_version(&dataset, &edited, "edit").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();

    let report = bob.pull("hub", &cities().at(v1.root())).await.unwrap();
    assert_eq!(report.root, v1.root());
    assert_eq!(report.transferred, 10);
}

#[tokio::test]
async fn test_dropped_requests_are_retried() {
    let net = TestNet::new();
    let _hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;
    let bob = net.peer("bob", 2, &["hub"]).await;

    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1(), "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();

    // fast_retry allows three attempts
    net.network.inject("hub", Fault::DropRequests(2)).await;
    let report = bob.pull("hub", &cities()).await.unwrap();
    assert_eq!(report.transferred, 10);
    assert_eq!(net.network.request_count("hub", "resolve").await, 3);

    net.network.inject("hub", Fault::DropRequests(3)).await;
    let err = bob.remote_status("hub", &cities()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, NodeError::Remote(RemoteError::Transport(_))));
}

#[tokio::test(start_paused = true)]
async fn test_slow_remote_times_out() {
    let net = TestNet::new();
    let _hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    net.network.inject("hub", Fault::Delay(Duration::from_secs(60))).await;
    let err = alice.remote_status("hub", &cities()).await.unwrap_err();
    assert!(matches!(err, NodeError::Remote(RemoteError::Timeout(_))));
    assert_eq!(net.network.request_count("hub", "resolve").await, 3);
}

#[tokio::test]
async fn test_size_policy_rejects_push() {
    let net = TestNet::new();
    let mut config = node_config("hub", &[]);
    config.policy.max_payload_bytes = Some(64);
    let hub = net.node("hub", config, keypair(9)).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1(), "initial import").await.unwrap();

    let err = alice.push("hub", &cities()).await.unwrap_err();
    match err {
        NodeError::Dsync(DsyncError::Rejected(RejectReason::SizePolicy { limit, size })) => {
            assert_eq!(limit, 64);
            assert!(size > limit);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(net.network.request_count("hub", "put_block").await, 0);
    assert_eq!(hub.status().await.unwrap().blocks, 0);
}

#[tokio::test]
async fn test_unknown_remote() {
    let net = TestNet::new();
    let alice = net.peer("alice", 1, &[]).await;
    let err = alice.push("nowhere", &cities()).await.unwrap_err();
    assert!(matches!(err, NodeError::UnknownRemote(ref name) if name == "nowhere"));
}

#[tokio::test]
async fn test_concurrent_finalize_conflicts() {
    let net = TestNet::new();
    let hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let v1 = v1();
    let v2 = v2(&v1);
    let v3 = version_with_body(b"oslo;0");
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();
    alice.commit_version(&dataset, &v2, "touch").await.unwrap();
    alice.commit_version(&dataset, &v3, "edit").await.unwrap();

    let transport = net.network.transport(Duration::from_secs(5));
    let client = RemoteClient::new(&transport, "hub", "hub", fast_retry());

    // Both sessions open against the same prior head.
    let mut sessions = Vec::new();
    for version in [&v2, &v3] {
        let manifest = alice.manifest(&cities().at(version.root())).await.unwrap();
        let request = PushRequest {
            dataset,
            username: "alice".into(),
            name: "cities".into(),
            manifest,
        };
        let session = DsyncSession::push(alice.store().as_ref(), &client, "hub", request, fast_retry());
        sessions.push(session);
    }
    let mut outcomes = Vec::new();
    for session in sessions {
        outcomes.push(session.run().await.unwrap());
    }
    assert_eq!(outcomes[0].prior_head, Some(v1.root()));
    assert_eq!(outcomes[1].prior_head, Some(v1.root()));

    logsync::sync(alice.logbook().as_ref(), &client, dataset).await.unwrap();

    let first = outcomes[0].session_id.unwrap();
    let second = outcomes[1].session_id.unwrap();
    client.refs(RefRequest::Finalize { session_id: first }).await.unwrap();
    let err = client
        .refs(RefRequest::Finalize { session_id: second })
        .await
        .unwrap_err();
    match err {
        RemoteError::HeadConflict { expected, actual, .. } => {
            assert_eq!(expected, Some(v1.root()));
            assert_eq!(actual, Some(v2.root()));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Finalizing the winner again changes nothing.
    client.refs(RefRequest::Finalize { session_id: first }).await.unwrap();
    assert_eq!(hub.resolve(&cities()).await.unwrap().path, v2.root());
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_bounds_each_call() {
    let net = TestNet::new();
    let _hub = net.peer("hub", 9, &[]).await;
    let mut config = node_config("alice", &["hub"]);
    config.sync.request_timeout_ms = 200;
    let alice = net.node("alice", config, keypair(1)).await;

    net.network.inject("hub", Fault::Delay(Duration::from_secs(2))).await;
    let started = tokio::time::Instant::now();
    let err = alice.remote_status("hub", &cities()).await.unwrap_err();
    assert!(matches!(err, NodeError::Remote(RemoteError::Timeout(_))));
    assert_eq!(net.network.request_count("hub", "resolve").await, 3);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_pull_does_not_clobber_a_local_commit() {
    let net = TestNet::new();
    let _hub = net.peer("hub", 9, &[]).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let v1 = v1();
    let v2 = v2(&v1);
    let v3 = version_with_body(b"oslo;0");
    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1, "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();
    alice.commit_version(&dataset, &v2, "touch").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();

    // The pull stalls on the hub while a local commit lands.
    net.network.inject("hub", Fault::Delay(Duration::from_secs(1))).await;
    let pull = {
        let alice = alice.clone();
        let pinned = cities().at(v1.root());
        tokio::spawn(async move { alice.pull("hub", &pinned).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    alice.commit_version(&dataset, &v3, "edit").await.unwrap();

    match pull.await.unwrap().unwrap_err() {
        NodeError::Logbook(LogbookError::HeadConflict { expected, actual, .. }) => {
            assert_eq!(expected, Some(v2.root()));
            assert_eq!(actual, Some(v3.root()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(alice.resolve(&cities()).await.unwrap().path, v3.root());
}

#[tokio::test]
async fn test_disabled_hub_refuses_pushed_history() {
    let net = TestNet::new();
    let mut config = node_config("hub", &[]);
    config.policy.enabled = false;
    let hub = net.node("hub", config, keypair(9)).await;
    let alice = net.peer("alice", 1, &["hub"]).await;

    let dataset = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&dataset, &v1(), "initial import").await.unwrap();

    let transport = net.network.transport(Duration::from_secs(5));
    let client = RemoteClient::new(&transport, "hub", "hub", fast_retry());
    let entries = alice.logbook().entries(&dataset).await.unwrap();
    let err = client
        .call(RemoteRequest::Logsync(LogsyncRequest::Push { dataset, entries }))
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::Rejected(RejectReason::Disabled));

    assert!(hub.logbook().lineage(&dataset).await.is_none());
    assert!(hub.resolve(&cities()).await.is_err());
    assert!(hub.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_allow_list_covers_pushed_history() {
    let net = TestNet::new();
    let mut config = node_config("hub", &[]);
    config.policy.allow_list = Some(vec!["alice/cities".into()]);
    let hub = net.node("hub", config, keypair(9)).await;
    let alice = net.peer("alice", 1, &["hub"]).await;
    let bob = net.peer("bob", 2, &["hub"]).await;

    let transport = net.network.transport(Duration::from_secs(5));
    let client = RemoteClient::new(&transport, "hub", "hub", fast_retry());

    let theirs = bob.init_dataset("cities").await.unwrap();
    bob.commit_version(&theirs, &v1(), "initial import").await.unwrap();
    let entries = bob.logbook().entries(&theirs).await.unwrap();
    let err = client
        .call(RemoteRequest::Logsync(LogsyncRequest::Push { dataset: theirs, entries }))
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::Rejected(RejectReason::NotAllowed));
    assert!(hub.logbook().lineage(&theirs).await.is_none());

    let ours = alice.init_dataset("cities").await.unwrap();
    alice.commit_version(&ours, &v1(), "initial import").await.unwrap();
    alice.push("hub", &cities()).await.unwrap();

    // A rename to a name outside the list is refused too.
    alice.rename_dataset(&ours, "towns").await.unwrap();
    let entries = alice.logbook().entries(&ours).await.unwrap();
    let err = client
        .call(RemoteRequest::Logsync(LogsyncRequest::Push { dataset: ours, entries }))
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::Rejected(RejectReason::NotAllowed));
    assert_eq!(hub.logbook().lineage(&ours).await.unwrap().name, "cities");
    assert_eq!(hub.resolve(&cities()).await.unwrap().dataset, ours);
}

#[tokio::test]
async fn test_push_under_another_owner_is_not_finalized() {
    let net = TestNet::new();
    let mut config = node_config("hub", &[]);
    config.policy.allow_list = Some(vec!["alice".into()]);
    let hub = net.node("hub", config, keypair(9)).await;
    let bob = net.peer("bob", 2, &["hub"]).await;

    let dataset = bob.init_dataset("cities").await.unwrap();
    bob.commit_version(&dataset, &v1(), "initial import").await.unwrap();
    let manifest = bob.manifest(&Ref::new("bob", "cities")).await.unwrap();
    let forged = PushRequest {
        dataset,
        username: "alice".into(),
        name: "cities".into(),
        manifest,
    };

    let transport = net.network.transport(Duration::from_secs(5));
    let client = RemoteClient::new(&transport, "hub", "hub", fast_retry());
    let outcome = DsyncSession::push(bob.store().as_ref(), &client, "hub", forged.clone(), fast_retry())
        .run()
        .await
        .unwrap();

    // The hub learns the real owner before finalize.
    let entries = bob.logbook().entries(&dataset).await.unwrap();
    hub.logbook().merge_foreign(entries).await.unwrap();

    let session_id = outcome.session_id.unwrap();
    let err = client
        .refs(RefRequest::Finalize { session_id })
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::Rejected(RejectReason::NotAllowed));
    assert_eq!(hub.store().get_head(&dataset).await.unwrap(), None);
    assert!(hub.resolve(&cities()).await.is_err());

    // Once the lineage is known the claim is refused at negotiation.
    let err = DsyncSession::push(bob.store().as_ref(), &client, "hub", forged, fast_retry())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, DsyncError::Rejected(RejectReason::NotAllowed)));
}
