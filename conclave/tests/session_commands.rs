mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::client::SessionClient;
use conclave::protocol::CommandRequest;
use conclave::protocol::Consistency;
use conclave::protocol::ResponseStatus;
use fixtures::RaftRouter;
use maplit::btreeset;
use memstore::ClientRequest;
use memstore::ClientResponse;

/// Session command semantics test.
///
/// What does this test do?
///
/// - brings a single node cluster online and registers a client session.
/// - submits commands and asserts their results and application to the state machine.
/// - resubmits an already-applied sequence number directly against the server, asserting the
///   cached response is returned without re-applying (exactly-once).
/// - runs a linearizable query against the applied state.
///
/// RUST_LOG=conclave,memstore,session_commands=trace cargo test -p conclave --test session_commands
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_commands() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(conclave::Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.initialize_with(0, btreeset! {0}).await?;
    router.wait_for_log(&btreeset![0], 1, Some(Duration::from_secs(5)), "init").await?;

    tracing::info!("--- registering session");

    let client = SessionClient::builder(router.clone(), router.addresses().await).register().await?;
    assert!(client.session_id() > 0, "session id must be the register entry index");

    tracing::info!("--- submitting commands");

    let first = client.submit(ClientRequest::set("foo", "bar")).await?;
    assert_eq!(first, ClientResponse(None));

    let second = client.submit(ClientRequest::set("foo", "baz")).await?;
    assert_eq!(second, ClientResponse(Some("bar".into())), "a write returns the previous value");

    tracing::info!("--- retrying an applied sequence directly");

    // Replay sequence 2 with a different payload; the server must answer from its result cache
    // and must not re-apply anything.
    let raft = router.get_raft_handle(&0).await?;
    let replay = raft
        .command(CommandRequest {
            session: client.session_id(),
            sequence: 2,
            command: Some(ClientRequest::set("foo", "evil")),
        })
        .await?;
    assert_eq!(replay.status, ResponseStatus::Ok);
    assert_eq!(
        replay.result,
        Some(ClientResponse(Some("bar".into()))),
        "a sequence replay must return the originally cached result"
    );

    let kv = router.get_kv_handle(&0).await?;
    assert_eq!(
        kv.lock().unwrap().get("foo").cloned(),
        Some("baz".into()),
        "a sequence replay must not reach the state machine"
    );

    tracing::info!("--- querying applied state");

    let read = client.query(ClientRequest::get("foo"), Consistency::Linearizable).await?;
    assert_eq!(read, ClientResponse(Some("baz".into())));

    let sequential = client.query(ClientRequest::get("foo"), Consistency::Sequential).await?;
    assert_eq!(sequential, ClientResponse(Some("baz".into())));

    client.close().await?;
    Ok(())
}

/// Command sequence gap test.
///
/// What does this test do?
///
/// - registers a session, then submits commands 1, 2 and 3 concurrently while the test network
///   drops command 2's first frame.
/// - the leader answers command 3 with a sequence gap error, which wakes command 2 for
///   resubmission; the cluster then applies 1, 2, 3 in order.
/// - asserts completions are delivered to the caller in submission order.
///
/// RUST_LOG=conclave,memstore,session_commands=trace cargo test -p conclave --test session_commands
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn command_sequence_gap_resubmission() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(conclave::Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.initialize_with(0, btreeset! {0}).await?;
    router.wait_for_log(&btreeset![0], 1, Some(Duration::from_secs(5)), "init").await?;

    let client = SessionClient::builder(router.clone(), router.addresses().await).register().await?;
    let session = client.session_id();

    tracing::info!("--- dropping the first frames of sequence 2");

    // Three drops outlast the connection layer's own one-pass retry budget, so sequence 2
    // surfaces as a transport failure and enters the submitter's backoff; sequence 3 then trips
    // the leader's gap detection.
    router.drop_command(session, 2, 3);

    // All three commands write the same key, so each response's previous-value proves exactly
    // where in the order its command was applied.
    let mut handles = Vec::new();
    for i in 1..=3u64 {
        let client = client.clone();
        handles.push(tokio::spawn(
            async move { client.submit(ClientRequest::set("x", format!("v{}", i))).await },
        ));
        // Give each submission a head start so sequences are allocated in loop order.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await??);
    }

    assert_eq!(
        results,
        vec![
            ClientResponse(None),
            ClientResponse(Some("v1".into())),
            ClientResponse(Some("v2".into())),
        ],
        "commands must apply in submission order despite the dropped frame"
    );

    let kv = router.get_kv_handle(&0).await?;
    assert_eq!(kv.lock().unwrap().get("x").cloned(), Some("v3".into()));

    Ok(())
}

/// Session expiry test.
///
/// What does this test do?
///
/// - registers one live client session (with its keep-alive loop) and one bare session which
///   will never send keep-alives.
/// - waits past twice the bare session's timeout; the live session's keep-alive entries drive
///   the deterministic clock forward, the leader commits an expiry unregister, and the bare
///   session disappears.
/// - asserts a keep-alive for the expired session answers `UnknownSession`.
///
/// RUST_LOG=conclave,memstore,session_commands=trace cargo test -p conclave --test session_commands
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_sessions_expire() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        conclave::Config::build("test".into())
            .session_timeout(200)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.initialize_with(0, btreeset! {0}).await?;
    router.wait_for_log(&btreeset![0], 1, Some(Duration::from_secs(5)), "init").await?;

    let client: SessionClient<ClientRequest, ClientResponse, RaftRouter> =
        SessionClient::builder(router.clone(), router.addresses().await).register().await?;
    let _ = client.submit(ClientRequest::set("warm", "up")).await?;

    tracing::info!("--- registering a bare session which will go silent");

    let raft = router.get_raft_handle(&0).await?;
    let bare = raft
        .register(conclave::protocol::RegisterRequest {
            client: "bare-client".into(),
            timeout: None,
        })
        .await?;
    assert_eq!(bare.status, ResponseStatus::Ok);

    router
        .wait_for_metrics(&0, |m| m.session_count == 2, Some(Duration::from_secs(5)), "both sessions live")
        .await?;

    tracing::info!("--- waiting for the bare session to expire");

    router
        .wait_for_metrics(&0, |m| m.session_count == 1, Some(Duration::from_secs(10)), "bare session expired")
        .await?;

    let probe = raft
        .keep_alive(conclave::protocol::KeepAliveRequest {
            session: bare.session,
            command_sequence: 0,
            event_index: 0,
        })
        .await?;
    assert_eq!(
        probe.error,
        Some(conclave::ErrorKind::UnknownSession),
        "a keep-alive for an expired session must answer UnknownSession"
    );

    Ok(())
}
