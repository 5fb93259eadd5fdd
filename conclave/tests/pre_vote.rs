mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::raft::PollRequest;
use conclave::Config;
use conclave::State;
use fixtures::RaftRouter;
use maplit::btreeset;

/// Pre-vote (poll) non-disruption test.
///
/// What does this test do?
///
/// - brings a 3 node cluster online and waits for a stable leader.
/// - isolates one follower long enough for its election timer to fire repeatedly; its pre-vote
///   polls cannot reach a majority, so it must not increment its term.
/// - heals the partition and asserts the node rejoins as follower at the original term, with
///   the original leader undisturbed.
/// - additionally drives the poll handler directly: polls grant or refuse on log freshness and
///   never mutate the receiver's term.
///
/// RUST_LOG=conclave,memstore,pre_vote=trace cargo test -p conclave --test pre_vote
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pre_vote_prevents_term_inflation() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.initialize_with(0, btreeset! {0,1,2}).await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, Some(Duration::from_secs(5)), "init").await?;

    let leader = router.leader().await.expect("expected an elected leader");
    let follower = (0..3).find(|id| *id != leader).unwrap();
    let term_before = router.latest_metrics().await.into_iter().find(|m| m.id == follower).unwrap().current_term;

    tracing::info!("--- isolating follower {} across several election timeouts", follower);

    router.isolate_node(follower).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    tracing::info!("--- healing partition");

    router.restore_node(follower).await;
    router
        .wait_for_metrics(
            &follower,
            |m| m.state == State::Follower && m.current_leader == Some(leader),
            Some(Duration::from_secs(5)),
            "follower rejoins",
        )
        .await?;

    let after = router.latest_metrics().await.into_iter().find(|m| m.id == follower).unwrap();
    assert_eq!(
        after.current_term, term_before,
        "an isolated node's failed polls must not inflate its term"
    );
    assert_eq!(router.leader().await, Some(leader), "the sitting leader must be undisturbed");

    tracing::info!("--- driving the poll handler directly");

    let raft = router.get_raft_handle(&leader).await?;
    let metrics = raft.metrics().borrow().clone();

    // A poller with an empty log is refused: the cluster's logs are fresher.
    let refused = raft.poll(PollRequest::new(metrics.current_term, 99, 0, 0)).await?;
    assert!(!refused.accepted, "a stale poller must be refused");

    // A poller with a fresher log is accepted, but the poll itself grants nothing.
    let accepted = raft
        .poll(PollRequest::new(metrics.current_term + 10, 99, metrics.last_log_index + 10, metrics.current_term + 10))
        .await?;
    assert!(accepted.accepted, "a fresh poller must be accepted");

    let unchanged = raft.metrics().borrow().clone();
    assert_eq!(
        unchanged.current_term, metrics.current_term,
        "handling a poll must never move the receiver's term"
    );
    assert_eq!(unchanged.state, State::Leader, "handling a poll must not depose the leader");

    Ok(())
}
