mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::Config;
use fixtures::RaftRouter;
use maplit::btreeset;

/// Cluster initialization test.
///
/// What does this test do?
///
/// - brings 3 nodes online with no config, asserting no leader emerges on its own.
/// - initializes the cluster from node 0.
/// - asserts a single leader is elected at term 1 with the initial config entry committed and
///   applied everywhere.
///
/// RUST_LOG=conclave,memstore,initialization=trace cargo test -p conclave --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initialization() -> Result<()> {
    fixtures::init_tracing();

    // Setup test dependencies.
    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    tracing::info!("--- asserting pristine cluster takes no action on its own");

    tokio::time::sleep(Duration::from_millis(500)).await;
    for metrics in router.latest_metrics().await {
        assert_eq!(metrics.current_leader, None, "node {} has a leader before init", metrics.id);
        assert_eq!(metrics.current_term, 0, "node {} has a term before init", metrics.id);
        assert_eq!(metrics.last_log_index, 0, "node {} has log before init", metrics.id);
    }

    tracing::info!("--- initializing cluster from node 0");

    router.initialize_with(0, btreeset! {0,1,2}).await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, Some(Duration::from_secs(5)), "init").await?;

    tracing::info!("--- asserting stable single-leader cluster");

    router.assert_stable_cluster(Some(1), Some(1)).await;

    Ok(())
}
