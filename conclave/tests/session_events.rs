mod fixtures;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use conclave::client::SessionClient;
use fixtures::RaftRouter;
use maplit::btreeset;
use memstore::ClientRequest;
use memstore::ClientResponse;

/// Session event delivery test.
///
/// What does this test do?
///
/// - brings a single node cluster online and registers a client session with a `change` event
///   handler.
/// - submits writes; each apply publishes a `change` event to the submitting session.
/// - asserts every event fires before its own command's response resolves, in server emit
///   order, and that the handler can be removed by its subscription handle.
///
/// RUST_LOG=conclave,memstore,session_events=trace cargo test -p conclave --test session_events
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_fire_before_command_response() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(conclave::Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.initialize_with(0, btreeset! {0}).await?;
    router.wait_for_log(&btreeset![0], 1, Some(Duration::from_secs(5)), "init").await?;

    let client: SessionClient<ClientRequest, ClientResponse, RaftRouter> =
        SessionClient::builder(router.clone(), router.addresses().await).register().await?;

    let firing_order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let order = firing_order.clone();
    let subscription = client.on_event("change", move |event| {
        let payload: (String, String) = serde_json::from_slice(&event.payload).expect("malformed change payload");
        order.lock().unwrap().push(format!("event:{}={}", payload.0, payload.1));
    });

    tracing::info!("--- submitting writes and recording the firing order");

    for i in 1..=3u64 {
        client.submit(ClientRequest::set("k", format!("v{}", i))).await?;
        // The submit future resolves only after all events at or before its apply have fired.
        firing_order.lock().unwrap().push(format!("response:{}", i));
    }

    assert_eq!(
        *firing_order.lock().unwrap(),
        vec![
            "event:k=v1".to_string(),
            "response:1".to_string(),
            "event:k=v2".to_string(),
            "response:2".to_string(),
            "event:k=v3".to_string(),
            "response:3".to_string(),
        ],
        "each change event must fire before its own command's response"
    );

    tracing::info!("--- removing the handler by its subscription");

    client.remove_handler(&subscription);
    client.submit(ClientRequest::set("k", "v4")).await?;
    assert_eq!(
        firing_order.lock().unwrap().len(),
        6,
        "a removed handler must not fire"
    );

    client.close().await?;
    Ok(())
}
