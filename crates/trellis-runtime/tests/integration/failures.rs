//! Partial failure: peers dying with calls in flight.

use std::time::Duration;

use crate::harness::*;
use trellis_core::ErrorKind;
use trellis_runtime::NodeEvent;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_death_mid_call_fails_fast_and_cleans_the_hub() {
    let hub = start_node("hub", |c| c.allow_mesh = true).await;
    let a = start_node("a", |_| {}).await;
    register_stock(&a);
    let b = start_node("b", |c| c.timeouts.request_timeout_ms = 8000).await;
    hub.trust(&a);
    hub.trust(&b);

    let mut a_cfg = hub.peer_config(1);
    a_cfg.reverse_connections = 1;
    a.runtime.connect_peer(&a_cfg).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    b.runtime.connect_peer(&hub.peer_config(1)).await.unwrap();

    let mut hub_events = hub.runtime.events();
    let proxy = b.runtime.proxy("Stock");
    let call = tokio::spawn(async move { proxy.call::<_, Stock>("get_slow", (1u32,)).await });

    // Kill A while the call is parked inside its handler.
    tokio::time::sleep(Duration::from_millis(300)).await;
    a.runtime.shutdown();

    let err = call.await.unwrap().unwrap_err();
    assert!(
        matches!(err.kind, ErrorKind::PeerDisconnected | ErrorKind::Timeout),
        "expected a transport failure, got {err}"
    );

    expect_event(&mut hub_events, "PeerDisconnected for a", |e| {
        matches!(e, NodeEvent::PeerDisconnected { peer } if peer == "a")
    })
    .await;
    assert!(
        !hub.runtime.catalogue().contains("Stock"),
        "the hub's catalogue must forget the dead peer's services"
    );
    assert!(
        !hub.runtime.keystore().names().contains(&"a".to_string()),
        "the hub's trusted key store must forget the dead peer"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_scrubs_the_server_side_tables() {
    let a = start_node("a", |_| {}).await;
    register_echo(&a);
    let b = start_node("b", |_| {}).await;
    a.trust(&b);

    let mut a_events = a.runtime.events();
    b.runtime.connect_peer(&a.peer_config(1)).await.unwrap();
    let reply: String = b.runtime.proxy("Echo").call("ping", ("up",)).await.unwrap();
    assert_eq!(reply, "up");
    assert!(a.runtime.keystore().names().contains(&"b".to_string()));

    b.runtime.shutdown();

    expect_event(&mut a_events, "PeerDisconnected for b", |e| {
        matches!(e, NodeEvent::PeerDisconnected { peer } if peer == "b")
    })
    .await;
    assert!(!a.runtime.keystore().names().contains(&"b".to_string()));
    assert!(a.runtime.queue_depth("b").is_none(), "pool entry must be gone");
}
