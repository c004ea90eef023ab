//! Hub forwarding, root fallback, and reverse channels.

use crate::harness::*;
use trellis_runtime::NodeEvent;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hub_forwards_to_the_hosting_peer() {
    let hub = start_node("hub", |c| c.allow_mesh = true).await;
    let a = start_node("a", |_| {}).await;
    register_stock(&a);
    let b = start_node("b", |_| {}).await;
    hub.trust(&a);
    hub.trust(&b);

    // A dials the hub with a reverse channel: the reversal signal makes
    // the hub request-capable toward A, and A's catalogue on that channel
    // teaches the hub that A hosts Stock. A connects first so the hub can
    // advertise Stock to B at B's connect time.
    let mut a_cfg = hub.peer_config(1);
    a_cfg.reverse_connections = 1;
    a.runtime.connect_peer(&a_cfg).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    b.runtime.connect_peer(&hub.peer_config(1)).await.unwrap();

    let mut hub_events = hub.runtime.events();
    let stock: Stock = b.runtime.proxy("Stock").call("get", (1u32,)).await.unwrap();
    assert_eq!(stock, Stock { id: 1, name: "stock-1".into(), quantity: 41 });

    let event = expect_event(&mut hub_events, "forwarded InboundCompleted", |e| {
        matches!(e, NodeEvent::InboundCompleted { .. })
    })
    .await;
    match event {
        NodeEvent::InboundCompleted { peer, forwarded, error, .. } => {
            assert_eq!(peer, "b");
            assert!(forwarded, "the hub must flag the call as forwarded");
            assert!(!error);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn root_peer_is_the_fallback_route() {
    let hub = start_node("hub", |c| c.allow_mesh = true).await;
    let a = start_node("a", |_| {}).await;
    register_stock(&a);
    let b = start_node("b", |_| {}).await;
    hub.trust(&a);
    hub.trust(&b);

    let mut a_cfg = hub.peer_config(1);
    a_cfg.reverse_connections = 1;
    a.runtime.connect_peer(&a_cfg).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // B marks the hub as root; its own catalogue stays empty of Stock.
    let mut hub_cfg = hub.peer_config(1);
    hub_cfg.is_root = true;
    b.runtime.connect_peer(&hub_cfg).await.unwrap();
    b.runtime.catalogue().remove_by_peer("hub");
    assert!(!b.runtime.catalogue().contains("Stock"));

    let stock: Stock = b.runtime.proxy("Stock").call("get", (1u32,)).await.unwrap();
    assert_eq!(stock.id, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reverse_channels_let_the_acceptor_call_back() {
    // B hosts Echo and dials A, handing A a reverse channel. A can then
    // invoke B's services even though A never dialed B.
    let a = start_node("a", |_| {}).await;
    let b = start_node("b", |_| {}).await;
    register_echo(&b);
    a.trust(&b);

    let mut a_events = a.runtime.events();
    let mut cfg = a.peer_config(1);
    cfg.reverse_connections = 1;
    b.runtime.connect_peer(&cfg).await.unwrap();

    expect_event(&mut a_events, "ChannelReverted", |e| {
        matches!(e, NodeEvent::ChannelReverted { .. })
    })
    .await;

    let reply: String = a.runtime.proxy("Echo").call("ping", ("back",)).await.unwrap();
    assert_eq!(reply, "back");
}
