//! Local and remote unary calls.

use crate::harness::*;
use trellis_core::ErrorKind;
use trellis_runtime::{Lifetime, NodeEvent, ServiceBuilder};

#[tokio::test]
async fn local_call_never_touches_the_network() {
    let a = start_node("a", |_| {}).await;
    register_echo(&a);

    let echo = a.runtime.proxy("IEcho");
    let reply: String = echo.call("ping", ("hi",)).await.unwrap();
    assert_eq!(reply, "hi");

    // Nothing was routed: no peers, no catalogue entries.
    assert!(a.runtime.catalogue().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_call_over_two_channels() {
    let a = start_node("a", |_| {}).await;
    register_echo(&a);
    let b = start_node("b", |_| {}).await;
    a.trust(&b);

    let mut a_events = a.runtime.events();
    b.runtime.connect_peer(&a.peer_config(2)).await.unwrap();

    let reply: String = b.runtime.proxy("Echo").call("ping", ("hi",)).await.unwrap();
    assert_eq!(reply, "hi");

    let event = expect_event(&mut a_events, "InboundCompleted", |e| {
        matches!(e, NodeEvent::InboundCompleted { .. })
    })
    .await;
    match event {
        NodeEvent::InboundCompleted {
            peer,
            procedure,
            error,
            forwarded,
            ..
        } => {
            assert_eq!(peer, "b");
            assert_eq!(procedure, "Echo.ping");
            assert!(!error);
            assert!(!forwarded);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn property_accessors_use_the_get_set_convention() {
    use std::sync::Mutex;

    #[derive(Default)]
    struct Settings {
        motd: Mutex<String>,
    }

    let a = start_node("a", |_| {}).await;
    ServiceBuilder::new("ISettings", Lifetime::Singleton, Settings::default)
        .method("get_motd", |svc: std::sync::Arc<Settings>, (): ()| async move {
            Ok(svc.motd.lock().unwrap().clone())
        })
        .method(
            "set_motd",
            |svc: std::sync::Arc<Settings>, (value,): (String,)| async move {
                *svc.motd.lock().unwrap() = value;
                Ok(())
            },
        )
        .register(a.runtime.registry());

    let b = start_node("b", |_| {}).await;
    a.trust(&b);
    b.runtime.connect_peer(&a.peer_config(1)).await.unwrap();

    let settings = b.runtime.proxy("Settings");
    settings.set("motd", "be kind").await.unwrap();
    let motd: String = settings.get("motd").await.unwrap();
    assert_eq!(motd, "be kind");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn application_errors_cross_the_wire_unchanged() {
    let a = start_node("a", |_| {}).await;
    register_echo(&a);
    let b = start_node("b", |_| {}).await;
    a.trust(&b);
    b.runtime.connect_peer(&a.peer_config(1)).await.unwrap();

    let err = b
        .runtime
        .proxy("Echo")
        .call::<_, ()>("fail", ())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Application);
    assert_eq!(err.message, "echo deliberately failed");
}

#[tokio::test]
async fn malformed_procedures_never_crash_the_engine() {
    let a = start_node("a", |_| {}).await;
    for bad in ["", "x", "x.y.z", ".m", "s."] {
        let err = a.runtime.invoke_raw(None, bad, vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadProcedure, "input {bad:?}");
    }
}

#[tokio::test]
async fn unknown_service_with_no_root_is_no_route() {
    let a = start_node("a", |_| {}).await;
    let err = a
        .runtime
        .invoke_raw(None, "Nowhere.method", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoRoute);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_calls_yield_timeout_and_discard_the_late_response() {
    let a = start_node("a", |_| {}).await;
    register_stock(&a);
    let b = start_node("b", |c| c.timeouts.request_timeout_ms = 300).await;
    a.trust(&b);
    b.runtime.connect_peer(&a.peer_config(1)).await.unwrap();

    let err = b
        .runtime
        .proxy("Stock")
        .call::<_, Stock>("get_slow", (1u32,))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    // Let the slow handler finish so its late response arrives (and is
    // discarded) and the single channel is serving again.
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    let stock: Stock = b.runtime.proxy("Stock").call("get", (2u32,)).await.unwrap();
    assert_eq!(stock.id, 2);
}
