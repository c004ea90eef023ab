//! Scoped instances across the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::harness::*;
use trellis_runtime::{Lifetime, ServiceBuilder};

struct Session {
    serial: usize,
}

fn register_session(node: &TestNode) -> Arc<AtomicUsize> {
    let constructions = Arc::new(AtomicUsize::new(0));
    let counter = constructions.clone();
    ServiceBuilder::new("ISession", Lifetime::Scoped, move || Session {
        serial: counter.fetch_add(1, Ordering::SeqCst),
    })
    .method("serial", |svc: Arc<Session>, (): ()| async move {
        Ok(svc.serial)
    })
    .register(node.runtime.registry());
    constructions
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scoped_proxies_pin_one_remote_instance_each() {
    let a = start_node("a", |_| {}).await;
    let constructions = register_session(&a);
    let b = start_node("b", |_| {}).await;
    a.trust(&b);
    b.runtime.connect_peer(&a.peer_config(1)).await.unwrap();

    let first = b.runtime.proxy("Session").scoped();
    let second = b.runtime.proxy("Session").scoped();
    assert_ne!(first.scope_id(), second.scope_id());

    let first_a: usize = first.call("serial", ()).await.unwrap();
    let first_b: usize = first.call("serial", ()).await.unwrap();
    let second_a: usize = second.call("serial", ()).await.unwrap();

    assert_eq!(first_a, first_b, "one scope, one instance");
    assert_ne!(first_a, second_a, "each scope gets its own instance");
    assert_eq!(constructions.load(Ordering::SeqCst), 2);
    assert_eq!(a.runtime.registry().scope_count(), 2);

    // Dropping the handle releases the scope on the host.
    drop(first);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.runtime.registry().scope_count(), 1);

    // The surviving scope still serves.
    let still: usize = second.call("serial", ()).await.unwrap();
    assert_eq!(still, second_a);
}
