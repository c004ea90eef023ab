//! Concurrent fan-out over parallel channels.

use std::time::Instant;

use crate::harness::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn thousand_concurrent_pings_over_four_channels() {
    let a = start_node("a", |_| {}).await;
    register_echo(&a);
    let b = start_node("b", |c| c.timeouts.request_timeout_ms = 30_000).await;
    a.trust(&b);
    b.runtime.connect_peer(&a.peer_config(4)).await.unwrap();

    let started = Instant::now();
    let mut calls = tokio::task::JoinSet::new();
    for i in 0..1000u32 {
        let proxy = b.runtime.proxy("Echo");
        calls.spawn(async move {
            let reply: String = proxy.call("ping", (format!("msg-{i}"),)).await?;
            Ok::<_, trellis_core::RpcError>((i, reply))
        });
    }

    let mut seen = vec![false; 1000];
    while let Some(joined) = calls.join_next().await {
        let (i, reply) = joined.expect("task panicked").expect("call failed");
        assert_eq!(reply, format!("msg-{i}"), "response correlated to the wrong call");
        assert!(!seen[i as usize], "duplicate completion for {i}");
        seen[i as usize] = true;
    }
    assert!(seen.iter().all(|&done| done));

    // All four channels share one queue; with everything serial this would
    // take far longer than the bound.
    assert!(
        started.elapsed().as_secs() < 30,
        "fan-out took {:?}",
        started.elapsed()
    );
}
