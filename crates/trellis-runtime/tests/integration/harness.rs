//! Test harness — builds in-process nodes and sample services.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use trellis_core::{NodeConfig, NodeIdentity, PeerConfig, RpcError};
use trellis_runtime::{Lifetime, NodeEvent, Runtime, ServiceBuilder};

/// Small keys keep the suite fast; production defaults to 8192 bits.
pub const TEST_KEY_BITS: usize = 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestNode {
    pub runtime: Runtime,
    pub addr: std::net::SocketAddr,
}

/// Start a node on an ephemeral loopback port.
pub async fn start_node(name: &str, configure: impl FnOnce(&mut NodeConfig)) -> TestNode {
    init_tracing();
    let mut config = NodeConfig::default();
    config.friendly_name = name.to_string();
    config.network.listen_address = "127.0.0.1".to_string();
    config.timeouts.request_timeout_ms = 5000;
    config.timeouts.reconnect_delay_ms = 200;
    configure(&mut config);

    let identity = NodeIdentity::generate(TEST_KEY_BITS).expect("keygen");
    let runtime = Runtime::with_identity(config, identity);
    let addr = runtime.start().await.expect("start");
    TestNode { runtime, addr }
}

impl TestNode {
    pub fn name(&self) -> &str {
        self.runtime.local_name()
    }

    /// A peer-config entry describing this node as a dial target.
    pub fn peer_config(&self, connections: u8) -> PeerConfig {
        PeerConfig {
            friendly_name: self.name().to_string(),
            address: self.addr.to_string(),
            connections,
            trusted_public_key: self.runtime.public_key_base64().expect("key encode"),
            ..PeerConfig::default()
        }
    }

    /// Trust `other`, so this node will accept its handshakes.
    pub fn trust(&self, other: &TestNode) {
        self.runtime
            .keystore()
            .add(other.name(), other.runtime.public_key());
    }
}

/// Wait (bounded) for an event matching the predicate.
pub async fn expect_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    what: &str,
    mut predicate: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed while waiting for {what}")
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {what} event within {deadline:?}"))
}

// ── Sample services ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct EchoService;

/// `Echo.ping(s) -> s`, plus helpers the error and property tests use.
pub fn register_echo(node: &TestNode) {
    ServiceBuilder::new("IEcho", Lifetime::Singleton, EchoService::default)
        .method("ping", |_svc: std::sync::Arc<EchoService>, (text,): (String,)| async move {
            Ok(text)
        })
        .method("fail", |_svc: std::sync::Arc<EchoService>, (): ()| async move {
            Err::<(), _>(RpcError::application("echo deliberately failed"))
        })
        .register(node.runtime.registry());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub id: u32,
    pub name: String,
    pub quantity: u32,
}

#[derive(Default)]
pub struct StockService;

impl StockService {
    fn get(&self, id: u32) -> Stock {
        Stock {
            id,
            name: format!("stock-{id}"),
            quantity: 40 + id,
        }
    }
}

/// `Stock.get(id) -> Stock`; `get_slow` parks long enough for a timeout
/// to expire or a peer to die underneath the call.
pub fn register_stock(node: &TestNode) {
    ServiceBuilder::new("IStock", Lifetime::Singleton, StockService::default)
        .method("get", |svc: std::sync::Arc<StockService>, (id,): (u32,)| async move {
            Ok(svc.get(id))
        })
        .method(
            "get_slow",
            |svc: std::sync::Arc<StockService>, (id,): (u32,)| async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(svc.get(id))
            },
        )
        .register(node.runtime.registry());
}
