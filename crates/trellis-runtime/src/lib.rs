//! trellis-runtime — the mesh runtime of Trellis.
//!
//! A [`Runtime`] is one node: it hosts local service implementations,
//! listens for peers, dials configured peers over N parallel encrypted
//! channels each, routes outbound calls through the service catalogue
//! (with a root fallback tier), and — when mesh forwarding is enabled —
//! services inbound calls by re-issuing them to the peer that hosts the
//! implementation.
//!
//! Every table the node relies on (trusted keys, catalogue, registry,
//! pending queries) is owned by the runtime instance, not the process:
//! several runtimes can coexist in one process, which is exactly how the
//! integration tests run whole meshes in-process.

pub mod catalogue;
mod dispatch;
pub mod events;
mod invoke;
mod lifecycle;
pub mod pending;
mod pool;
pub mod proxy;
pub mod registry;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use trellis_core::config::ConfigError;
use trellis_core::crypto::CryptoError;
use trellis_core::{NodeConfig, NodeIdentity, PeerConfig, ScopeId, TrustedKeyStore};

use catalogue::ServiceCatalogue;
use pending::PendingQueries;
use pool::ConnectionPool;
use registry::ImplementationRegistry;

pub use events::NodeEvent;
pub use lifecycle::ConnectError;
pub use proxy::{ScopedProxy, ServiceProxy};
pub use registry::{Lifetime, ServiceBuilder};
pub use trellis_core::{ErrorKind, RpcError};

/// How often the scoped-instance sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Idle TTL after which a pinned scope whose release never arrived is
/// reclaimed anyway.
const PIN_IDLE_TTL: Duration = Duration::from_secs(600);

/// Shared state of one node. Owned behind an `Arc`; workers hold `Weak`
/// references and exit when the runtime goes away.
pub struct RuntimeInner {
    pub(crate) config: NodeConfig,
    pub(crate) identity: Arc<NodeIdentity>,
    pub(crate) keystore: TrustedKeyStore,
    pub(crate) registry: ImplementationRegistry,
    pub(crate) catalogue: ServiceCatalogue,
    pub(crate) pending: PendingQueries,
    pub(crate) pool: ConnectionPool,
    pub(crate) roots: StdRwLock<HashSet<String>>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) listen_addr: StdRwLock<Option<SocketAddr>>,
    pub(crate) tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RuntimeInner {
    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn root_peers(&self) -> HashSet<String> {
        self.roots.read().unwrap().clone()
    }

    /// The names this node puts in a catalogue frame: everything it hosts
    /// locally, plus — on a mesh hub — the services it can forward, so
    /// peers that only know the hub can still route calls to them.
    pub(crate) fn advertised_services(&self) -> Vec<String> {
        let mut names = self.registry.local_service_names();
        if self.config.allow_mesh {
            names.extend(self.catalogue.services());
            names.sort();
            names.dedup();
        }
        names
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// One Trellis node.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Build a runtime from configuration, loading (or generating) the
    /// node's key pair from the configured paths.
    pub fn new(config: NodeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let identity = NodeIdentity::load_or_generate(
            &config.keys.public_path,
            &config.keys.private_path,
            config.keys.bits,
        )?;
        Ok(Self::with_identity(config, identity))
    }

    /// Build a runtime around an identity created elsewhere. Used by the
    /// test harness to avoid touching disk.
    pub fn with_identity(config: NodeConfig, identity: NodeIdentity) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                identity: Arc::new(identity),
                keystore: TrustedKeyStore::new(),
                registry: ImplementationRegistry::new(),
                catalogue: ServiceCatalogue::new(),
                pending: PendingQueries::new(),
                pool: ConnectionPool::new(),
                roots: StdRwLock::new(HashSet::new()),
                events: events::channel(),
                shutting_down: AtomicBool::new(false),
                listen_addr: StdRwLock::new(None),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Start listening and begin the scoped-instance sweeper. Configured
    /// peers are dialed separately via [`Runtime::connect_configured_peers`].
    pub async fn start(&self) -> Result<SocketAddr, RuntimeError> {
        let addr = self.inner.start_listener().await?;

        let weak = Arc::downgrade(&self.inner);
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                let swept = inner.registry.sweep_scopes(PIN_IDLE_TTL);
                if swept > 0 {
                    tracing::debug!(swept, "scoped instances reclaimed");
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(sweeper);
        Ok(addr)
    }

    /// Dial every peer in the configuration, in order.
    pub async fn connect_configured_peers(&self) -> Result<(), ConnectError> {
        for peer in &self.inner.config.peers {
            self.inner.connect_peer(peer).await?;
        }
        Ok(())
    }

    /// Dial one peer.
    pub async fn connect_peer(&self, peer: &PeerConfig) -> Result<(), ConnectError> {
        self.inner.connect_peer(peer).await
    }

    /// Drop a peer deliberately: catalogue entries, queue, pending calls,
    /// trusted key, and root membership all go with it.
    pub async fn disconnect_peer(&self, peer: &str) {
        self.inner.teardown_peer(peer).await;
    }

    /// Local service registrations. Register everything before `start`.
    pub fn registry(&self) -> &ImplementationRegistry {
        &self.inner.registry
    }

    /// The trusted key store of this node.
    pub fn keystore(&self) -> &TrustedKeyStore {
        &self.inner.keystore
    }

    /// Subscribe to lifecycle and observability events.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// A dispatcher for `interface` (leading-`I` convention honored).
    pub fn proxy(&self, interface: &str) -> ServiceProxy {
        ServiceProxy::new(self.inner.clone(), interface)
    }

    /// Invoke `"service.method"` with pre-encoded arguments.
    pub async fn invoke_raw(
        &self,
        scope: Option<ScopeId>,
        procedure: &str,
        args: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        self.inner.invoke_raw(scope, procedure, args).await
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.read().unwrap()
    }

    pub fn local_name(&self) -> &str {
        &self.inner.config.friendly_name
    }

    /// This node's public key.
    pub fn public_key(&self) -> trellis_core::RsaPublicKey {
        self.inner.identity.public().clone()
    }

    /// This node's public key in the form peer configurations carry.
    pub fn public_key_base64(&self) -> Result<String, CryptoError> {
        Ok(trellis_core::config::encode_trusted_key(
            &self.inner.identity.public_der()?,
        ))
    }

    /// The service catalogue: which peers advertise which services.
    pub fn catalogue(&self) -> &ServiceCatalogue {
        &self.inner.catalogue
    }

    /// Outstanding queue depth toward a peer, if connected.
    pub fn queue_depth(&self, peer: &str) -> Option<usize> {
        self.inner.pool.queue_depth(peer)
    }

    /// Stop the node: close every queue, abort every worker, fail every
    /// pending query with `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shutdown_now();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.shutdown_now();
        }
    }
}
