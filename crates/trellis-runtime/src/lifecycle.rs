//! Peer lifecycle — accept, connect, disconnect, shutdown.
//!
//! Accept path: handshake as acceptor, send the local catalogue, attach
//! the channel (not request-capable) to the peer's pool entry. If the peer
//! later reverts the channel and sends its catalogue, the pool worker adds
//! the entries and attaches a forward worker.
//!
//! Connect path: N forward channels per configured peer, each reading the
//! peer's catalogue right after the handshake; optionally N reverse
//! channels that send the reversal signal followed by the local catalogue,
//! which the peer treats as forward channels from its side.
//!
//! Disconnect scrubs every trace of the peer: catalogue entries, queue,
//! pending queries, trusted key, root membership.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use trellis_core::config::ConfigError;
use trellis_core::transaction::encode_catalogue;
use trellis_core::{handshake, ChannelError, PeerConfig, RpcError, SecureChannel};

use crate::events::NodeEvent;
use crate::pool;
use crate::RuntimeInner;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl RuntimeInner {
    /// Bind the listener and start accepting peers.
    pub(crate) async fn start_listener(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let bind = format!(
            "{}:{}",
            self.config.network.listen_address, self.config.network.listen_port
        );
        let listener = TcpListener::bind(&bind).await?;
        let local = listener.local_addr()?;
        *self.listen_addr.write().unwrap() = Some(local);

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let Some(inner) = weak.upgrade() else { return };
                if inner.is_shutdown() {
                    return;
                }
                tokio::spawn(async move { inner.handle_accept(stream, addr).await });
            }
        });
        self.tasks.lock().unwrap().push(handle);
        tracing::info!(addr = %local, "listening for peers");
        Ok(local)
    }

    async fn handle_accept(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let accepted = match handshake::accept(&mut stream, &self.identity, &self.keystore).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "peer rejected");
                return;
            }
        };
        let peer = accepted.peer_name.clone();
        let channel = Arc::new(SecureChannel::accepted(stream, &accepted.seed, &peer));

        // Exactly one catalogue frame follows the handshake.
        let names = self.advertised_services();
        let payload = match encode_catalogue(&names) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "catalogue encode failed");
                return;
            }
        };
        if let Err(e) = channel.send(&payload).await {
            tracing::warn!(peer = %peer, error = %e, "catalogue send failed");
            return;
        }

        let (entry, created) = self.pool.entry(&peer);
        pool::attach_channel(&self, &entry, channel);
        if created {
            tracing::info!(peer = %peer, %addr, "peer connected");
            self.emit(NodeEvent::PeerConnected { peer });
        }
    }

    /// Dial a configured peer: trust its key, open the forward channels,
    /// then any reverse channels.
    pub(crate) async fn connect_peer(self: &Arc<Self>, cfg: &PeerConfig) -> Result<(), ConnectError> {
        let key = cfg.decode_trusted_key()?;
        let peer = cfg.friendly_name.clone();
        self.keystore.add(&peer, key.clone());
        if cfg.is_root {
            self.roots.write().unwrap().insert(peer.clone());
        }

        let (entry, created) = self.pool.entry(&peer);
        if let Err(e) = self.open_channels(cfg, &peer, &key, &entry).await {
            // A half-connected peer is worse than none: scrub everything.
            self.teardown_peer(&peer).await;
            return Err(e);
        }

        if created {
            tracing::info!(
                peer = %peer,
                addr = %cfg.address,
                forward = cfg.connections,
                reverse = cfg.reverse_connections,
                root = cfg.is_root,
                "peer connected"
            );
            self.emit(NodeEvent::PeerConnected { peer });
        }
        Ok(())
    }

    async fn open_channels(
        self: &Arc<Self>,
        cfg: &PeerConfig,
        peer: &str,
        key: &trellis_core::RsaPublicKey,
        entry: &Arc<crate::pool::PeerEntry>,
    ) -> Result<(), ConnectError> {
        for _ in 0..cfg.connections {
            let (channel, names) =
                SecureChannel::connect(&cfg.address, peer, self.identity.clone(), key.clone())
                    .await?;
            self.catalogue.add_many(peer, &names);
            pool::attach_channel(self, entry, Arc::new(channel));
        }

        if cfg.reverse_connections > 0 {
            let local = encode_catalogue(&self.advertised_services())
                .map_err(|e| ChannelError::Protocol(format!("catalogue encode failed: {e}")))?;
            for _ in 0..cfg.reverse_connections {
                let (channel, names) =
                    SecureChannel::connect(&cfg.address, peer, self.identity.clone(), key.clone())
                        .await?;
                self.catalogue.add_many(peer, &names);
                // Grant the peer request capability, then advertise what we
                // host; it treats this channel as a forward channel.
                channel.send_revert().await?;
                channel.send(&local).await?;
                pool::attach_channel(self, entry, Arc::new(channel));
            }
        }
        Ok(())
    }

    /// Remove every trace of a peer. Idempotent; safe to call from the
    /// peer's own workers (the task abort happens last).
    pub(crate) async fn teardown_peer(self: &Arc<Self>, peer: &str) {
        let Some(entry) = self.pool.remove(peer) else {
            return;
        };
        self.catalogue.remove_by_peer(peer);
        self.pending.fail_peer(peer, RpcError::peer_disconnected(peer));
        self.keystore.remove(peer);
        self.roots.write().unwrap().remove(peer);
        tracing::info!(peer, "peer disconnected");
        self.emit(NodeEvent::PeerDisconnected {
            peer: peer.to_string(),
        });
        entry.close();
    }

    /// Stop everything: listener, workers, queues; fail all pending calls.
    pub(crate) fn shutdown_now(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("runtime shutting down");
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for entry in self.pool.drain() {
            entry.close();
        }
        self.pending.fail_all(RpcError::shutdown());
    }
}
