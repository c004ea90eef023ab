//! Connection pool — per-peer request queues and channel workers.
//!
//! Each peer owns one unbounded FIFO request queue and a set of secure
//! channels. Every request-capable channel gets a forward worker that
//! drains the shared queue; every channel gets an inbound worker that
//! reads frames and routes them (request → dispatcher, response → pending
//! completion, revert → catalogue merge plus a new forward worker).
//!
//! Requests on one channel keep their order; across channels of the same
//! peer there is none, and a response may arrive on a different channel
//! than its request — correlation is by id only.
//!
//! Failure policy: a dialed channel re-establishes itself indefinitely at
//! the configured reconnect delay. An accepted channel's failure is
//! terminal and tears the whole peer entry down.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use trellis_core::transaction::decode_catalogue;
use trellis_core::{ChannelError, Inbound, RpcError, SecureChannel, Transaction};

use crate::events::NodeEvent;
use crate::RuntimeInner;

pub(crate) struct ConnectionPool {
    peers: DashMap<String, Arc<PeerEntry>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Get or create the entry for `peer`. The bool is true when the entry
    /// was created by this call.
    pub fn entry(&self, peer: &str) -> (Arc<PeerEntry>, bool) {
        let mut created = false;
        let entry = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(PeerEntry::new(peer))
            })
            .clone();
        (entry, created)
    }

    pub fn get(&self, peer: &str) -> Option<Arc<PeerEntry>> {
        self.peers.get(peer).map(|e| e.clone())
    }

    pub fn remove(&self, peer: &str) -> Option<Arc<PeerEntry>> {
        self.peers.remove(peer).map(|(_, e)| e)
    }

    pub fn queue_depth(&self, peer: &str) -> Option<usize> {
        self.get(peer).map(|e| e.depth())
    }

    /// Remove and return every entry. Used at shutdown.
    pub fn drain(&self) -> Vec<Arc<PeerEntry>> {
        let names: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.remove(&name))
            .collect()
    }
}

/// One peer's queue, channels, and worker tasks.
pub(crate) struct PeerEntry {
    pub name: String,
    queue_tx: async_channel::Sender<Vec<u8>>,
    queue_rx: async_channel::Receiver<Vec<u8>>,
    channels: StdMutex<Vec<Arc<SecureChannel>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PeerEntry {
    fn new(name: &str) -> Self {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        Self {
            name: name.to_string(),
            queue_tx,
            queue_rx,
            channels: StdMutex::new(Vec::new()),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Push an encoded request frame. The queue is unbounded, so this only
    /// fails once the peer has been torn down.
    pub async fn enqueue(&self, frame: Vec<u8>) -> Result<(), RpcError> {
        self.queue_tx
            .send(frame)
            .await
            .map_err(|_| RpcError::peer_disconnected(&self.name))
    }

    /// Outstanding requests not yet picked up by a forward worker.
    pub fn depth(&self) -> usize {
        self.queue_tx.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    fn add_channel(&self, channel: Arc<SecureChannel>) {
        self.channels.lock().unwrap().push(channel);
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Close the queue and stop every worker. Runs last in a teardown: the
    /// caller may be one of the aborted workers.
    pub fn close(&self) {
        self.queue_tx.close();
        self.channels.lock().unwrap().clear();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Register a channel with the peer entry and start its workers.
pub(crate) fn attach_channel(
    inner: &Arc<RuntimeInner>,
    entry: &Arc<PeerEntry>,
    channel: Arc<SecureChannel>,
) {
    entry.add_channel(channel.clone());
    spawn_inbound_worker(inner, entry, channel.clone());
    if channel.can_request() {
        spawn_forward_worker(inner, entry, channel);
    }
}

/// One forward worker per request-capable channel: dequeue, send, repeat.
/// A frame whose send fails on a dialed channel is retried on the
/// re-established channel; on an accepted channel the peer is torn down.
pub(crate) fn spawn_forward_worker(
    inner: &Arc<RuntimeInner>,
    entry: &Arc<PeerEntry>,
    channel: Arc<SecureChannel>,
) {
    let weak = Arc::downgrade(inner);
    let entry_for_task = entry.clone();
    let handle = tokio::spawn(async move {
        let entry = entry_for_task;
        let queue = entry.queue_rx.clone();
        'next: loop {
            let frame = match queue.recv().await {
                Ok(frame) => frame,
                Err(_) => return, // queue closed: peer torn down or shutdown
            };
            loop {
                let seen = channel.generation();
                match channel.send(&frame).await {
                    Ok(()) => continue 'next,
                    Err(e) => {
                        let Some(inner) = weak.upgrade() else { return };
                        tracing::debug!(peer = %entry.name, error = %e, "send failed");
                        if !recover(&inner, &entry, &channel, seen).await {
                            return;
                        }
                    }
                }
            }
        }
    });
    entry.track(handle);
}

/// One inbound worker per channel: read, decrypt, route.
pub(crate) fn spawn_inbound_worker(
    inner: &Arc<RuntimeInner>,
    entry: &Arc<PeerEntry>,
    channel: Arc<SecureChannel>,
) {
    let weak = Arc::downgrade(inner);
    let entry_for_task = entry.clone();
    let handle = tokio::spawn(async move {
        let entry = entry_for_task;
        loop {
            let seen = channel.generation();
            match channel.recv().await {
                Ok(Inbound::Frame(plaintext)) => {
                    let Some(inner) = weak.upgrade() else { return };
                    match Transaction::decode(&plaintext) {
                        Ok(Transaction::Request {
                            id,
                            scope,
                            procedure,
                            args,
                        }) => {
                            let response =
                                inner.handle_request(&entry.name, id, scope, procedure, args).await;
                            let bytes = match response.encode() {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    tracing::error!(error = %e, "response encode failed");
                                    continue;
                                }
                            };
                            if let Err(e) = channel.send(&bytes).await {
                                tracing::debug!(peer = %entry.name, error = %e, "response send failed");
                                // The response is lost either way; recover the
                                // transport and let the caller's retry or
                                // timeout take it from here.
                                if !recover(&inner, &entry, &channel, seen).await {
                                    return;
                                }
                            }
                        }
                        Ok(Transaction::Response { id, result, error }) => {
                            let completion = match error {
                                Some(err) => Err(err),
                                None => Ok(result),
                            };
                            if !inner.pending.complete(id, completion) {
                                tracing::debug!(id, "late or unknown response discarded");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(peer = %entry.name, error = %e, "undecodable frame");
                        }
                    }
                }
                Ok(Inbound::Reverted) => {
                    let Some(inner) = weak.upgrade() else { return };
                    // The peer follows the signal with its own catalogue and
                    // from then on this channel doubles as a forward channel.
                    match channel.recv().await {
                        Ok(Inbound::Frame(bytes)) => match decode_catalogue(&bytes) {
                            Ok(names) => {
                                inner.catalogue.add_many(&entry.name, &names);
                                inner.emit(NodeEvent::ChannelReverted {
                                    peer: entry.name.clone(),
                                });
                                tracing::info!(
                                    peer = %entry.name,
                                    services = names.len(),
                                    "channel reverted; forward worker attached"
                                );
                                spawn_forward_worker(&inner, &entry, channel.clone());
                            }
                            Err(e) => {
                                tracing::warn!(peer = %entry.name, error = %e, "bad catalogue after revert");
                            }
                        },
                        Ok(Inbound::Reverted) => {
                            tracing::warn!(peer = %entry.name, "duplicate revert signal ignored");
                        }
                        Err(e) => {
                            tracing::debug!(peer = %entry.name, error = %e, "recv failed after revert");
                            if !recover(&inner, &entry, &channel, seen).await {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let Some(inner) = weak.upgrade() else { return };
                    tracing::debug!(peer = %entry.name, error = %e, "recv failed");
                    if !recover(&inner, &entry, &channel, seen).await {
                        return;
                    }
                }
            }
        }
    });
    entry.track(handle);
}

/// Bring the channel back after a transport error.
///
/// Dialed channels retry indefinitely at the reconnect delay, emitting a
/// `ReconnectFailed` event per failed attempt. Accepted channels tear the
/// peer down. Returns false when the caller's worker should exit.
async fn recover(
    inner: &Arc<RuntimeInner>,
    entry: &Arc<PeerEntry>,
    channel: &SecureChannel,
    seen_generation: u64,
) -> bool {
    if !channel.is_client_originated() {
        inner.teardown_peer(&entry.name).await;
        return false;
    }
    loop {
        if inner.is_shutdown() {
            return false;
        }
        match channel.reconnect_if_stale(seen_generation).await {
            // Another worker already restored the channel.
            Ok(None) => return true,
            Ok(Some(names)) => {
                inner.catalogue.add_many(&entry.name, &names);
                return true;
            }
            Err(ChannelError::NotReconnectable) => {
                inner.teardown_peer(&entry.name).await;
                return false;
            }
            Err(e) => {
                tracing::warn!(peer = %entry.name, error = %e, "reconnect failed");
                inner.emit(NodeEvent::ReconnectFailed {
                    peer: entry.name.clone(),
                    error: e.to_string(),
                });
                tokio::time::sleep(inner.config.reconnect_delay()).await;
            }
        }
    }
}
