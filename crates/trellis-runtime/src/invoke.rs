//! Invocation engine — routes a call to a peer and awaits its response.
//!
//! Target selection: the catalogue's peers for the service, falling back
//! to the root tier when no peer advertises it. Among several candidates
//! the one with the shallowest request queue wins; equal depths are broken
//! uniformly at random.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use trellis_core::transaction::parse_procedure;
use trellis_core::{RpcError, ScopeId, Transaction};

use crate::proxy::SCOPE_RELEASE;
use crate::RuntimeInner;

impl RuntimeInner {
    /// Invoke `procedure` with encoded arguments.
    ///
    /// A locally implemented service is executed in-process, with no
    /// catalogue lookup and no network. Everything else is routed to a peer.
    pub async fn invoke_raw(
        self: &Arc<Self>,
        scope: Option<ScopeId>,
        procedure: &str,
        args: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        if self.is_shutdown() {
            return Err(RpcError::shutdown());
        }
        let (service, method) = parse_procedure(procedure)?;
        if self.registry.has_service(service) {
            return self.registry.invoke(service, method, scope, args, false).await;
        }
        self.invoke_remote(scope, procedure, args).await
    }

    /// Route to a catalogue (or root) peer and await the correlated
    /// response under the configured timeout.
    pub(crate) async fn invoke_remote(
        self: &Arc<Self>,
        scope: Option<ScopeId>,
        procedure: &str,
        args: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let (service, _) = parse_procedure(procedure)?;

        let mut candidates = self.catalogue.lookup(service);
        if candidates.is_empty() {
            candidates = self.root_peers();
        }
        if candidates.is_empty() {
            return Err(RpcError::no_route(service));
        }

        let chosen = self
            .choose_peer(&candidates)
            .ok_or_else(|| RpcError::no_route(service))?;
        self.invoke_on(&chosen, scope, procedure, args).await
    }

    /// Queue a request for one specific peer and await its response.
    pub(crate) async fn invoke_on(
        self: &Arc<Self>,
        peer: &str,
        scope: Option<ScopeId>,
        procedure: &str,
        args: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let entry = self
            .pool
            .get(peer)
            .ok_or_else(|| RpcError::peer_disconnected(peer))?;

        let (id, rx) = self.pending.allocate(peer);
        let frame = match (Transaction::Request {
            id,
            scope,
            procedure: procedure.to_string(),
            args,
        })
        .encode()
        {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.remove(id);
                return Err(RpcError::application(format!("request encode failed: {e}")));
            }
        };

        if let Err(e) = entry.enqueue(frame).await {
            self.pending.remove(id);
            return Err(e);
        }
        tracing::trace!(id, peer, procedure, "request queued");

        let completion = match self.config.request_timeout() {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(completion) => completion,
                Err(_) => {
                    // Late responses will find no entry and be discarded.
                    self.pending.remove(id);
                    return Err(RpcError::timeout(self.config.timeouts.request_timeout_ms));
                }
            },
        };

        match completion {
            Ok(Ok(result)) => Ok(result.unwrap_or_default()),
            Ok(Err(error)) => Err(error),
            // The table itself was dropped mid-flight.
            Err(_) => Err(RpcError::shutdown()),
        }
    }

    /// argmin queue depth over the candidates, uniform among ties.
    pub(crate) fn choose_peer(&self, candidates: &HashSet<String>) -> Option<String> {
        let depths: Vec<(String, usize)> = candidates
            .iter()
            .filter_map(|peer| {
                self.pool
                    .queue_depth(peer)
                    .map(|depth| (peer.clone(), depth))
            })
            .collect();

        let min = depths.iter().map(|(_, d)| *d).min()?;
        let shallowest: Vec<&String> = depths
            .iter()
            .filter(|(_, d)| *d == min)
            .map(|(peer, _)| peer)
            .collect();
        let pick = if shallowest.len() == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..shallowest.len())
        };
        Some(shallowest[pick].clone())
    }

    /// Drop the local pins for a scope and tell every peer that may host
    /// an instance of it. Fired from a scoped dispatcher's drop.
    pub(crate) async fn release_scope_everywhere(self: &Arc<Self>, service: &str, scope: ScopeId) {
        self.registry.release_scope(scope);

        let mut peers = self.catalogue.lookup(service);
        peers.extend(self.root_peers());
        if peers.is_empty() {
            return;
        }
        let args = bincode::serialize(&()).unwrap_or_default();
        for peer in peers {
            if let Err(e) = self
                .invoke_on(&peer, Some(scope), SCOPE_RELEASE, args.clone())
                .await
            {
                tracing::debug!(peer = %peer, scope, error = %e, "scope release not delivered");
            }
        }
    }
}
