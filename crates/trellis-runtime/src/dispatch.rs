//! Inbound dispatcher — serves requests arriving from peers.
//!
//! A request is executed locally when the registry holds the service.
//! Otherwise, a hub with mesh forwarding enabled re-issues the call to a
//! peer that hosts it (up to three attempts on transport failures) and
//! relays the answer under the original request id. Anything else is
//! `NoRoute`. Every path emits an `InboundCompleted` event with the
//! duration, error flag, and whether the call was forwarded.

use std::sync::Arc;
use std::time::Instant;

use trellis_core::transaction::parse_procedure;
use trellis_core::{ErrorKind, RpcError, ScopeId, Transaction};

use crate::events::NodeEvent;
use crate::proxy::SCOPE_RELEASE;
use crate::RuntimeInner;

/// Mesh forwarding retries. The caller's single timeout spans all of them.
const MESH_ATTEMPTS: u32 = 3;

impl RuntimeInner {
    /// Serve one request from `peer`, producing the response frame to send
    /// back on whatever channel the pool worker chooses.
    pub(crate) async fn handle_request(
        self: &Arc<Self>,
        peer: &str,
        id: u64,
        scope: Option<ScopeId>,
        procedure: String,
        args: Vec<u8>,
    ) -> Transaction {
        let started = Instant::now();
        let mut forwarded = false;
        let outcome = self
            .dispatch_inner(scope, &procedure, args, &mut forwarded)
            .await;

        let duration = started.elapsed();
        if let Err(error) = &outcome {
            tracing::debug!(
                peer,
                procedure = %procedure,
                %error,
                ?duration,
                forwarded,
                "inbound request failed"
            );
        } else {
            tracing::trace!(peer, procedure = %procedure, ?duration, forwarded, "inbound request served");
        }
        self.emit(NodeEvent::InboundCompleted {
            peer: peer.to_string(),
            procedure,
            scope,
            duration,
            error: outcome.is_err(),
            forwarded,
        });

        match outcome {
            Ok(result) => Transaction::ok_response(id, result),
            Err(error) => Transaction::err_response(id, error),
        }
    }

    async fn dispatch_inner(
        self: &Arc<Self>,
        scope: Option<ScopeId>,
        procedure: &str,
        args: Vec<u8>,
        forwarded: &mut bool,
    ) -> Result<Vec<u8>, RpcError> {
        let (service, method) = parse_procedure(procedure)?;

        if procedure == SCOPE_RELEASE {
            if let Some(scope) = scope {
                self.registry.release_scope(scope);
            }
            return bincode::serialize(&())
                .map_err(|e| RpcError::application(format!("result encode failed: {e}")));
        }

        if self.registry.has_service(service) {
            // Scoped instances resolved for a remote caller are pinned
            // until that caller releases the scope.
            return self.registry.invoke(service, method, scope, args, true).await;
        }

        if self.config.allow_mesh && self.catalogue.contains(service) {
            *forwarded = true;
            let mut last_transport: Option<RpcError> = None;
            for attempt in 1..=MESH_ATTEMPTS {
                match self.invoke_remote(scope, procedure, args.clone()).await {
                    Ok(result) => return Ok(result),
                    Err(e) if e.kind.is_transport() && attempt < MESH_ATTEMPTS => {
                        tracing::debug!(procedure, attempt, error = %e, "mesh forward retry");
                        last_transport = Some(e);
                    }
                    Err(e) => {
                        // A target that disconnected mid-forward also loses
                        // its catalogue entries; report the disconnect, not
                        // the NoRoute it left behind.
                        if e.kind == ErrorKind::NoRoute {
                            if let Some(transport) = last_transport {
                                return Err(transport);
                            }
                        }
                        return Err(e);
                    }
                }
            }
            if let Some(transport) = last_transport {
                return Err(transport);
            }
        }

        Err(RpcError::no_route(service))
    }
}
