//! Lifecycle and observability events.
//!
//! Every subsystem reports through one broadcast channel owned by the
//! runtime. Slow or absent subscribers never block the mesh; the channel
//! drops the oldest events when a receiver lags.

use std::time::Duration;

use tokio::sync::broadcast;

use trellis_core::ScopeId;

/// Capacity of the event channel. Lagging receivers lose oldest-first.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer completed its first handshake with this node.
    PeerConnected { peer: String },
    /// A peer was torn down: catalogue, trust entry, and pending calls
    /// for it are gone.
    PeerDisconnected { peer: String },
    /// A peer granted this side request capability on one of its channels.
    ChannelReverted { peer: String },
    /// An inbound request finished, successfully or not.
    InboundCompleted {
        peer: String,
        procedure: String,
        scope: Option<ScopeId>,
        duration: Duration,
        error: bool,
        /// The request was serviced by re-issuing it to another peer.
        forwarded: bool,
    },
    /// A reconnect attempt to a configured peer failed; another will follow.
    ReconnectFailed { peer: String, error: String },
}

pub(crate) fn channel() -> broadcast::Sender<NodeEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
