//! Error taxonomy for the Trellis wire protocol and transport.
//!
//! Two layers:
//!   1. `RpcError` — structured `{kind, message}` errors that travel inside
//!      response frames and are re-raised on the caller's side.
//!   2. `ChannelError` / `HandshakeError` — transport-level failures that
//!      never cross the wire; they terminate channels or handshakes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Wire-carried errors ───────────────────────────────────────────────────────

/// Classification of a wire-carried error.
///
/// Authentication kinds are fatal to the connection and never retried.
/// Routing and transport kinds terminate the call. `Application` carries
/// an error raised by a service implementation, with kind and message
/// preserved across the wire (stack frames are not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Presented public key is not in the trusted key store.
    UntrustedPeer,
    /// Presented public key appears under more than one friendly name.
    AmbiguousPeer,
    /// Handshake decryption or signature verification failed.
    BadHandshake,
    /// Procedure string is not of the form `"service.method"`.
    BadProcedure,
    /// No peer hosts the service and no root fallback is configured.
    NoRoute,
    /// The target peer disconnected while the call was in flight.
    PeerDisconnected,
    /// The configured per-call timeout expired.
    Timeout,
    /// The local runtime is shutting down.
    Shutdown,
    /// An error raised by a service implementation.
    Application,
}

impl ErrorKind {
    pub fn is_authentication(self) -> bool {
        matches!(
            self,
            ErrorKind::UntrustedPeer | ErrorKind::AmbiguousPeer | ErrorKind::BadHandshake
        )
    }

    pub fn is_transport(self) -> bool {
        matches!(
            self,
            ErrorKind::PeerDisconnected | ErrorKind::Timeout | ErrorKind::Shutdown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::UntrustedPeer => "untrusted peer",
            ErrorKind::AmbiguousPeer => "ambiguous peer",
            ErrorKind::BadHandshake => "bad handshake",
            ErrorKind::BadProcedure => "bad procedure",
            ErrorKind::NoRoute => "no route",
            ErrorKind::PeerDisconnected => "peer disconnected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Application => "application error",
        };
        f.write_str(s)
    }
}

/// A structured error as carried in response frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_procedure(procedure: &str) -> Self {
        Self::new(
            ErrorKind::BadProcedure,
            format!("malformed procedure name {procedure:?}"),
        )
    }

    pub fn no_route(service: &str) -> Self {
        Self::new(
            ErrorKind::NoRoute,
            format!("no peer hosts service {service:?} and no root peer is configured"),
        )
    }

    pub fn peer_disconnected(peer: &str) -> Self {
        Self::new(ErrorKind::PeerDisconnected, format!("peer {peer:?} disconnected"))
    }

    pub fn timeout(ms: i64) -> Self {
        Self::new(ErrorKind::Timeout, format!("no response within {ms} ms"))
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "runtime is shutting down")
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }
}

// ── Transport-level errors ────────────────────────────────────────────────────

/// Failure modes of the handshake. All are fatal to the connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer public key is not in the trusted key store")]
    UntrustedPeer,

    #[error("peer public key is registered more than once")]
    AmbiguousPeer,

    #[error("handshake failed: {0}")]
    Bad(String),

    #[error("i/o during handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// The wire-error equivalent, for surfacing to callers.
    pub fn to_rpc(&self) -> RpcError {
        match self {
            HandshakeError::UntrustedPeer => {
                RpcError::new(ErrorKind::UntrustedPeer, self.to_string())
            }
            HandshakeError::AmbiguousPeer => {
                RpcError::new(ErrorKind::AmbiguousPeer, self.to_string())
            }
            HandshakeError::Bad(_) | HandshakeError::Io(_) => {
                RpcError::new(ErrorKind::BadHandshake, self.to_string())
            }
        }
    }
}

/// Failure modes of an established secure channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream or sent the zero-length disconnect marker.
    #[error("peer disconnected")]
    Disconnected,

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },

    /// Decryption failed. The key streams are out of lockstep and the
    /// channel must be torn down.
    #[error("frame decryption failed; channel is desynchronized")]
    Broken,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer sent a well-encrypted frame that violates the protocol,
    /// e.g. a catalogue payload that does not decode.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Reconnection was requested on a channel the peer originated.
    #[error("accepted channels do not reconnect")]
    NotReconnectable,
}
