//! trellis-core — wire protocol, secure transport, and configuration for
//! the Trellis RPC mesh. The runtime crate builds on this one.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod keystore;
pub mod transaction;

pub use rsa::RsaPublicKey;

pub use channel::{Inbound, SecureChannel};
pub use config::{NodeConfig, PeerConfig};
pub use crypto::NodeIdentity;
pub use error::{ChannelError, ErrorKind, HandshakeError, RpcError};
pub use keystore::TrustedKeyStore;
pub use transaction::{ScopeId, Transaction};
