//! Configuration system for a Trellis node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TRELLIS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trellis/config.toml
//!   3. ~/.config/trellis/config.toml

use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::public_key_from_der;

/// Top-level configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's friendly name, as peers will know it.
    pub friendly_name: String,
    /// Shared sign-in secret. Empty disables the token check at sign-in.
    pub token: String,
    /// Forward inbound calls for services other peers host.
    pub allow_mesh: bool,
    pub network: NetworkConfig,
    pub keys: KeyConfig,
    pub timeouts: TimeoutConfig,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: String,
    /// 0 = OS-assigned.
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Public key, PKCS#1 PEM. Generated alongside the private key.
    pub public_path: PathBuf,
    /// Private key, PKCS#8 PEM. Generated on first run if absent.
    pub private_path: PathBuf,
    /// Key size for generation. Tests use 2048; production stays at 8192.
    pub bits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-call timeout in milliseconds. -1 disables it.
    pub request_timeout_ms: i64,
    /// Delay between reconnect attempts to a configured peer.
    pub reconnect_delay_ms: u64,
}

/// One configured remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub friendly_name: String,
    /// `host:port` of the peer's RPC listener (the pair a sign-in exchange
    /// would have produced).
    pub address: String,
    /// Parallel forward channels, 1–255.
    pub connections: u8,
    /// Reverse channels to open and hand to the peer. 0 = none.
    pub reverse_connections: u8,
    /// The peer's public key, base64 PKCS#1 DER.
    pub trusted_public_key: String,
    /// Sign-in endpoint of the peer, for the external bootstrap flow.
    pub sign_in_url: String,
    /// Token presented at sign-in.
    pub token: String,
    /// Use this peer as a fallback route for unknown services.
    pub is_root: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            friendly_name: String::new(),
            token: String::new(),
            allow_mesh: false,
            network: NetworkConfig::default(),
            keys: KeyConfig::default(),
            timeouts: TimeoutConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 0,
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            public_path: config_dir().join("node.pub.pem"),
            private_path: config_dir().join("node.pem"),
            bits: 8192,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: -1,
            reconnect_delay_ms: 5000,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            friendly_name: String::new(),
            address: String::new(),
            connections: 1,
            reverse_connections: 0,
            trusted_public_key: String::new(),
            sign_in_url: String::new(),
            token: String::new(),
            is_root: false,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("trellis")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("peer {0:?}: trusted_public_key is not valid base64 PKCS#1: {1}")]
    BadPeerKey(String, String),
    #[error("peer {0:?}: connections must be between 1 and 255")]
    BadConnections(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NodeConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TRELLIS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NodeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for peer in &self.peers {
            if peer.connections == 0 {
                return Err(ConfigError::BadConnections(peer.friendly_name.clone()));
            }
            peer.decode_trusted_key()?;
        }
        Ok(())
    }

    /// The per-call timeout, or `None` when disabled (-1).
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.timeouts.request_timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeouts.request_timeout_ms as u64))
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.timeouts.reconnect_delay_ms)
    }

    /// Apply TRELLIS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRELLIS_FRIENDLY_NAME") {
            self.friendly_name = v;
        }
        if let Ok(v) = std::env::var("TRELLIS_NETWORK__LISTEN_ADDRESS") {
            self.network.listen_address = v;
        }
        if let Ok(v) = std::env::var("TRELLIS_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("TRELLIS_ALLOW_MESH") {
            self.allow_mesh = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TRELLIS_TIMEOUTS__REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.timeouts.request_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("TRELLIS_TIMEOUTS__RECONNECT_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                self.timeouts.reconnect_delay_ms = ms;
            }
        }
    }
}

impl PeerConfig {
    /// Decode `trusted_public_key` into an RSA public key.
    pub fn decode_trusted_key(&self) -> Result<RsaPublicKey, ConfigError> {
        let der = BASE64
            .decode(self.trusted_public_key.trim())
            .map_err(|e| ConfigError::BadPeerKey(self.friendly_name.clone(), e.to_string()))?;
        public_key_from_der(&der)
            .map_err(|e| ConfigError::BadPeerKey(self.friendly_name.clone(), e.to_string()))
    }
}

/// Encode a public key the way `trusted_public_key` expects it.
pub fn encode_trusted_key(der: &[u8]) -> String {
    BASE64.encode(der)
}
