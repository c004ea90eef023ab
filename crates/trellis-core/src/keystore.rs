//! Trusted key store — friendly name to RSA public key.
//!
//! Owned by the runtime, never persisted. Authentication resolves a
//! presented public key to a friendly name and succeeds only when the key
//! is present exactly once; a key trusted under two names is a fault.

use std::collections::HashMap;
use std::sync::RwLock;

use rsa::RsaPublicKey;
use thiserror::Error;

use crate::error::HandshakeError;

/// Map of friendly name → public key.
///
/// The lock is never held across network I/O; every operation copies what
/// it needs and releases.
pub struct TrustedKeyStore {
    entries: RwLock<HashMap<String, RsaPublicKey>>,
}

impl TrustedKeyStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the key for `name`.
    pub fn add(&self, name: impl Into<String>, key: RsaPublicKey) {
        self.entries.write().unwrap().insert(name.into(), key);
    }

    /// Insert `name → key`, rejecting a key that is already trusted under a
    /// different name. The key-identity check runs before the name check,
    /// so a conflicting key wins over a merely duplicate name.
    pub fn add_unique(&self, name: impl Into<String>, key: RsaPublicKey) -> Result<(), KeyStoreError> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.iter().find(|(n, k)| **k == key && **n != name) {
            return Err(KeyStoreError::DuplicateKey(existing.0.clone()));
        }
        if entries.contains_key(&name) {
            return Err(KeyStoreError::DuplicateName(name));
        }
        entries.insert(name, key);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<RsaPublicKey> {
        self.entries.read().unwrap().get(name).cloned()
    }

    /// Remove the entry for `name`. Returns whether anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().unwrap().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Resolve a presented public key to its friendly name.
    ///
    /// Exactly one match is required: zero matches is an untrusted peer,
    /// more than one means the key was registered more than once.
    pub fn name_of(&self, key: &RsaPublicKey) -> Result<String, HandshakeError> {
        let entries = self.entries.read().unwrap();
        let mut matches = entries.iter().filter(|(_, k)| *k == key);
        let first = matches.next();
        match (first, matches.next()) {
            (None, _) => Err(HandshakeError::UntrustedPeer),
            (Some(_), Some(_)) => Err(HandshakeError::AmbiguousPeer),
            (Some((name, _)), None) => Ok(name.clone()),
        }
    }
}

impl Default for TrustedKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("public key already trusted under {0:?}")]
    DuplicateKey(String),

    #[error("friendly name {0:?} already registered")]
    DuplicateName(String),
}
