//! Service catalogue — which peers host which services.
//!
//! A concurrent multimap from service name to peer names. Entries are
//! added when a peer advertises a service and removed in bulk when that
//! peer disconnects. Reads are snapshots; peer churn during a lookup never
//! panics or blocks callers.

use std::collections::HashSet;

use dashmap::DashMap;

pub struct ServiceCatalogue {
    map: DashMap<String, HashSet<String>>,
}

impl ServiceCatalogue {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn add(&self, service: impl Into<String>, peer: impl Into<String>) {
        self.map
            .entry(service.into())
            .or_default()
            .insert(peer.into());
    }

    /// Register every service a peer advertised in its catalogue frame.
    pub fn add_many(&self, peer: &str, services: &[String]) {
        for service in services {
            self.add(service.clone(), peer);
        }
    }

    pub fn contains(&self, service: &str) -> bool {
        self.map.get(service).is_some_and(|peers| !peers.is_empty())
    }

    /// Snapshot of the peers hosting `service`.
    pub fn lookup(&self, service: &str) -> HashSet<String> {
        self.map
            .get(service)
            .map(|peers| peers.clone())
            .unwrap_or_default()
    }

    /// Drop every entry whose value is `peer`. Services left with no
    /// hosting peer disappear from the catalogue entirely.
    pub fn remove_by_peer(&self, peer: &str) {
        self.map.retain(|_, peers| {
            peers.remove(peer);
            !peers.is_empty()
        });
    }

    /// All service names currently advertised by any peer.
    pub fn services(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for ServiceCatalogue {
    fn default() -> Self {
        Self::new()
    }
}
