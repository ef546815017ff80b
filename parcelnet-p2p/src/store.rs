//! Registry of connected peers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};
use crate::peer::Peer;

#[derive(Default)]
struct StoreInner {
    peers: HashMap<String, Arc<Peer>>,
    /// Connections per ip.
    by_ip: HashMap<String, usize>,
    /// Connections per endpoint.
    by_endpoint: HashMap<Endpoint, usize>,
    incoming: usize,
    outgoing: usize,
    /// Snapshot handed out by `slice`, dropped on every change.
    cache: Option<Vec<Arc<Peer>>>,
}

fn decrement<K: std::hash::Hash + Eq>(map: &mut HashMap<K, usize>, key: &K) {
    if let Some(count) = map.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// Thread safe peer registry keyed by peer hash.
#[derive(Default)]
pub struct PeerStore {
    inner: RwLock<StoreInner>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. A peer with the same hash must be removed first.
    pub fn add(&self, peer: Arc<Peer>) -> P2pResult<()> {
        let mut inner = self.inner.write();
        if inner.peers.contains_key(&peer.hash) {
            return Err(P2pError::DuplicatePeer(peer.hash.clone()));
        }

        *inner.by_ip.entry(peer.endpoint.ip.clone()).or_default() += 1;
        *inner.by_endpoint.entry(peer.endpoint.clone()).or_default() += 1;
        if peer.is_incoming {
            inner.incoming += 1;
        } else {
            inner.outgoing += 1;
        }
        inner.peers.insert(peer.hash.clone(), peer);
        inner.cache = None;
        Ok(())
    }

    /// Remove exactly this peer. A different peer registered under the
    /// same hash is left alone.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut inner = self.inner.write();
        match inner.peers.get(&peer.hash) {
            Some(stored) if Arc::ptr_eq(stored, peer) => {}
            _ => return false,
        }

        inner.peers.remove(&peer.hash);
        decrement(&mut inner.by_ip, &peer.endpoint.ip);
        decrement(&mut inner.by_endpoint, &peer.endpoint);
        if peer.is_incoming {
            inner.incoming -= 1;
        } else {
            inner.outgoing -= 1;
        }
        inner.cache = None;
        true
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(hash).cloned()
    }

    /// Number of connections with the given ip.
    pub fn count(&self, ip: &str) -> usize {
        self.inner.read().by_ip.get(ip).copied().unwrap_or(0)
    }

    /// True if a peer with this endpoint is connected.
    pub fn connected(&self, endpoint: &Endpoint) -> bool {
        self.inner.read().by_endpoint.contains_key(endpoint)
    }

    pub fn total(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn incoming(&self) -> usize {
        self.inner.read().incoming
    }

    pub fn outgoing(&self) -> usize {
        self.inner.read().outgoing
    }

    /// All peers. The snapshot is cached until the next change.
    pub fn slice(&self) -> Vec<Arc<Peer>> {
        if let Some(cache) = &self.inner.read().cache {
            return cache.clone();
        }

        let mut inner = self.inner.write();
        if inner.cache.is_none() {
            let peers: Vec<Arc<Peer>> = inner.peers.values().cloned().collect();
            inner.cache = Some(peers);
        }
        inner.cache.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkId, P2pConfig};
    use crate::protocol::{Protocol, Traffic};
    use rand::{Rng, SeedableRng};
    use tokio::sync::mpsc;

    fn peer(ip: &str, port: &str, node_id: u32, incoming: bool) -> Arc<Peer> {
        let config = P2pConfig::new(NetworkId::TEST_NET);
        let (status, _) = mpsc::unbounded_channel();
        Peer::new(
            &config,
            Endpoint::new(ip, port).unwrap(),
            node_id,
            incoming,
            Protocol::for_version(10, &config),
            Traffic::new(),
            status,
        )
    }

    fn assert_counts(store: &PeerStore) {
        let inner = store.inner.read();
        assert_eq!(inner.incoming + inner.outgoing, inner.peers.len());
        assert_eq!(inner.by_ip.values().sum::<usize>(), inner.peers.len());
        assert_eq!(inner.by_endpoint.values().sum::<usize>(), inner.peers.len());
    }

    #[test]
    fn test_add_remove() {
        let store = PeerStore::new();
        let a = peer("10.0.0.1", "8108", 1, true);
        let b = peer("10.0.0.1", "8109", 2, false);

        store.add(a.clone()).unwrap();
        store.add(b.clone()).unwrap();
        assert_eq!(store.total(), 2);
        assert_eq!(store.incoming(), 1);
        assert_eq!(store.outgoing(), 1);
        assert_eq!(store.count("10.0.0.1"), 2);
        assert!(store.connected(&a.endpoint));
        assert!(Arc::ptr_eq(&store.get(&a.hash).unwrap(), &a));

        assert!(store.remove(&a));
        assert!(!store.remove(&a));
        assert_eq!(store.total(), 1);
        assert_eq!(store.count("10.0.0.1"), 1);
        assert!(!store.connected(&a.endpoint));
        assert_counts(&store);
    }

    #[test]
    fn test_duplicate_hash_rejected() {
        let store = PeerStore::new();
        let a = peer("10.0.0.1", "8108", 1, true);
        let twin = peer("10.0.0.1", "8108", 1, false);

        store.add(a.clone()).unwrap();
        assert!(matches!(store.add(twin.clone()), Err(P2pError::DuplicatePeer(_))));
        assert_eq!(store.total(), 1);
        assert_eq!(store.incoming(), 1);
        assert_eq!(store.outgoing(), 0);

        // the twin shares the hash but is a different peer
        assert!(!store.remove(&twin));
        assert!(Arc::ptr_eq(&store.get(&a.hash).unwrap(), &a));
    }

    #[test]
    fn test_slice_cache_invalidated() {
        let store = PeerStore::new();
        assert!(store.slice().is_empty());

        let a = peer("10.0.0.1", "1", 1, true);
        store.add(a.clone()).unwrap();
        assert_eq!(store.slice().len(), 1);
        assert_eq!(store.slice().len(), 1);

        store.remove(&a);
        assert!(store.slice().is_empty());
    }

    #[test]
    fn test_random_operations_keep_counts() {
        let store = PeerStore::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let pool: Vec<Arc<Peer>> = (0..40)
            .map(|i| {
                peer(
                    &format!("10.0.0.{}", i % 5),
                    &format!("{}", 8000 + i % 3),
                    i % 13,
                    i % 2 == 0,
                )
            })
            .collect();

        for _ in 0..2000 {
            let p = &pool[rng.gen_range(0..pool.len())];
            if rng.gen_bool(0.6) {
                let before = store.total();
                if store.add(p.clone()).is_err() {
                    assert_eq!(store.total(), before);
                }
            } else {
                store.remove(p);
            }
            assert_counts(&store);
            assert_eq!(store.slice().len(), store.total());
        }
    }
}
