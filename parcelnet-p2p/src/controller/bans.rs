use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use crate::config::parse_special;
use crate::endpoint::Endpoint;

use super::Controller;

/// Banned addresses and special peers.
///
/// Bans are keyed by bare ip or by `ip:port`; either key matches an
/// endpoint.
#[derive(Debug, Default)]
pub(crate) struct BanTable {
    bans: HashMap<String, SystemTime>,
    special: Vec<Endpoint>,
    special_ips: HashSet<String>,
}

impl BanTable {
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &SystemTime)> {
        self.bans.iter()
    }

    /// Insert a ban. An existing ban is only ever extended.
    fn insert(&mut self, key: String, until: SystemTime) {
        let entry = self.bans.entry(key).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    pub(crate) fn restore(&mut self, bans: Vec<(String, SystemTime)>) {
        for (key, until) in bans {
            self.insert(key, until);
        }
    }

    fn active(&self, key: &str, now: SystemTime) -> bool {
        self.bans.get(key).is_some_and(|until| *until > now)
    }

    pub(crate) fn set_special(&mut self, special: Vec<Endpoint>) {
        self.special_ips = special.iter().map(|ep| ep.ip.clone()).collect();
        self.special = special;
    }

    fn purge(&mut self, now: SystemTime) {
        self.bans.retain(|_, until| *until > now);
    }
}

impl Controller {
    pub(crate) fn is_banned_ip(&self, ip: &str) -> bool {
        self.bans.read().active(ip, SystemTime::now())
    }

    pub(crate) fn is_banned_endpoint(&self, endpoint: &Endpoint) -> bool {
        let now = SystemTime::now();
        let bans = self.bans.read();
        bans.active(&endpoint.ip, now) || bans.active(&endpoint.to_string(), now)
    }

    /// Ban the endpoint's ip and the endpoint itself, then disconnect every
    /// peer on that ip.
    pub(crate) fn ban_endpoint(&self, endpoint: &Endpoint, duration: Duration) {
        let until = SystemTime::now() + duration;
        {
            let mut bans = self.bans.write();
            bans.purge(SystemTime::now());
            bans.insert(endpoint.ip.clone(), until);
            bans.insert(endpoint.to_string(), until);
        }

        tracing::info!(addr = %endpoint, duration = ?duration, "Banning endpoint");

        for peer in self.peers.slice() {
            if peer.endpoint.ip == endpoint.ip {
                peer.stop();
            }
        }
    }

    /// Ban only the exact `ip:port`. Used for our own listen address.
    pub(crate) fn ban_address(&self, endpoint: &Endpoint, duration: Duration) {
        let until = SystemTime::now() + duration;
        self.bans.write().insert(endpoint.to_string(), until);
        tracing::debug!(addr = %endpoint, "Banning own address");
    }

    /// Ban the peer with the given hash. Unknown hashes are ignored.
    pub(crate) fn ban(&self, hash: &str, duration: Duration) {
        match self.peers.get(hash) {
            Some(peer) => self.ban_endpoint(&peer.endpoint, duration),
            None => tracing::debug!(peer = %hash, "Ban of unknown peer ignored"),
        }
    }

    /// Disconnect the peer with the given hash. Unknown hashes are ignored.
    pub(crate) fn disconnect(&self, hash: &str) {
        if let Some(peer) = self.peers.get(hash) {
            tracing::debug!(peer = %hash, "Disconnecting peer");
            peer.stop();
        }
    }

    /// Replace the special peer list. An unparseable list is ignored.
    pub(crate) fn set_special(&self, raw: &str) {
        match parse_special(raw) {
            Ok(special) => {
                tracing::info!(count = special.len(), "Updated special peers");
                self.bans.write().set_special(special);
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring special peer list"),
        }
    }

    pub(crate) fn is_special(&self, endpoint: &Endpoint) -> bool {
        self.bans.read().special.iter().any(|s| s == endpoint)
    }

    pub(crate) fn is_special_ip(&self, ip: &str) -> bool {
        self.bans.read().special_ips.contains(ip)
    }

    pub(crate) fn special_endpoints(&self) -> Vec<Endpoint> {
        self.bans.read().special.clone()
    }
}
