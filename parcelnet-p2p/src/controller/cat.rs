//! Connect-And-Trim: keep the peer count near the target by dialing
//! candidates continuously and dropping random non-special peers each round.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};
use crate::parcel::{Parcel, ParcelType};
use crate::peer::Peer;

use super::Controller;

/// Extra dial attempts per cycle beyond the initial candidates, for
/// alternatives offered by refusing nodes.
const EXTRA_ATTEMPTS: usize = 5;

/// Pause between cycles that had nothing to do.
const IDLE_PAUSE: Duration = Duration::from_secs(1);

impl Controller {
    /// Run one CAT round: persist, then drop random non-special peers
    /// until only `drop_to` remain.
    pub(crate) fn cat_round(&self) {
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(registry) = &self.registry {
            registry.cat_rounds.inc();
        }

        let drop_to = self.config().drop_to;
        let mut peers = self.peers.slice();
        let excess = peers.len().saturating_sub(drop_to);
        tracing::debug!(round, peers = peers.len(), excess, "CAT round");
        if excess == 0 {
            return;
        }

        peers.shuffle(&mut *self.rng.lock());
        let victims: Vec<Arc<Peer>> = peers
            .into_iter()
            .filter(|p| !self.is_special(&p.endpoint))
            .take(excess)
            .collect();
        for peer in victims {
            tracing::debug!(peer = %peer.hash, "CAT dropping peer");
            peer.stop();
        }
    }

    /// True if dialing the endpoint would be pointless or disallowed.
    fn deny_dial(&self, endpoint: &Endpoint) -> bool {
        if self.peers.connected(endpoint) || self.is_banned_endpoint(endpoint) {
            return true;
        }
        if !self.dialer.can_dial(endpoint) {
            return true;
        }
        let limit = self.config().peer_ip_limit_outgoing;
        limit > 0 && self.peers.count(&endpoint.ip) >= limit
    }

    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep(IDLE_PAUSE) => true,
        }
    }

    pub(crate) async fn cat_replenish(self: Arc<Self>) {
        let mut first_run = true;

        while !self.shutdown.is_cancelled() {
            let config = self.config();
            if self.peers.total() >= config.target_peers {
                if !self.idle().await {
                    break;
                }
                continue;
            }

            let candidates = self.collect_candidates(first_run).await;
            first_run = false;

            let limit = candidates.len() + EXTRA_ATTEMPTS;
            let mut queue = VecDeque::from(candidates);
            let mut attempts = 0;
            while let Some(endpoint) = queue.pop_front() {
                if attempts >= limit || self.shutdown.is_cancelled() {
                    break;
                }
                if self.peers.total() >= config.target_peers {
                    break;
                }
                if self.deny_dial(&endpoint) {
                    continue;
                }

                attempts += 1;
                let (connected, alternatives) = self.dial(&endpoint).await;
                if !connected {
                    queue.extend(alternatives);
                }
            }

            if attempts == 0 && !self.idle().await {
                break;
            }
        }
        tracing::debug!("Replenish loop stopped");
    }

    /// Endpoints to dial this cycle, in priority order.
    async fn collect_candidates(&self, first_run: bool) -> Vec<Endpoint> {
        let mut candidates = Vec::new();

        if first_run {
            let bootstrap = std::mem::take(&mut *self.bootstrap.lock());
            candidates.extend(bootstrap.into_iter().filter(|ep| !self.deny_dial(ep)));
        }

        for special in self.special_endpoints() {
            if !self.deny_dial(&special) {
                candidates.push(special);
            }
        }

        if self.peers.total() <= self.config().min_reseed {
            let mut seeds = self.seed.retrieve().await;
            seeds.shuffle(&mut *self.rng.lock());
            candidates.extend(seeds.into_iter().filter(|ep| !self.deny_dial(ep)));
        }

        if candidates.is_empty() {
            if let Some(endpoint) = self.endpoint_from_share().await {
                candidates.push(endpoint);
            }
        }

        candidates
    }

    /// Ask a random peer for a share and pick one endpoint from it.
    async fn endpoint_from_share(&self) -> Option<Endpoint> {
        let interval = self.config().peer_request_interval;
        let peer = {
            let peers: Vec<Arc<Peer>> = self
                .peers
                .slice()
                .into_iter()
                .filter(|p| p.can_request_share(interval))
                .collect();
            peers.choose(&mut *self.rng.lock())?.clone()
        };
        if !peer.take_peer_send(interval) {
            return None;
        }

        match self.request_share(&peer).await {
            Ok(share) => {
                let share: Vec<Endpoint> = share.into_iter().filter(|ep| !self.deny_dial(ep)).collect();
                share.choose(&mut *self.rng.lock()).cloned()
            }
            Err(e) => {
                tracing::debug!(peer = %peer.hash, error = %e, "No peer share");
                None
            }
        }
    }

    /// Request a share from a peer and wait for the response.
    pub(crate) async fn request_share(&self, peer: &Arc<Peer>) -> P2pResult<Vec<Endpoint>> {
        let (tx, rx) = oneshot::channel();
        self.share_listeners.lock().insert(peer.hash.clone(), tx);
        peer.send(Parcel::new(ParcelType::PeerRequest, "Peer Request"));

        let response = timeout(self.config().peer_share_timeout, rx).await;
        self.share_listeners.lock().remove(&peer.hash);

        match response {
            Ok(Ok(parcel)) => Ok(self.process_peer_share(peer, &parcel)),
            _ => Err(P2pError::ShareTimeout),
        }
    }

    /// Parse a peer share. A share with any invalid entry is discarded
    /// whole; banned entries are filtered.
    pub(crate) fn process_peer_share(&self, peer: &Peer, parcel: &Parcel) -> Vec<Endpoint> {
        let list = match peer.protocol().parse_peer_share(&parcel.payload) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(peer = %peer.hash, error = %e, "Failed to parse peer share");
                return Vec::new();
            }
        };

        if let Some(bad) = list.iter().find(|ep| !ep.valid()) {
            tracing::warn!(peer = %peer.hash, endpoint = %bad, "Peer share contains an invalid endpoint");
            return Vec::new();
        }

        let list: Vec<Endpoint> = list
            .into_iter()
            .filter(|ep| !self.is_banned_endpoint(ep))
            .collect();
        if let Some(registry) = &self.registry {
            registry.known_peers.set(list.len() as i64);
        }
        self.trim_share(list)
    }

    fn trim_share(&self, mut list: Vec<Endpoint>) -> Vec<Endpoint> {
        let amount = self.config().peer_share_amount;
        if list.len() > amount {
            list.shuffle(&mut *self.rng.lock());
            list.truncate(amount);
        }
        list
    }

    /// A random selection of connected endpoints, excluding `exclude`.
    pub(crate) fn make_peer_share(&self, exclude: &Endpoint) -> Vec<Endpoint> {
        let list: Vec<Endpoint> = self
            .peers
            .slice()
            .iter()
            .filter(|p| p.endpoint != *exclude)
            .map(|p| p.endpoint.clone())
            .collect();
        self.trim_share(list)
    }

    /// Answer a share request from `peer`.
    pub(crate) fn share_peers(&self, peer: &Peer, share: &[Endpoint]) {
        match peer.protocol().make_peer_share(share) {
            Ok(payload) => {
                peer.send(Parcel::new(ParcelType::PeerResponse, payload));
            }
            Err(e) => tracing::warn!(peer = %peer.hash, error = %e, "Failed to encode peer share"),
        }
    }

    /// Random index in `0..len`, `None` if `len` is zero.
    pub(crate) fn random_index(&self, len: usize) -> Option<usize> {
        (len > 0).then(|| self.rng.lock().gen_range(0..len))
    }
}
