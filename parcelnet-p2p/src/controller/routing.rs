use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;

use crate::config::{BROADCAST, FULL_BROADCAST, RANDOM_PEER};
use crate::parcel::{Parcel, ParcelType};
use crate::peer::{Peer, PeerParcel};
use crate::resend::payload_hash;

use super::Controller;

impl Controller {
    /// Route application parcels from `to_network` to peers.
    pub(crate) async fn route(self: Arc<Self>) {
        loop {
            let parcel = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                parcel = self.to_network.recv() => match parcel {
                    Some(parcel) => parcel,
                    None => break,
                },
            };

            if let Some(registry) = &self.registry {
                registry.app_sent.inc();
            }

            match parcel.address.clone().as_str() {
                FULL_BROADCAST => self.broadcast(&parcel, true),
                BROADCAST => self.broadcast(&parcel, false),
                RANDOM_PEER | "" => self.send_random(parcel),
                hash => self.send_to(hash, parcel),
            }
        }
        tracing::debug!("Route loop stopped");
    }

    /// Send to every peer, or to a fanout selection. Peers that recently
    /// sent us the same payload are skipped.
    pub(crate) fn broadcast(&self, parcel: &Parcel, full: bool) {
        let config = self.config();
        let hash = config.peer_resend.then(|| payload_hash(&parcel.payload));

        let peers: Vec<Arc<Peer>> = self
            .peers
            .slice()
            .into_iter()
            .filter(|p| hash.map_or(true, |h| !p.has_sent(&h)))
            .collect();

        let selection = if full {
            peers
        } else {
            self.select_broadcast_peers(peers, config.fanout)
        };

        for peer in selection {
            self.deliver(&peer, parcel.clone());
        }
    }

    /// Every special peer plus random regular peers up to `fanout`.
    fn select_broadcast_peers(&self, peers: Vec<Arc<Peer>>, fanout: usize) -> Vec<Arc<Peer>> {
        if peers.len() <= fanout {
            return peers;
        }

        let (mut selection, mut regular): (Vec<_>, Vec<_>) =
            peers.into_iter().partition(|p| self.is_special(&p.endpoint));

        let room = fanout.saturating_sub(selection.len());
        regular.shuffle(&mut *self.rng.lock());
        regular.truncate(room);
        selection.extend(regular);
        selection
    }

    fn send_random(&self, parcel: Parcel) {
        let peers = self.peers.slice();
        match self.random_index(peers.len()) {
            Some(i) => self.deliver(&peers[i], parcel),
            None => tracing::debug!("No peer to send random parcel to"),
        }
    }

    /// Send to the peer with the given hash. Unknown peers drop the parcel.
    fn send_to(&self, hash: &str, parcel: Parcel) {
        match self.peers.get(hash) {
            Some(peer) => self.deliver(&peer, parcel),
            None => tracing::trace!(peer = %hash, "Dropping parcel for unknown peer"),
        }
    }

    fn deliver(&self, peer: &Peer, parcel: Parcel) {
        if peer.send(parcel) {
            if let Some(registry) = &self.registry {
                registry.parcels_sent.inc();
            }
        }
    }

    /// Handle parcels received from peers.
    pub(crate) async fn manage_data(self: Arc<Self>, mut data: mpsc::Receiver<PeerParcel>) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = data.recv() => match received {
                    Some(received) => received,
                    None => break,
                },
            };
            self.handle_parcel(received);
        }
        tracing::debug!("Data loop stopped");
    }

    pub(crate) fn handle_parcel(&self, received: PeerParcel) {
        let PeerParcel { peer, mut parcel } = received;

        if let Some(registry) = &self.registry {
            registry.parcels_received.inc();
        }

        if peer.is_stopped() && !parcel.is_application_message() {
            tracing::trace!(peer = %peer.hash, kind = %parcel.kind, "Dropping parcel from stopped peer");
            return;
        }

        match parcel.kind {
            ParcelType::Ping => {
                peer.send(Parcel::new(ParcelType::Pong, "Pong"));
            }
            ParcelType::Pong => {}
            ParcelType::PeerRequest => {
                if peer.take_peer_request(self.config().peer_request_interval) {
                    let share = self.make_peer_share(&peer.endpoint);
                    self.share_peers(&peer, &share);
                } else {
                    tracing::warn!(peer = %peer.hash, "Peer requested a share too quickly");
                }
            }
            ParcelType::PeerResponse => {
                if let Some(listener) = self.share_listeners.lock().remove(&peer.hash) {
                    let _ = listener.send(parcel);
                }
            }
            ParcelType::Message | ParcelType::MessagePart => {
                parcel.kind = ParcelType::Message;
                if self.from_network.send(parcel) {
                    if let Some(registry) = &self.registry {
                        registry.app_received.inc();
                    }
                }
            }
            other => {
                tracing::debug!(peer = %peer.hash, kind = %other, "Ignoring unexpected parcel");
            }
        }
    }
}
