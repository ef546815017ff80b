//! The public face of the gossip network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::P2pConfig;
use crate::controller::{Controller, ControllerChannels, MetricsHook};
use crate::error::{P2pError, P2pResult};
use crate::metrics::MetricsRegistry;
use crate::parcel::ParcelChannel;
use crate::peer::PeerMetrics;

/// Aggregate traffic of the network.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Info {
    /// Number of connected peers.
    pub peers: usize,
    /// Parcels per second received.
    pub receiving: f64,
    /// Parcels per second sent.
    pub sending: f64,
    /// Bytes per second received.
    pub download: f64,
    /// Bytes per second sent.
    pub upload: f64,
}

/// Builder for [`Network`].
pub struct NetworkBuilder {
    config: P2pConfig,
    rng_seed: Option<u64>,
    registry: Option<Arc<MetricsRegistry>>,
}

impl NetworkBuilder {
    pub fn new(config: P2pConfig) -> Self {
        Self {
            config,
            rng_seed: None,
            registry: None,
        }
    }

    /// Seed peer selection, making broadcast and CAT choices reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Keep the given registry current. A registry serves one network.
    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> P2pResult<Network> {
        let mut config = self.config;
        config.sanitize();
        config.check()?;

        if let Some(registry) = &self.registry {
            registry.claim()?;
        }

        let rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // never zero, so an unset nonce cannot match
        let instance_id = rand::thread_rng().gen_range(1..=u64::MAX);

        let to_network = ParcelChannel::new(config.channel_capacity);
        let from_network = ParcelChannel::new(config.channel_capacity);

        let (controller, channels) = Controller::new(
            config,
            instance_id,
            rng,
            to_network.clone(),
            from_network.clone(),
            self.registry,
        )?;

        Ok(Network {
            to_network,
            from_network,
            controller,
            channels: Mutex::new(Some(channels)),
        })
    }
}

/// A node's view of the gossip network.
///
/// Parcels written to `to_network` are routed by their address; parcels
/// received from peers appear on `from_network` with the sender's hash as
/// address.
pub struct Network {
    /// Application → network.
    pub to_network: ParcelChannel,
    /// Network → application.
    pub from_network: ParcelChannel,

    controller: Arc<Controller>,
    channels: Mutex<Option<ControllerChannels>>,
}

impl Network {
    /// Create a network with default seeding and no registry.
    pub fn new(config: P2pConfig) -> P2pResult<Self> {
        NetworkBuilder::new(config).build()
    }

    pub fn builder(config: P2pConfig) -> NetworkBuilder {
        NetworkBuilder::new(config)
    }

    /// Start listening and connecting. A network runs at most once.
    pub async fn run(&self) -> P2pResult<()> {
        if self.controller.shutdown_token().is_cancelled() {
            return Err(P2pError::Stopped);
        }
        let channels = self.channels.lock().take().ok_or(P2pError::AlreadyRunning)?;
        let started = self.controller.start(channels).await;
        if started.is_err() {
            self.controller.done_token().cancel();
        }
        started
    }

    /// Stop the network and disconnect every peer.
    pub fn stop(&self) -> P2pResult<()> {
        let token = self.controller.shutdown_token();
        if token.is_cancelled() {
            return Err(P2pError::Stopped);
        }
        token.cancel();
        self.to_network.close();
        Ok(())
    }

    /// Resolves once a stopped network has written its peer file and
    /// disconnected every peer. Returns at once for a network that never ran.
    pub async fn stopped(&self) {
        if self.channels.lock().is_some() {
            return;
        }
        self.controller.done_token().cancelled().await;
    }

    /// Ban the peer's ip and endpoint for the configured manual ban time.
    pub fn ban(&self, hash: impl Into<String>) {
        let hash = hash.into();
        let duration = self.controller.config().manual_ban;
        self.detach(move |c| c.ban(&hash, duration));
    }

    /// Drop the connection to a peer without banning it.
    pub fn disconnect(&self, hash: impl Into<String>) {
        let hash = hash.into();
        self.detach(move |c| c.disconnect(&hash));
    }

    /// Replace the special peer list with a comma separated `host:port` list.
    pub fn set_special(&self, raw: impl Into<String>) {
        let raw = raw.into();
        self.detach(move |c| c.set_special(&raw));
    }

    /// Run a controller action on the runtime, or inline outside of one.
    fn detach(&self, action: impl FnOnce(&Controller) + Send + 'static) {
        let controller = self.controller.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { action(&controller) });
            }
            Err(_) => action(&controller),
        }
    }

    pub fn get_info(&self) -> Info {
        let metrics = self.controller.make_metrics();
        metrics.values().fold(
            Info {
                peers: metrics.len(),
                ..Info::default()
            },
            |mut info, m| {
                info.receiving += m.mps_down;
                info.sending += m.mps_up;
                info.download += m.bps_down;
                info.upload += m.bps_up;
                info
            },
        )
    }

    /// Metrics of every connected peer, keyed by peer hash.
    pub fn get_peer_metrics(&self) -> HashMap<String, PeerMetrics> {
        self.controller.make_metrics()
    }

    /// Install a hook called with the peer metrics about once per second.
    pub fn set_metrics_hook(&self, hook: impl Fn(HashMap<String, PeerMetrics>) + Send + Sync + 'static) {
        let hook: MetricsHook = Box::new(hook);
        self.controller.set_metrics_hook(hook);
    }

    /// Number of connected peers.
    pub fn total(&self) -> usize {
        self.controller.peers.total()
    }

    /// Completed CAT rounds.
    pub fn rounds(&self) -> u64 {
        self.controller.rounds()
    }

    /// Address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.controller.local_addr()
    }

    /// Configuration in effect. The listen port is the bound one once running.
    pub fn config(&self) -> Arc<P2pConfig> {
        self.controller.config()
    }

    /// Per-process nonce used to detect connections to ourselves.
    pub fn instance_id(&self) -> u64 {
        self.controller.instance_id()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.controller.shutdown_token().cancel();
    }
}
