//! The controller.
//!
//! Owns the peer store and runs the network's tasks:
//!
//! ```text
//! Controller::start()
//! ├── accept loop      (incoming connections → handshake → peer)
//! ├── route loop       (to_network → peers)
//! ├── data loop        (peers → pong, peer shares, from_network)
//! ├── online loop      (peer online/offline → peer store)
//! ├── replenish loop   (dial candidates until the target is reached)
//! └── run loop, 1s     (CAT rounds, persistence, pings, metrics)
//! ```

mod bans;
mod cat;
mod connections;
mod routing;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{parse_special, P2pConfig};
use crate::discovery::{load_state, save_state, PersistState, Seed};
use crate::endpoint::Endpoint;
use crate::error::P2pResult;
use crate::manager::{Dialer, LimitedListener};
use crate::metrics::MetricsRegistry;
use crate::parcel::{Parcel, ParcelChannel, ParcelType};
use crate::peer::{PeerMetrics, PeerParcel, PeerStatus};
use crate::store::PeerStore;

pub(crate) use bans::BanTable;

/// Capacity of the peer → controller data channel.
const DATA_CHANNEL_CAPACITY: usize = 1024;

/// Called about once per second with the metrics of every connected peer.
pub type MetricsHook = Box<dyn Fn(HashMap<String, PeerMetrics>) + Send + Sync>;

/// Receiving ends the controller's loops consume once started.
pub(crate) struct ControllerChannels {
    data: mpsc::Receiver<PeerParcel>,
    status: mpsc::UnboundedReceiver<PeerStatus>,
}

/// Timestamps of the periodic jobs of the run loop.
struct Schedule {
    last_round: Instant,
    last_persist: Instant,
}

pub(crate) struct Controller {
    config: RwLock<Arc<P2pConfig>>,
    instance_id: u64,

    pub(crate) peers: PeerStore,
    dialer: Dialer,
    seed: Seed,
    bans: RwLock<BanTable>,
    bootstrap: Mutex<Vec<Endpoint>>,
    share_listeners: Mutex<HashMap<String, oneshot::Sender<Parcel>>>,

    to_network: ParcelChannel,
    from_network: ParcelChannel,
    data_tx: mpsc::Sender<PeerParcel>,
    status_tx: mpsc::UnboundedSender<PeerStatus>,

    rng: Mutex<StdRng>,
    rounds: AtomicU64,
    schedule: Mutex<Schedule>,
    registry: Option<Arc<MetricsRegistry>>,
    metrics_hook: RwLock<Option<MetricsHook>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    /// Cancelled once the run loop has persisted state and stopped all peers.
    done: CancellationToken,
}

impl Controller {
    pub(crate) fn new(
        config: P2pConfig,
        instance_id: u64,
        rng: StdRng,
        to_network: ParcelChannel,
        from_network: ParcelChannel,
        registry: Option<Arc<MetricsRegistry>>,
    ) -> P2pResult<(Arc<Self>, ControllerChannels)> {
        let dialer = Dialer::new(&config.bind_ip, config.redial_interval, config.dial_timeout)?;
        let seed = Seed::new(
            config.seed_url.clone(),
            config.peer_reseed_interval,
            config.dial_timeout * 2,
        );

        let mut bans = BanTable::default();
        if !config.special.is_empty() {
            bans.set_special(parse_special(&config.special)?);
        }

        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let now = Instant::now();
        let controller = Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            instance_id,
            peers: PeerStore::new(),
            dialer,
            seed,
            bans: RwLock::new(bans),
            bootstrap: Mutex::new(Vec::new()),
            share_listeners: Mutex::new(HashMap::new()),
            to_network,
            from_network,
            data_tx,
            status_tx,
            rng: Mutex::new(rng),
            rounds: AtomicU64::new(0),
            schedule: Mutex::new(Schedule {
                last_round: now,
                last_persist: now,
            }),
            registry,
            metrics_hook: RwLock::new(None),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        });

        Ok((
            controller,
            ControllerChannels {
                data: data_rx,
                status: status_rx,
            },
        ))
    }

    pub(crate) fn config(&self) -> Arc<P2pConfig> {
        self.config.read().clone()
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub(crate) fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn done_token(&self) -> &CancellationToken {
        &self.done
    }

    pub(crate) fn set_metrics_hook(&self, hook: MetricsHook) {
        *self.metrics_hook.write() = Some(hook);
    }

    /// Bind the listener, restore persisted state and spawn all loops.
    pub(crate) async fn start(self: &Arc<Self>, channels: ControllerChannels) -> P2pResult<()> {
        let config = self.config();
        let bind_ip = if config.bind_ip.is_empty() {
            "0.0.0.0"
        } else {
            config.bind_ip.as_str()
        };
        let address = Endpoint {
            ip: bind_ip.to_string(),
            port: config.listen_port.clone(),
        }
        .connect_address();

        let listener = LimitedListener::bind(&address, config.listen_limit).await?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);

        // a listen port of 0 resolves to the port actually bound
        let port = local.port().to_string();
        if port != config.listen_port {
            let mut updated = (*config).clone();
            updated.listen_port = port;
            *self.config.write() = Arc::new(updated);
        }

        self.restore().await;

        tracing::info!(
            addr = %local,
            network = %config.network,
            node = %config.node_name,
            version = config.protocol_version,
            "Starting P2P network"
        );

        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().route());
        tokio::spawn(self.clone().manage_data(channels.data));
        tokio::spawn(self.clone().manage_online(channels.status));
        tokio::spawn(self.clone().cat_replenish());
        tokio::spawn(self.clone().run_loop());
        Ok(())
    }

    /// Load bans and bootstrap peers from the peer file.
    async fn restore(&self) {
        let config = self.config();
        let Some(path) = &config.persist_file else {
            return;
        };

        match load_state(path, config.persist_age).await {
            Ok(state) => {
                let now = SystemTime::now();
                self.bans.write().restore(state.active_bans(now));
                *self.bootstrap.lock() = state.bootstrap;
            }
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Unable to load peer file, starting empty");
            }
        }
    }

    /// Write bans and connected endpoints to the peer file.
    pub(crate) async fn persist(&self) {
        let config = self.config();
        let Some(path) = &config.persist_file else {
            return;
        };

        let state = {
            let bans = self.bans.read();
            let bootstrap = self
                .peers
                .slice()
                .iter()
                .map(|p| p.endpoint.clone())
                .collect();
            PersistState::new(bans.entries(), bootstrap, SystemTime::now())
        };

        if let Err(e) = save_state(path, &state).await {
            tracing::warn!(path = ?path, error = %e, "Unable to persist peer file");
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let config = self.config();
            let (round_due, persist_due) = {
                let mut schedule = self.schedule.lock();
                let round_due = schedule.last_round.elapsed() >= config.round_time;
                if round_due {
                    schedule.last_round = Instant::now();
                }
                let persist_due = schedule.last_persist.elapsed() >= config.persist_interval;
                if persist_due || round_due {
                    schedule.last_persist = Instant::now();
                }
                (round_due, persist_due)
            };

            if round_due {
                self.persist().await;
                self.cat_round();
            } else if persist_due {
                self.persist().await;
            }

            self.ping_idle(config.ping_interval);
            self.update_metrics();
        }

        tracing::info!("Shutting down P2P network");
        self.persist().await;
        for peer in self.peers.slice() {
            peer.stop();
        }
        self.from_network.close();
        self.done.cancel();
    }

    /// Ping every peer that was not written to for `idle`.
    fn ping_idle(&self, idle: Duration) {
        for peer in self.peers.slice() {
            let quiet = peer.last_send().elapsed().unwrap_or_default();
            if quiet >= idle {
                peer.send(Parcel::new(ParcelType::Ping, "Ping"));
            }
        }
    }

    pub(crate) fn make_metrics(&self) -> HashMap<String, PeerMetrics> {
        self.peers
            .slice()
            .iter()
            .map(|p| (p.hash.clone(), p.metrics()))
            .collect()
    }

    fn update_metrics(&self) {
        let hook = self.metrics_hook.read();
        if hook.is_none() && self.registry.is_none() {
            return;
        }

        let metrics = self.make_metrics();
        if let Some(registry) = &self.registry {
            let (down, up, dropped) = metrics.values().fold((0.0, 0.0, 0), |acc, m| {
                (acc.0 + m.bps_down, acc.1 + m.bps_up, acc.2 + m.dropped)
            });
            registry.bytes_down_rate.set(down as i64);
            registry.bytes_up_rate.set(up as i64);
            registry.dropped.set(dropped as i64);
        }
        if let Some(hook) = hook.as_ref() {
            hook(metrics);
        }
    }

    fn update_gauges(&self) {
        if let Some(registry) = &self.registry {
            registry.connections.set(self.peers.total() as i64);
            registry.incoming.set(self.peers.incoming() as i64);
            registry.outgoing.set(self.peers.outgoing() as i64);
        }
    }
}
