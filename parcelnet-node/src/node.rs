//! Node orchestrator.
//!
//! Runs the gossip network, logs what arrives and optionally broadcasts a
//! heartbeat.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use parcelnet_p2p::{Network, Parcel, BROADCAST};

use crate::config::NodeConfig;
use crate::shutdown::wait_for_shutdown_signal;

/// How often network totals are logged.
const INFO_INTERVAL: Duration = Duration::from_secs(60);

/// The main node structure.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,

    /// The gossip network.
    network: Network,
}

impl Node {
    /// Create a new node with the given configuration.
    pub fn new(config: NodeConfig) -> anyhow::Result<Self> {
        if let Some(path) = &config.peer_file {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let network = Network::new(config.p2p_config())?;
        Ok(Self { config, network })
    }

    /// Run the node until a shutdown signal arrives.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!("Starting parcelnet node...");
        tracing::info!("  Network: {}", self.config.network);
        tracing::info!("  Node name: {}", self.config.node_name);
        tracing::info!("  Listen port: {}", self.config.listen_port);
        tracing::info!("  Protocol version: {}", self.config.protocol_version);
        if let Some(path) = &self.config.peer_file {
            tracing::info!("  Peer file: {:?}", path);
        }

        self.network.run().await?;
        if let Some(addr) = self.network.local_addr() {
            tracing::info!(addr = %addr, instance = self.network.instance_id(), "Network running");
        }

        let mut info_timer = interval(INFO_INTERVAL);
        info_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let heartbeat_every = self.config.broadcast_interval;
        let mut heartbeat_timer = interval(heartbeat_every.unwrap_or(INFO_INTERVAL));
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beats: u64 = 0;

        let shutdown = wait_for_shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                parcel = self.network.from_network.recv() => {
                    let Some(parcel) = parcel else {
                        tracing::info!("Network closed");
                        break;
                    };
                    tracing::info!(
                        from = %parcel.address,
                        bytes = parcel.payload.len(),
                        "Received parcel"
                    );
                }

                _ = info_timer.tick() => {
                    let info = self.network.get_info();
                    tracing::info!(
                        peers = info.peers,
                        receiving = format_args!("{:.2}", info.receiving),
                        sending = format_args!("{:.2}", info.sending),
                        download = format_args!("{:.0}", info.download),
                        upload = format_args!("{:.0}", info.upload),
                        rounds = self.network.rounds(),
                        "Network info"
                    );
                }

                _ = heartbeat_timer.tick(), if heartbeat_every.is_some() => {
                    beats += 1;
                    let payload = format!("heartbeat {} from {}", beats, self.config.node_name);
                    self.network.to_network.send(Parcel::message(BROADCAST, payload));
                }
            }
        }

        tracing::info!("Shutting down...");
        self.network.stop()?;
        self.network.stopped().await;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_creates_peer_file_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("peers.json");
        let config = NodeConfig {
            listen_port: "0".to_string(),
            peer_file: Some(path.clone()),
            ..NodeConfig::default()
        };

        assert!(Node::new(config).is_ok());
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = NodeConfig {
            protocol_version: 12,
            ..NodeConfig::default()
        };
        assert!(Node::new(config).is_err());
    }
}
