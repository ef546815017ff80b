//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use parcelnet_p2p::{NetworkId, P2pConfig};

use crate::cli::Cli;

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Network to join.
    pub network: NetworkId,

    /// Node name.
    pub node_name: String,

    /// P2P listen port.
    pub listen_port: String,

    /// Local ip to bind to.
    pub bind_ip: String,

    /// Always-connect peers.
    pub special: String,

    /// Seed file url.
    pub seed_url: String,

    /// Peer file, if persistence is enabled.
    pub peer_file: Option<PathBuf>,

    /// Highest protocol version to speak.
    pub protocol_version: u16,

    /// Heartbeat broadcast interval.
    pub broadcast_interval: Option<Duration>,

    /// Log level.
    pub log_level: String,
}

/// Map a network name to its id. Unknown names are custom networks.
pub fn network_from_name(name: &str) -> NetworkId {
    match name.to_ascii_lowercase().as_str() {
        "main" | "mainnet" => NetworkId::MAIN_NET,
        "test" | "testnet" => NetworkId::TEST_NET,
        "local" | "localnet" => NetworkId::LOCAL_NET,
        _ => NetworkId::from_name(name),
    }
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            network: network_from_name(&cli.network),
            node_name: cli.node_name.clone(),
            listen_port: cli.listen_port.clone(),
            bind_ip: cli.bind_ip.clone(),
            special: cli.special.clone(),
            seed_url: cli.seed_url.clone(),
            peer_file: (!cli.no_peer_file).then(|| cli.expanded_peer_file()),
            protocol_version: cli.protocol_version,
            broadcast_interval: (cli.broadcast_interval > 0)
                .then(|| Duration::from_secs(cli.broadcast_interval)),
            log_level: cli.log_level.clone(),
        }
    }

    /// Build P2P configuration from node config.
    pub fn p2p_config(&self) -> P2pConfig {
        let mut config = P2pConfig::new(self.network)
            .with_node_name(self.node_name.clone())
            .with_listen_port(self.listen_port.clone())
            .with_bind_ip(self.bind_ip.clone())
            .with_special(self.special.clone())
            .with_seed_url(self.seed_url.clone());

        config.protocol_version = self.protocol_version;
        config.persist_file = self.peer_file.clone();
        config
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkId::MAIN_NET,
            node_name: "FNode0".to_string(),
            listen_port: "8108".to_string(),
            bind_ip: String::new(),
            special: String::new(),
            seed_url: String::new(),
            peer_file: None,
            protocol_version: 10,
            broadcast_interval: None,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        let p2p = config.p2p_config();
        assert_eq!(p2p.network, NetworkId::MAIN_NET);
        assert_eq!(p2p.listen_port, "8108");
        assert!(p2p.persist_file.is_none());
        assert!(p2p.check().is_ok());
    }

    #[test]
    fn test_from_cli() {
        let cli = Cli::parse_from([
            "parcelnet-node",
            "--network",
            "local",
            "--peer-file",
            "/tmp/peers.json",
            "--broadcast-interval",
            "30",
        ]);
        let config = NodeConfig::from_cli(&cli);
        assert_eq!(config.network, NetworkId::LOCAL_NET);
        assert_eq!(config.peer_file, Some(PathBuf::from("/tmp/peers.json")));
        assert_eq!(config.broadcast_interval, Some(Duration::from_secs(30)));

        let cli = Cli::parse_from(["parcelnet-node", "--no-peer-file"]);
        assert!(NodeConfig::from_cli(&cli).peer_file.is_none());
    }

    #[test]
    fn test_network_names() {
        assert_eq!(network_from_name("TestNet"), NetworkId::TEST_NET);
        assert_eq!(network_from_name("custom"), NetworkId::from_name("custom"));
        assert_ne!(network_from_name("custom"), NetworkId::MAIN_NET);
    }
}
