//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Standalone gossip network node.
#[derive(Parser, Debug, Clone)]
#[command(name = "parcelnet-node")]
#[command(about = "Joins a parcelnet gossip network and relays parcels")]
#[command(version)]
pub struct Cli {
    /// Network to join: main, test, local or any custom name.
    #[arg(long, default_value = "main")]
    pub network: String,

    /// Node name, also the source of the node id.
    #[arg(long, default_value = "FNode0")]
    pub node_name: String,

    /// P2P listen port.
    #[arg(long, default_value = "8108")]
    pub listen_port: String,

    /// Local ip to bind to, empty for all.
    #[arg(long, default_value = "")]
    pub bind_ip: String,

    /// Comma-separated list of always-connect peers (host:port).
    #[arg(long, default_value = "")]
    pub special: String,

    /// URL of the seed file.
    #[arg(long, default_value = "")]
    pub seed_url: String,

    /// File bans and known peers are persisted to.
    #[arg(long, default_value = "~/.parcelnet/peers.json")]
    pub peer_file: PathBuf,

    /// Do not persist peers.
    #[arg(long)]
    pub no_peer_file: bool,

    /// Highest protocol version to speak (9, 10 or 11).
    #[arg(long, default_value_t = 10)]
    pub protocol_version: u16,

    /// Send a heartbeat broadcast every this many seconds, 0 to disable.
    #[arg(long, default_value_t = 0)]
    pub broadcast_interval: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Expand the peer file path (handle ~ for home).
    pub fn expanded_peer_file(&self) -> PathBuf {
        let path_str = self.peer_file.to_string_lossy();
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        }
        self.peer_file.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["parcelnet-node"]);
        assert_eq!(cli.network, "main");
        assert_eq!(cli.listen_port, "8108");
        assert_eq!(cli.protocol_version, 10);
        assert_eq!(cli.broadcast_interval, 0);
        assert!(!cli.no_peer_file);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_special_and_network() {
        let cli = Cli::parse_from([
            "parcelnet-node",
            "--network",
            "test",
            "--special",
            "127.0.0.1:8108,192.168.1.1:8108",
            "--protocol-version",
            "11",
        ]);
        assert_eq!(cli.network, "test");
        assert_eq!(cli.special, "127.0.0.1:8108,192.168.1.1:8108");
        assert_eq!(cli.protocol_version, 11);
    }

    #[test]
    fn test_peer_file_expansion() {
        let cli = Cli::parse_from(["parcelnet-node", "--peer-file", "/tmp/peers.json"]);
        assert_eq!(cli.expanded_peer_file(), PathBuf::from("/tmp/peers.json"));
    }
}
