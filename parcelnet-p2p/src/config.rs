//! P2P configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};

/// Sends a parcel to a fanout-sized selection of peers, special peers first.
pub const BROADCAST: &str = "<BROADCAST>";

/// Sends a parcel to every connected peer.
pub const FULL_BROADCAST: &str = "<FULLBORADCAST>";

/// Sends a parcel to one randomly selected peer.
pub const RANDOM_PEER: &str = "<RANDOMPEER>";

/// Lowest protocol version this crate speaks.
pub const MIN_SUPPORTED_VERSION: u16 = 9;

/// Highest protocol version this crate speaks.
pub const MAX_SUPPORTED_VERSION: u16 = 11;

/// Default listen port.
pub const DEFAULT_LISTEN_PORT: &str = "8108";

/// Default desired amount of peers.
pub const DEFAULT_TARGET_PEERS: usize = 32;

/// Default hard cap of connections.
pub const DEFAULT_MAX_PEERS: usize = 36;

/// Default amount of peers a CAT round drops down to.
pub const DEFAULT_DROP_TO: usize = 30;

/// Default peer count at or below which the seed is consulted.
pub const DEFAULT_MIN_RESEED: usize = 10;

/// Default broadcast fanout.
pub const DEFAULT_FANOUT: usize = 8;

/// Default capacity of every parcel channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Identifies the network a node participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

impl NetworkId {
    /// The production network.
    pub const MAIN_NET: NetworkId = NetworkId(0xfeed_beef);
    /// The public test network.
    pub const TEST_NET: NetworkId = NetworkId(0xdead_beef);
    /// Any arbitrary or private network.
    pub const LOCAL_NET: NetworkId = NetworkId(0x00be_aded);

    /// Derive a network id from a custom network name.
    pub fn from_name(name: &str) -> Self {
        NetworkId(string_to_u32(name))
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NetworkId::MAIN_NET => write!(f, "MainNet"),
            NetworkId::TEST_NET => write!(f, "TestNet"),
            NetworkId::LOCAL_NET => write!(f, "LocalNet"),
            NetworkId(other) => write!(f, "CustomNet ({other:#x})"),
        }
    }
}

/// First four bytes of the sha256 of `input`, big endian.
pub fn string_to_u32(input: &str) -> u32 {
    let digest = Sha256::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Parse a comma separated list of `host:port` special peers.
pub fn parse_special(raw: &str) -> P2pResult<Vec<Endpoint>> {
    if raw.trim().is_empty() {
        return Err(P2pError::InvalidSpecial("empty list".to_string()));
    }

    raw.split(',')
        .map(|item| {
            let item = item.trim();
            Endpoint::parse(item).map_err(|_| P2pError::InvalidSpecial(item.to_string()))
        })
        .collect()
}

/// Configuration for the gossip network.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Network to participate in; handshakes from other networks are refused.
    pub network: NetworkId,

    /// Identifier of this node. Zero means derive it from `node_name`.
    pub node_id: u32,

    /// Internal name of the node.
    pub node_name: String,

    // === Peer management ===
    /// How often a neighbor may be asked for (or may ask for) a peer share.
    pub peer_request_interval: Duration,

    /// How long a fetched seed list stays fresh.
    pub peer_reseed_interval: Duration,

    /// Maximum incoming connections from a single ip, 0 for unlimited.
    pub peer_ip_limit_incoming: usize,

    /// Maximum outgoing connections to a single ip, 0 for unlimited.
    pub peer_ip_limit_outgoing: usize,

    /// Comma separated list of always-connect endpoints.
    pub special: String,

    /// File the ban list and bootstrap peers are persisted to.
    pub persist_file: Option<PathBuf>,

    /// How often state is persisted outside of CAT rounds.
    pub persist_interval: Duration,

    /// Maximum age of the persisted file to bootstrap peers from.
    pub persist_age: Duration,

    /// Number of peers shared with a peer that requests a share.
    pub peer_share_amount: usize,

    /// Maximum time to wait for a requested peer share.
    pub peer_share_timeout: Duration,

    // === CAT ===
    /// How often CAT rounds run.
    pub round_time: Duration,

    /// Desired amount of peers.
    pub target_peers: usize,

    /// Hard cap of connections.
    pub max_peers: usize,

    /// Amount of peers a CAT round drops down to.
    pub drop_to: usize,

    /// Consult the seed if there are this many peers or fewer.
    pub min_reseed: usize,

    /// Maximum inbound connections, at most `max_peers`.
    pub max_incoming: usize,

    // === Gossip ===
    /// Number of peers a broadcast is sent to.
    pub fanout: usize,

    /// URL of the remote seed file.
    pub seed_url: String,

    /// Skip peers that already sent us an application payload when
    /// broadcasting the same payload.
    pub peer_resend: bool,

    /// Number of time buckets the resend filter covers.
    pub peer_resend_buckets: usize,

    /// Width of one resend bucket.
    pub peer_resend_interval: Duration,

    // === Connections ===
    /// Ip address to bind to for listening and dialing; empty binds to all.
    pub bind_ip: String,

    /// Port to listen on.
    pub listen_port: String,

    /// Lockout period for accepting connections from the same ip.
    pub listen_limit: Duration,

    /// Maximum silence on a connection before a ping is sent.
    pub ping_interval: Duration,

    /// Minimum time between two dials to the same endpoint.
    pub redial_interval: Duration,

    /// Duration of bans issued by the application.
    pub manual_ban: Duration,

    /// Maximum time to complete a handshake.
    pub handshake_timeout: Duration,

    /// Maximum time to establish a tcp connection.
    pub dial_timeout: Duration,

    /// Maximum time to read a single parcel.
    pub read_deadline: Duration,

    /// Maximum time to write a single parcel.
    pub write_deadline: Duration,

    /// Highest protocol version to speak.
    pub protocol_version: u16,

    /// Lowest protocol version to accept.
    pub protocol_version_minimum: u16,

    /// Capacity of peer send queues and application channels.
    pub channel_capacity: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            network: NetworkId::MAIN_NET,
            node_id: 0,
            node_name: "FNode0".to_string(),
            peer_request_interval: Duration::from_secs(5),
            peer_reseed_interval: Duration::from_secs(4 * 60 * 60),
            peer_ip_limit_incoming: 0,
            peer_ip_limit_outgoing: 0,
            special: String::new(),
            persist_file: None,
            persist_interval: Duration::from_secs(15 * 60),
            persist_age: Duration::from_secs(60 * 60),
            peer_share_amount: 3,
            peer_share_timeout: Duration::from_secs(5),
            round_time: Duration::from_secs(15 * 60),
            target_peers: DEFAULT_TARGET_PEERS,
            max_peers: DEFAULT_MAX_PEERS,
            drop_to: DEFAULT_DROP_TO,
            min_reseed: DEFAULT_MIN_RESEED,
            max_incoming: DEFAULT_MAX_PEERS,
            fanout: DEFAULT_FANOUT,
            seed_url: String::new(),
            peer_resend: true,
            peer_resend_buckets: 3,
            peer_resend_interval: Duration::from_secs(20),
            bind_ip: String::new(),
            listen_port: DEFAULT_LISTEN_PORT.to_string(),
            listen_limit: Duration::from_secs(1),
            ping_interval: Duration::from_secs(15),
            redial_interval: Duration::from_secs(2 * 60),
            manual_ban: Duration::from_secs(7 * 24 * 60 * 60),
            handshake_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            read_deadline: Duration::from_secs(5 * 60),
            write_deadline: Duration::from_secs(5 * 60),
            protocol_version: 10,
            protocol_version_minimum: 9,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl P2pConfig {
    /// Create a configuration for the given network.
    pub fn new(network: NetworkId) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Set the node name.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    /// Set the listen port.
    pub fn with_listen_port(mut self, port: impl Into<String>) -> Self {
        self.listen_port = port.into();
        self
    }

    /// Set the bind ip.
    pub fn with_bind_ip(mut self, ip: impl Into<String>) -> Self {
        self.bind_ip = ip.into();
        self
    }

    /// Set the special peers list.
    pub fn with_special(mut self, special: impl Into<String>) -> Self {
        self.special = special.into();
        self
    }

    /// Set the seed url.
    pub fn with_seed_url(mut self, url: impl Into<String>) -> Self {
        self.seed_url = url.into();
        self
    }

    /// Set the persist file.
    pub fn with_persist_file(mut self, path: PathBuf) -> Self {
        self.persist_file = Some(path);
        self
    }

    /// Set the supported protocol range.
    pub fn with_protocol(mut self, minimum: u16, version: u16) -> Self {
        self.protocol_version_minimum = minimum;
        self.protocol_version = version;
        self
    }

    /// Set the CAT sizing.
    pub fn with_peer_limits(mut self, target: usize, max: usize, drop_to: usize) -> Self {
        self.target_peers = target;
        self.max_peers = max;
        self.drop_to = drop_to;
        self
    }

    /// Set the broadcast fanout.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Set the channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Adjust values that depend on each other.
    pub fn sanitize(&mut self) {
        if self.max_incoming > self.max_peers {
            self.max_incoming = self.max_peers;
        }
        if self.drop_to > self.max_peers {
            self.drop_to = self.max_peers;
        }
    }

    /// Node id, derived from the node name when not set explicitly.
    pub fn effective_node_id(&self) -> u32 {
        if self.node_id == 0 {
            string_to_u32(&self.node_name)
        } else {
            self.node_id
        }
    }

    /// Reject values that would prevent normal operation.
    pub fn check(&self) -> P2pResult<()> {
        fn invalid(msg: &str) -> P2pResult<()> {
            Err(P2pError::InvalidConfig(msg.to_string()))
        }

        if self.listen_port.is_empty() {
            return invalid("listen_port is empty");
        }
        if self.listen_port.parse::<u16>().is_err() {
            return invalid("listen_port is not a number");
        }
        if self.peer_share_amount == 0 {
            return invalid("peer_share_amount is zero");
        }
        if self.round_time.is_zero() {
            return invalid("round_time is not set");
        }
        if self.target_peers == 0 {
            return invalid("target_peers is not set");
        }
        if self.fanout == 0 {
            return invalid("fanout is not set");
        }
        if self.handshake_timeout.is_zero() {
            return invalid("handshake_timeout is not set");
        }
        if self.dial_timeout.is_zero() {
            return invalid("dial_timeout is not set");
        }
        if self.read_deadline.is_zero() {
            return invalid("read_deadline is not set");
        }
        if self.write_deadline.is_zero() {
            return invalid("write_deadline is not set");
        }
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&self.protocol_version) {
            return invalid("protocol_version outside of supported range (9, 10, 11)");
        }
        if self.protocol_version_minimum > MAX_SUPPORTED_VERSION {
            return invalid("protocol_version_minimum is higher than the maximum supported protocol");
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity is not set");
        }
        if self.peer_share_timeout.is_zero() {
            return invalid("peer_share_timeout is not set");
        }
        if !self.special.is_empty() && parse_special(&self.special).is_err() {
            return invalid("special contains unparseable endpoints");
        }
        Ok(())
    }
}
