//! Protocol 9: the legacy wire format.
//!
//! Every message carries the full metadata header of the old network code.
//! Handshakes of protocol 9 and 10 also travel as a [`V9Msg`].

use std::collections::HashMap;
use std::net::Ipv4Addr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::NetworkId;
use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};
use crate::parcel::{Parcel, ParcelType};
use crate::protocol::{bincode_decode, bincode_encode, checksum};

/// App hash stamped on every network-originated message.
pub const NETWORK_APP_HASH: &str = "NetworkMessage";

/// App type stamped on every network-originated message.
pub const NETWORK_APP_TYPE: &str = "Network";

/// Metadata carried in front of every V9 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V9Header {
    pub network: NetworkId,
    pub version: u16,
    pub kind: ParcelType,
    pub length: u32,
    pub target_peer: String,
    pub crc32: u32,
    pub part_no: u16,
    pub parts_total: u16,
    pub node_id: u64,
    pub peer_address: String,
    pub peer_port: String,
    pub app_hash: String,
    pub app_type: String,
    pub min_version: u16,
}

/// A legacy message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V9Msg {
    pub header: V9Header,
    pub payload: Vec<u8>,
}

impl V9Msg {
    /// Build a message with length and checksum filled in.
    pub fn new(header: V9Header, payload: Vec<u8>) -> Self {
        let mut msg = Self { header, payload };
        msg.header.length = msg.payload.len() as u32;
        msg.header.crc32 = checksum(&msg.payload);
        msg
    }

    /// Checks the header for inconsistencies.
    pub fn valid(&self) -> P2pResult<()> {
        if self.header.version != 9 {
            return Err(P2pError::InvalidVersion(self.header.version));
        }
        self.valid_payload()
    }

    /// Payload checks shared by messages and handshakes.
    pub fn valid_payload(&self) -> P2pResult<()> {
        if self.payload.is_empty() {
            return Err(P2pError::ZeroLengthPayload);
        }
        if self.header.length as usize != self.payload.len() {
            return Err(P2pError::InvalidLength {
                header: self.header.length,
                payload: self.payload.len(),
            });
        }
        let actual = checksum(&self.payload);
        if actual != self.header.crc32 {
            return Err(P2pError::InvalidChecksum {
                expected: self.header.crc32,
                actual,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> P2pResult<Bytes> {
        Ok(Bytes::from(bincode_encode(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> P2pResult<Self> {
        bincode_decode(data)
    }
}

/// The legacy peer record. Quality and sources are reset when shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct V9Share {
    #[serde(default)]
    pub quality_score: i32,
    pub address: String,
    pub port: String,
    #[serde(rename = "NodeID", default)]
    pub node_id: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub location: u32,
    #[serde(default = "default_network")]
    pub network: NetworkId,
    #[serde(rename = "Type", default)]
    pub peer_type: u8,
    #[serde(default)]
    pub connections: i32,
    #[serde(default)]
    pub last_contact: String,
    #[serde(default)]
    pub source: HashMap<String, String>,
}

fn default_network() -> NetworkId {
    NetworkId(0)
}

/// Numeric location of an IPv4 address, 0 for anything else.
pub fn ip_to_location(ip: &str) -> u32 {
    ip.parse::<Ipv4Addr>().map(u32::from).unwrap_or(0)
}

/// Protocol 9 state: the header fields this node stamps on outgoing messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolV9 {
    network: NetworkId,
    node_id: u32,
    listen_port: String,
}

impl ProtocolV9 {
    pub fn new(network: NetworkId, node_id: u32, listen_port: impl Into<String>) -> Self {
        Self {
            network,
            node_id,
            listen_port: listen_port.into(),
        }
    }

    fn header(&self, kind: ParcelType, target_peer: &str) -> V9Header {
        V9Header {
            network: self.network,
            version: 9,
            kind,
            length: 0,
            target_peer: target_peer.to_string(),
            crc32: 0,
            part_no: 0,
            parts_total: 0,
            node_id: u64::from(self.node_id),
            peer_address: String::new(),
            peer_port: self.listen_port.clone(),
            app_hash: NETWORK_APP_HASH.to_string(),
            app_type: NETWORK_APP_TYPE.to_string(),
            min_version: 9,
        }
    }

    /// Wrap a parcel into a V9 message body.
    pub fn encode(&self, parcel: &Parcel) -> P2pResult<Bytes> {
        let msg = V9Msg::new(self.header(parcel.kind, &parcel.address), parcel.payload.to_vec());
        msg.to_bytes()
    }

    /// Decode and validate a V9 message body.
    pub fn decode(&self, body: &[u8]) -> P2pResult<V9Msg> {
        let msg = V9Msg::from_bytes(body)?;
        msg.valid()?;
        Ok(msg)
    }

    /// Serialize endpoints as legacy JSON peer records.
    pub fn make_peer_share(&self, share: &[Endpoint]) -> P2pResult<Vec<u8>> {
        let records: Vec<V9Share> = share
            .iter()
            .map(|ep| V9Share {
                quality_score: 20,
                address: ep.ip.clone(),
                port: ep.port.clone(),
                node_id: 1,
                hash: ep.ip.clone(),
                location: ip_to_location(&ep.ip),
                network: self.network,
                peer_type: 0,
                connections: 1,
                last_contact: "0001-01-01T00:00:00Z".to_string(),
                source: HashMap::new(),
            })
            .collect();
        Ok(serde_json::to_vec(&records)?)
    }

    /// Parse legacy JSON peer records.
    pub fn parse_peer_share(&self, payload: &[u8]) -> P2pResult<Vec<Endpoint>> {
        let records: Option<Vec<V9Share>> = serde_json::from_slice(payload)?;
        Ok(records
            .unwrap_or_default()
            .into_iter()
            .map(|r| Endpoint {
                ip: r.address,
                port: r.port,
            })
            .collect())
    }
}

impl From<V9Msg> for Parcel {
    fn from(msg: V9Msg) -> Self {
        Parcel {
            kind: msg.header.kind,
            address: msg.header.target_peer,
            payload: Bytes::from(msg.payload),
        }
    }
}
