//! Protocol 11: length-prefixed protobuf messages.
//!
//! A V11 connection announces itself with the 4-byte signature `pbuf` in
//! front of its handshake. After that every message is a regular frame.

use bytes::Bytes;
use prost::Message;

use crate::endpoint::Endpoint;
use crate::error::P2pResult;
use crate::parcel::{Parcel, ParcelType};

/// Marks a connection that wants to speak protocol 11 (ascii "pbuf").
pub const V11_SIGNATURE: [u8; 4] = [0x70, 0x62, 0x75, 0x66];

#[derive(Clone, PartialEq, Message)]
pub struct V11Endpoint {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(string, tag = "2")]
    pub port: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct V11Handshake {
    #[prost(uint32, tag = "1")]
    pub r#type: u32,
    #[prost(uint32, tag = "2")]
    pub network: u32,
    #[prost(uint32, tag = "3")]
    pub version: u32,
    #[prost(uint32, tag = "4")]
    pub node_id: u32,
    #[prost(string, tag = "5")]
    pub listen_port: String,
    #[prost(uint64, tag = "6")]
    pub loopback: u64,
    #[prost(message, repeated, tag = "7")]
    pub alternatives: Vec<V11Endpoint>,
    #[prost(uint32, tag = "8")]
    pub min_version: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct V11Msg {
    #[prost(uint32, tag = "1")]
    pub r#type: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct V11Share {
    #[prost(message, repeated, tag = "1")]
    pub share: Vec<V11Endpoint>,
}

impl From<&Endpoint> for V11Endpoint {
    fn from(ep: &Endpoint) -> Self {
        Self {
            host: ep.ip.clone(),
            port: ep.port.clone(),
        }
    }
}

impl From<V11Endpoint> for Endpoint {
    fn from(ep: V11Endpoint) -> Self {
        Endpoint {
            ip: ep.host,
            port: ep.port,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolV11;

impl ProtocolV11 {
    pub fn encode(&self, parcel: &Parcel) -> P2pResult<Bytes> {
        let msg = V11Msg {
            r#type: parcel.kind.as_u32(),
            payload: parcel.payload.clone(),
        };
        Ok(Bytes::from(msg.encode_to_vec()))
    }

    pub fn decode(&self, body: &[u8]) -> P2pResult<Parcel> {
        let msg = V11Msg::decode(body)?;
        let kind = ParcelType::try_from(msg.r#type)?;
        Ok(Parcel::new(kind, msg.payload))
    }

    pub fn make_peer_share(&self, share: &[Endpoint]) -> P2pResult<Vec<u8>> {
        let msg = V11Share {
            share: share.iter().map(V11Endpoint::from).collect(),
        };
        Ok(msg.encode_to_vec())
    }

    pub fn parse_peer_share(&self, payload: &[u8]) -> P2pResult<Vec<Endpoint>> {
        let msg = V11Share::decode(payload)?;
        Ok(msg.share.into_iter().map(Endpoint::from).collect())
    }
}
