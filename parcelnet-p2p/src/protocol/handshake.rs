//! Connection handshake.
//!
//! The dialing side sends its handshake first, in the format of its
//! preferred protocol version. The listening side detects the format from
//! the first four bytes (`pbuf` or a frame length), negotiates the version
//! and answers in the format of the negotiated version. Both sides then
//! switch to the negotiated protocol.
//!
//! A listener that does not want the connection answers with a
//! `RejectAlternative` handshake listing other peers to try.

use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{NetworkId, P2pConfig, MIN_SUPPORTED_VERSION};
use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};
use crate::parcel::ParcelType;
use crate::protocol::v11::{V11Endpoint, V11Handshake};
use crate::protocol::v9::{V9Header, V9Msg, NETWORK_APP_HASH, NETWORK_APP_TYPE};
use crate::protocol::{FrameReader, FrameWriter};

/// How a handshake travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFormat {
    /// A framed [`V9Msg`], used by protocol 9 and 10.
    Legacy,
    /// The `pbuf` signature followed by a framed [`V11Handshake`].
    Pbuf,
}

impl HandshakeFormat {
    pub fn for_version(version: u16) -> Self {
        if version >= 11 {
            HandshakeFormat::Pbuf
        } else {
            HandshakeFormat::Legacy
        }
    }
}

/// Handshake exchanged when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub network: NetworkId,
    /// Highest version the sender speaks, or the negotiated version in a reply.
    pub version: u16,
    /// Lowest version the sender accepts.
    pub min_version: u16,
    pub kind: ParcelType,
    pub node_id: u32,
    pub listen_port: String,
    /// Per-process nonce used to detect connections to ourselves.
    pub loopback: u64,
    /// Peers offered by a rejecting node.
    pub alternatives: Vec<Endpoint>,
}

impl Handshake {
    /// Handshake announcing this node.
    pub fn new(config: &P2pConfig, instance_id: u64) -> Self {
        Self {
            network: config.network,
            version: config.protocol_version,
            min_version: config.protocol_version_minimum,
            kind: ParcelType::Handshake,
            node_id: config.effective_node_id(),
            listen_port: config.listen_port.clone(),
            loopback: instance_id,
            alternatives: Vec::new(),
        }
    }

    /// Handshake refusing a connection.
    pub fn reject(config: &P2pConfig, alternatives: Vec<Endpoint>) -> Self {
        Self {
            kind: ParcelType::RejectAlternative,
            loopback: 0,
            alternatives,
            ..Self::new(config, 0)
        }
    }

    /// Check a received handshake against the local configuration.
    pub fn valid(&self, config: &P2pConfig) -> P2pResult<()> {
        if self.network != config.network {
            return Err(P2pError::NetworkMismatch {
                expected: config.network.to_string(),
                actual: self.network.to_string(),
            });
        }

        match self.listen_port.parse::<u16>() {
            Ok(port) if port > 0 => {}
            _ => return Err(P2pError::InvalidListenPort(self.listen_port.clone())),
        }

        match self.kind {
            ParcelType::Handshake | ParcelType::PeerRequest | ParcelType::RejectAlternative => Ok(()),
            other => Err(P2pError::HandshakeFailed(format!(
                "unexpected handshake type {other}"
            ))),
        }
    }

    fn to_v9(&self) -> P2pResult<V9Msg> {
        let payload = if self.kind == ParcelType::RejectAlternative {
            serde_json::to_vec(&self.alternatives)?
        } else {
            self.loopback.to_le_bytes().to_vec()
        };

        // protocol 9 nodes announce themselves with a peer request
        let kind = if self.version == 9 && self.kind == ParcelType::Handshake {
            ParcelType::PeerRequest
        } else {
            self.kind
        };

        let header = V9Header {
            network: self.network,
            version: self.version,
            kind,
            length: 0,
            target_peer: String::new(),
            crc32: 0,
            part_no: 0,
            parts_total: 1,
            node_id: u64::from(self.node_id),
            peer_address: String::new(),
            peer_port: self.listen_port.clone(),
            app_hash: NETWORK_APP_HASH.to_string(),
            app_type: NETWORK_APP_TYPE.to_string(),
            min_version: self.min_version,
        };
        Ok(V9Msg::new(header, payload))
    }

    fn from_v9(msg: V9Msg) -> P2pResult<Self> {
        msg.valid_payload()?;

        let header = msg.header;
        let mut handshake = Self {
            network: header.network,
            version: header.version,
            min_version: header.min_version,
            kind: header.kind,
            node_id: header.node_id as u32,
            listen_port: header.peer_port,
            loopback: 0,
            alternatives: Vec::new(),
        };

        if handshake.kind == ParcelType::RejectAlternative {
            let alternatives: Option<Vec<Endpoint>> = serde_json::from_slice(&msg.payload)?;
            handshake.alternatives = alternatives.unwrap_or_default();
        } else if let Ok(nonce) = <[u8; 8]>::try_from(msg.payload.as_slice()) {
            handshake.loopback = u64::from_le_bytes(nonce);
        }

        Ok(handshake)
    }

    fn to_v11(&self) -> V11Handshake {
        V11Handshake {
            r#type: self.kind.as_u32(),
            network: self.network.0,
            version: u32::from(self.version),
            node_id: self.node_id,
            listen_port: self.listen_port.clone(),
            loopback: self.loopback,
            alternatives: self.alternatives.iter().map(V11Endpoint::from).collect(),
            min_version: u32::from(self.min_version),
        }
    }

    fn from_v11(msg: V11Handshake) -> P2pResult<Self> {
        let version = u16::try_from(msg.version).map_err(|_| P2pError::InvalidVersion(u16::MAX))?;
        let min_version =
            u16::try_from(msg.min_version).map_err(|_| P2pError::InvalidVersion(u16::MAX))?;

        Ok(Self {
            network: NetworkId(msg.network),
            version,
            min_version,
            kind: ParcelType::try_from(msg.r#type)?,
            node_id: msg.node_id,
            listen_port: msg.listen_port,
            loopback: msg.loopback,
            alternatives: msg.alternatives.into_iter().map(Endpoint::from).collect(),
        })
    }

    /// Send this handshake in the given format.
    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut FrameWriter<W>,
        format: HandshakeFormat,
    ) -> P2pResult<()> {
        match format {
            HandshakeFormat::Pbuf => {
                writer.write_signature().await?;
                writer
                    .write_frame(Bytes::from(self.to_v11().encode_to_vec()))
                    .await
            }
            HandshakeFormat::Legacy => writer.write_frame(self.to_v9()?.to_bytes()?).await,
        }
    }

    /// Read a handshake in whichever format the remote side used.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut FrameReader<R>,
    ) -> P2pResult<(Self, HandshakeFormat)> {
        if reader.peek_signature().await? {
            reader.read_signature().await?;
            let body = reader.read_frame().await?;
            let handshake = Self::from_v11(V11Handshake::decode(&body[..])?)?;
            Ok((handshake, HandshakeFormat::Pbuf))
        } else {
            let body = reader.read_frame().await?;
            let handshake = Self::from_v9(V9Msg::from_bytes(&body)?)?;
            Ok((handshake, HandshakeFormat::Legacy))
        }
    }
}

/// Pick the highest version both sides speak.
pub fn negotiate(local_min: u16, local_max: u16, remote_min: u16, remote_max: u16) -> P2pResult<u16> {
    let version = local_max.min(remote_max);
    if version < local_min || version < remote_min || version < MIN_SUPPORTED_VERSION {
        return Err(P2pError::IncompatibleVersion {
            negotiated: version,
            local_min,
            remote_min,
        });
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Traffic;
    use tokio::io::duplex;

    fn config() -> P2pConfig {
        P2pConfig::new(NetworkId::TEST_NET)
            .with_node_name("handshake")
            .with_listen_port("8110")
    }

    async fn exchange(handshake: &Handshake, format: HandshakeFormat) -> (Handshake, HandshakeFormat) {
        let (a, b) = duplex(4096);
        let mut writer = FrameWriter::new(a, Traffic::new());
        handshake.write_to(&mut writer, format).await.unwrap();

        let mut reader = FrameReader::new(b, Traffic::new());
        Handshake::read_from(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_format_detection() {
        for version in [9, 10, 11] {
            let conf = config().with_protocol(9, version);
            let hs = Handshake::new(&conf, 0x1234_5678_9abc);
            let format = HandshakeFormat::for_version(version);

            let (got, detected) = exchange(&hs, format).await;
            assert_eq!(detected, format);
            assert_eq!(got.network, NetworkId::TEST_NET);
            assert_eq!(got.version, version);
            assert_eq!(got.min_version, 9);
            assert_eq!(got.node_id, conf.effective_node_id());
            assert_eq!(got.listen_port, "8110");
            assert_eq!(got.loopback, 0x1234_5678_9abc);
            assert!(got.valid(&conf).is_ok());
        }
    }

    #[tokio::test]
    async fn test_v9_handshake_is_peer_request() {
        let conf = config().with_protocol(9, 9);
        let (got, _) = exchange(&Handshake::new(&conf, 1), HandshakeFormat::Legacy).await;
        assert_eq!(got.kind, ParcelType::PeerRequest);
        assert!(got.valid(&conf).is_ok());
    }

    #[tokio::test]
    async fn test_reject_carries_alternatives() {
        let alternatives = vec![
            Endpoint::new("10.0.0.1", "8108").unwrap(),
            Endpoint::new("10.0.0.2", "8109").unwrap(),
        ];

        for format in [HandshakeFormat::Legacy, HandshakeFormat::Pbuf] {
            let hs = Handshake::reject(&config(), alternatives.clone());
            let (got, _) = exchange(&hs, format).await;
            assert_eq!(got.kind, ParcelType::RejectAlternative);
            assert_eq!(got.alternatives, alternatives);
            assert_eq!(got.loopback, 0);
        }

        let empty = Handshake::reject(&config(), Vec::new());
        let (got, _) = exchange(&empty, HandshakeFormat::Legacy).await;
        assert!(got.alternatives.is_empty());
    }

    #[test]
    fn test_valid() {
        let conf = config();
        let good = Handshake::new(&conf, 1);
        assert!(good.valid(&conf).is_ok());

        let mut other_net = good.clone();
        other_net.network = NetworkId::MAIN_NET;
        assert!(matches!(
            other_net.valid(&conf),
            Err(P2pError::NetworkMismatch { .. })
        ));

        for port in ["0", "", "65536", "abc"] {
            let mut bad_port = good.clone();
            bad_port.listen_port = port.to_string();
            assert!(
                matches!(bad_port.valid(&conf), Err(P2pError::InvalidListenPort(_))),
                "{port:?}"
            );
        }

        let mut bad_kind = good;
        bad_kind.kind = ParcelType::Message;
        assert!(bad_kind.valid(&conf).is_err());
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(9, 11, 9, 11).unwrap(), 11);
        assert_eq!(negotiate(9, 11, 9, 10).unwrap(), 10);
        assert_eq!(negotiate(9, 10, 9, 11).unwrap(), 10);
        assert_eq!(negotiate(9, 11, 0, 9).unwrap(), 9);
        assert_eq!(negotiate(9, 9, 9, 11).unwrap(), 9);

        assert!(negotiate(11, 11, 9, 10).is_err());
        assert!(negotiate(9, 10, 11, 11).is_err());
        assert!(negotiate(0, 11, 0, 8).is_err());
    }
}
