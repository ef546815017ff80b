//! Wire protocols.
//!
//! Three protocol versions coexist:
//!
//! - **9**: legacy messages with the full metadata header, CRC32 protected
//! - **10**: slim legacy messages, just type, CRC32 and payload
//! - **11**: protobuf messages, announced by the `pbuf` signature
//!
//! All of them move their messages in length-prefixed frames
//! (see [`frame`]). The version of a connection is negotiated during the
//! handshake and bound to the connection's [`ProtocolReader`] and
//! [`ProtocolWriter`] for the rest of its life.

pub mod frame;
pub mod handshake;
pub mod v10;
pub mod v11;
pub mod v9;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bincode::Options;
use bytes::{Bytes, BytesMut};
use crc::{Algorithm, Crc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::P2pConfig;
use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};
use crate::parcel::Parcel;
use crate::parts::PartsAssembler;

pub use frame::{FrameCodec, MAX_FRAME_SIZE};
pub use handshake::{negotiate, Handshake, HandshakeFormat};
pub use v10::ProtocolV10;
pub use v11::{ProtocolV11, V11_SIGNATURE};
pub use v9::ProtocolV9;

/// CRC-32 with Koopman's polynomial, reflected.
const CRC_32_KOOPMAN: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x741b_8cd7,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0x2d3d_d0ae,
    residue: 0x0000_0000,
};

const KOOPMAN: Crc<u32> = Crc::<u32>::new(&CRC_32_KOOPMAN);

/// Checksum protecting legacy payloads.
pub fn checksum(data: &[u8]) -> u32 {
    KOOPMAN.checksum(data)
}

/// Legacy bodies use fixed-size little-endian integers and reject trailing
/// bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

pub(crate) fn bincode_encode<T: Serialize>(value: &T) -> P2pResult<Vec<u8>> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn bincode_decode<T: DeserializeOwned>(data: &[u8]) -> P2pResult<T> {
    Ok(bincode_options().deserialize(data)?)
}

/// A negotiated wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    V9(ProtocolV9),
    V10(ProtocolV10),
    V11(ProtocolV11),
}

impl Protocol {
    /// Protocol for a negotiated version. Versions below 9 map to 9, above
    /// 11 to 11.
    pub fn for_version(version: u16, config: &P2pConfig) -> Self {
        match version {
            0..=9 => Protocol::V9(ProtocolV9::new(
                config.network,
                config.effective_node_id(),
                config.listen_port.clone(),
            )),
            10 => Protocol::V10(ProtocolV10),
            _ => Protocol::V11(ProtocolV11),
        }
    }

    pub fn version(&self) -> u16 {
        match self {
            Protocol::V9(_) => 9,
            Protocol::V10(_) => 10,
            Protocol::V11(_) => 11,
        }
    }

    /// Encode a parcel into a frame body.
    pub fn encode(&self, parcel: &Parcel) -> P2pResult<Bytes> {
        match self {
            Protocol::V9(p) => p.encode(parcel),
            Protocol::V10(p) => p.encode(parcel),
            Protocol::V11(p) => p.encode(parcel),
        }
    }

    /// Serialize a list of endpoints for a peer response.
    pub fn make_peer_share(&self, share: &[Endpoint]) -> P2pResult<Vec<u8>> {
        match self {
            Protocol::V9(p) => p.make_peer_share(share),
            Protocol::V10(p) => p.make_peer_share(share),
            Protocol::V11(p) => p.make_peer_share(share),
        }
    }

    /// Parse the payload of a peer response.
    pub fn parse_peer_share(&self, payload: &[u8]) -> P2pResult<Vec<Endpoint>> {
        match self {
            Protocol::V9(p) => p.parse_peer_share(payload),
            Protocol::V10(p) => p.parse_peer_share(payload),
            Protocol::V11(p) => p.parse_peer_share(payload),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version())
    }
}

/// Byte and message counters of one connection.
#[derive(Debug, Default)]
pub struct Traffic {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_read: AtomicU64,
    messages_written: AtomicU64,
}

/// Counter values taken out of a [`Traffic`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub messages_read: u64,
    pub messages_written: u64,
}

impl Traffic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Read all counters and reset them to zero.
    pub fn take(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
            bytes_written: self.bytes_written.swap(0, Ordering::Relaxed),
            messages_read: self.messages_read.swap(0, Ordering::Relaxed),
            messages_written: self.messages_written.swap(0, Ordering::Relaxed),
        }
    }
}

/// Reads raw frames from a connection.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    codec: FrameCodec,
    traffic: Arc<Traffic>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, traffic: Arc<Traffic>) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            codec: FrameCodec::new(),
            traffic,
        }
    }

    async fn read_more(&mut self) -> P2pResult<()> {
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(P2pError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        self.traffic.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    /// True if the connection starts with the V11 signature. Nothing is
    /// consumed.
    pub async fn peek_signature(&mut self) -> P2pResult<bool> {
        while self.buf.len() < V11_SIGNATURE.len() {
            self.read_more().await?;
        }
        Ok(self.buf[..V11_SIGNATURE.len()] == V11_SIGNATURE)
    }

    /// Consume the V11 signature, failing if something else is there.
    pub async fn read_signature(&mut self) -> P2pResult<()> {
        if !self.peek_signature().await? {
            return Err(P2pError::InvalidSignature);
        }
        let _ = self.buf.split_to(V11_SIGNATURE.len());
        Ok(())
    }

    /// Read the next frame body.
    pub async fn read_frame(&mut self) -> P2pResult<BytesMut> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                self.traffic.messages_read.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }
            self.read_more().await?;
        }
    }
}

/// Writes raw frames to a connection.
pub struct FrameWriter<W> {
    writer: W,
    buf: BytesMut,
    codec: FrameCodec,
    traffic: Arc<Traffic>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, traffic: Arc<Traffic>) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(8 * 1024),
            codec: FrameCodec::new(),
            traffic,
        }
    }

    /// Write the V11 signature.
    pub async fn write_signature(&mut self) -> P2pResult<()> {
        self.writer.write_all(&V11_SIGNATURE).await?;
        self.traffic
            .bytes_written
            .fetch_add(V11_SIGNATURE.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write one frame and flush.
    pub async fn write_frame(&mut self, body: Bytes) -> P2pResult<()> {
        self.buf.clear();
        self.codec.encode(body, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        self.traffic
            .bytes_written
            .fetch_add(self.buf.len() as u64, Ordering::Relaxed);
        self.traffic.messages_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> P2pResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Receiving half of a connection with a bound protocol.
pub struct ProtocolReader<R> {
    frames: FrameReader<R>,
    protocol: Protocol,
    parts: PartsAssembler,
}

impl<R: AsyncRead + Unpin> ProtocolReader<R> {
    pub fn new(frames: FrameReader<R>, protocol: Protocol) -> Self {
        Self {
            frames,
            protocol,
            parts: PartsAssembler::new(),
        }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Receive the next parcel. Multi-part legacy messages are returned once
    /// complete.
    pub async fn receive(&mut self) -> P2pResult<Parcel> {
        loop {
            let body = self.frames.read_frame().await?;
            match &self.protocol {
                Protocol::V9(p) => {
                    let msg = p.decode(&body)?;
                    if msg.header.parts_total > 1 {
                        if let Some(parcel) = self.parts.handle_part(msg)? {
                            return Ok(parcel);
                        }
                        continue;
                    }
                    return Ok(Parcel::from(msg));
                }
                Protocol::V10(p) => return p.decode(&body),
                Protocol::V11(p) => return p.decode(&body),
            }
        }
    }
}

/// Sending half of a connection with a bound protocol.
pub struct ProtocolWriter<W> {
    frames: FrameWriter<W>,
    protocol: Protocol,
}

impl<W: AsyncWrite + Unpin> ProtocolWriter<W> {
    pub fn new(frames: FrameWriter<W>, protocol: Protocol) -> Self {
        Self { frames, protocol }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Send one parcel.
    pub async fn send(&mut self, parcel: &Parcel) -> P2pResult<()> {
        let body = self.protocol.encode(parcel)?;
        self.frames.write_frame(body).await
    }

    pub async fn shutdown(&mut self) -> P2pResult<()> {
        self.frames.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkId;
    use crate::parcel::ParcelType;
    use rand::{Rng, SeedableRng};
    use tokio::io::duplex;

    fn random_parcels(count: usize) -> Vec<Parcel> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        (0..count)
            .map(|_| {
                let kind = ParcelType::ALL[rng.gen_range(0..ParcelType::ALL.len())];
                let len = rng.gen_range(1..8192);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                Parcel::new(kind, payload)
            })
            .collect()
    }

    async fn send_receive(version: u16) {
        let config = P2pConfig::new(NetworkId::TEST_NET);
        let protocol = Protocol::for_version(version, &config);
        assert_eq!(protocol.version(), version);

        let (a, b) = duplex(64 * 1024);
        let parcels = random_parcels(128);

        let mut writer = ProtocolWriter::new(FrameWriter::new(a, Traffic::new()), protocol.clone());
        let expected = parcels.clone();
        let sender = tokio::spawn(async move {
            for p in &expected {
                writer.send(p).await.unwrap();
            }
        });

        let traffic = Traffic::new();
        let mut reader = ProtocolReader::new(FrameReader::new(b, traffic.clone()), protocol);
        for want in &parcels {
            let got = reader.receive().await.unwrap();
            assert_eq!(got.kind, want.kind);
            assert_eq!(got.payload, want.payload);
        }
        sender.await.unwrap();

        let snapshot = traffic.take();
        assert_eq!(snapshot.messages_read, 128);
        assert!(snapshot.bytes_read > 0);
        assert_eq!(traffic.take(), TrafficSnapshot::default());
    }

    #[tokio::test]
    async fn test_send_receive_all_versions() {
        send_receive(9).await;
        send_receive(10).await;
        send_receive(11).await;
    }

    #[tokio::test]
    async fn test_multipart_v9_is_reassembled() {
        use crate::protocol::v9::{V9Header, V9Msg};

        let config = P2pConfig::new(NetworkId::TEST_NET);
        let protocol = Protocol::for_version(9, &config);
        let (mut a, b) = duplex(4096);

        let mut writer = FrameWriter::new(&mut a, Traffic::new());
        for (no, chunk) in [&b"hel"[..], &b"lo"[..]].iter().enumerate() {
            let header = V9Header {
                network: NetworkId::TEST_NET,
                version: 9,
                kind: ParcelType::MessagePart,
                length: 0,
                target_peer: String::new(),
                crc32: 0,
                part_no: no as u16,
                parts_total: 2,
                node_id: 1,
                peer_address: String::new(),
                peer_port: "8108".to_string(),
                app_hash: "abc".to_string(),
                app_type: "Message".to_string(),
                min_version: 9,
            };
            let msg = V9Msg::new(header, chunk.to_vec());
            writer.write_frame(msg.to_bytes().unwrap()).await.unwrap();
        }

        let mut reader = ProtocolReader::new(FrameReader::new(b, Traffic::new()), protocol);
        let parcel = reader.receive().await.unwrap();
        assert_eq!(parcel.kind, ParcelType::Message);
        assert_eq!(&parcel.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_corrupted_legacy_frame_fails() {
        let config = P2pConfig::new(NetworkId::TEST_NET);
        for version in [9, 10] {
            let protocol = Protocol::for_version(version, &config);
            let parcel = Parcel::new(ParcelType::Message, vec![5u8; 32]);
            let mut body = protocol.encode(&parcel).unwrap().to_vec();
            let last = body.len() - 1;
            body[last] ^= 0xff;

            let (mut a, b) = duplex(4096);
            FrameWriter::new(&mut a, Traffic::new())
                .write_frame(Bytes::from(body))
                .await
                .unwrap();

            let mut reader = ProtocolReader::new(FrameReader::new(b, Traffic::new()), protocol);
            assert!(matches!(
                reader.receive().await,
                Err(P2pError::InvalidChecksum { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_peek_signature_does_not_consume() {
        let (mut a, b) = duplex(64);
        a.write_all(b"pbufrest").await.unwrap();

        let mut reader = FrameReader::new(b, Traffic::new());
        assert!(reader.peek_signature().await.unwrap());
        assert!(reader.peek_signature().await.unwrap());
        reader.read_signature().await.unwrap();
        assert!(!reader.peek_signature().await.unwrap());
    }

    #[test]
    fn test_checksum_detects_changes() {
        let data = b"The quick brown fox".to_vec();
        let sum = checksum(&data);
        assert_eq!(sum, checksum(&data));
        for i in 0..data.len() {
            let mut flipped = data.clone();
            flipped[i] ^= 0x04;
            assert_ne!(checksum(&flipped), sum);
        }
    }
}
