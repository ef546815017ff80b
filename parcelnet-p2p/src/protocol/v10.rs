//! Protocol 10: the slim legacy format, just type, checksum and payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};
use crate::parcel::{Parcel, ParcelType};
use crate::protocol::{bincode_decode, bincode_encode, checksum};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V10Msg {
    pub kind: ParcelType,
    pub crc32: u32,
    pub payload: Vec<u8>,
}

impl V10Msg {
    pub fn new(kind: ParcelType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            crc32: checksum(&payload),
            payload,
        }
    }

    pub fn valid(&self) -> P2pResult<()> {
        if self.payload.is_empty() {
            return Err(P2pError::ZeroLengthPayload);
        }
        let actual = checksum(&self.payload);
        if actual != self.crc32 {
            return Err(P2pError::InvalidChecksum {
                expected: self.crc32,
                actual,
            });
        }
        Ok(())
    }
}

/// Protocol 10 carries no per-connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolV10;

impl ProtocolV10 {
    pub fn encode(&self, parcel: &Parcel) -> P2pResult<Bytes> {
        let msg = V10Msg::new(parcel.kind, parcel.payload.to_vec());
        Ok(Bytes::from(bincode_encode(&msg)?))
    }

    pub fn decode(&self, body: &[u8]) -> P2pResult<Parcel> {
        let msg: V10Msg = bincode_decode(body)?;
        msg.valid()?;
        Ok(Parcel::new(msg.kind, msg.payload))
    }

    /// Endpoints as a JSON `[{"IP": .., "Port": ..}]` list.
    pub fn make_peer_share(&self, share: &[Endpoint]) -> P2pResult<Vec<u8>> {
        Ok(serde_json::to_vec(share)?)
    }

    pub fn parse_peer_share(&self, payload: &[u8]) -> P2pResult<Vec<Endpoint>> {
        let share: Option<Vec<Endpoint>> = serde_json::from_slice(payload)?;
        Ok(share.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let parcel = Parcel::new(ParcelType::PeerResponse, vec![7u8; 100]);
        let body = ProtocolV10.encode(&parcel).unwrap();
        assert_eq!(ProtocolV10.decode(&body).unwrap(), parcel);
    }

    #[test]
    fn test_bit_flip_detected() {
        let mut msg = V10Msg::new(ParcelType::Message, b"payload".to_vec());
        assert!(msg.valid().is_ok());
        msg.payload[3] ^= 0x80;
        assert!(matches!(msg.valid(), Err(P2pError::InvalidChecksum { .. })));
    }

    #[test]
    fn test_peer_share_format() {
        let share = vec![Endpoint::new("10.0.0.1", "8108").unwrap()];
        let payload = ProtocolV10.make_peer_share(&share).unwrap();
        assert_eq!(payload, br#"[{"IP":"10.0.0.1","Port":"8108"}]"#.to_vec());
        assert_eq!(ProtocolV10.parse_peer_share(&payload).unwrap(), share);
    }
}
