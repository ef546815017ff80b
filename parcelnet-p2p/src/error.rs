//! P2P error types.

use std::io;
use thiserror::Error;

use crate::endpoint::Endpoint;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message exceeds maximum allowed size.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The connection did not start with a recognizable signature.
    #[error("Invalid connection signature")]
    InvalidSignature,

    /// Payload checksum does not match the header.
    #[error("Invalid checksum: expected {expected:#010x}, got {actual:#010x}")]
    InvalidChecksum { expected: u32, actual: u32 },

    /// Length in header does not match payload.
    #[error("Length in header ({header}) does not match payload ({payload})")]
    InvalidLength { header: u32, payload: usize },

    /// A parcel arrived without payload.
    #[error("Zero-length payload")]
    ZeroLengthPayload,

    /// Message carries an unexpected protocol version.
    #[error("Invalid version {0}")]
    InvalidVersion(u16),

    /// Message carries an unknown parcel type.
    #[error("Unknown parcel type {0}")]
    UnknownParcelType(u32),

    /// Remote side belongs to a different network.
    #[error("Network mismatch: expected {expected}, got {actual}")]
    NetworkMismatch { expected: String, actual: String },

    /// Endpoint could not be parsed or failed validation.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Handshake carried a listen port outside 1..=65535.
    #[error("Invalid listen port: {0:?}")]
    InvalidListenPort(String),

    /// Protocol version ranges of both sides do not overlap.
    #[error("Incompatible protocol version: negotiated {negotiated} (local min {local_min}, remote min {remote_min})")]
    IncompatibleVersion {
        negotiated: u16,
        local_min: u16,
        remote_min: u16,
    },

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake timed out.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// Connection timed out.
    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: String },

    /// The remote side is this very node.
    #[error("loopback")]
    Loopback,

    /// The remote side refused the connection, optionally offering substitutes.
    #[error("Connection rejected ({} alternatives)", alternatives.len())]
    Rejected { alternatives: Vec<Endpoint> },

    /// Address is banned.
    #[error("Address {0} is banned")]
    Banned(String),

    /// Node is at its connection capacity.
    #[error("Refusing connection from {addr}: at capacity ({total} of {max})")]
    AtCapacity { addr: String, total: usize, max: usize },

    /// Too many connections from the same IP.
    #[error("Rejecting {addr} due to per ip limit of {limit}")]
    IpLimit { addr: String, limit: usize },

    /// A peer with the same hash is already registered.
    #[error("Peer {0} already exists")]
    DuplicatePeer(String),

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Configuration value would prevent normal operation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Special peer list could not be parsed.
    #[error("Invalid special peer list: {0}")]
    InvalidSpecial(String),

    /// No peer share arrived in time.
    #[error("Peer share request timed out")]
    ShareTimeout,

    /// A message part disagrees with previously received parts.
    #[error("Invalid message part: {0}")]
    InvalidPart(String),

    /// Seed list could not be retrieved.
    #[error("Seed fetch failed: {0}")]
    Seed(String),

    /// The metrics registry is already in use by another network.
    #[error("Metrics registry already claimed")]
    RegistryClaimed,

    /// Network was started twice.
    #[error("Network already running")]
    AlreadyRunning,

    /// Network was stopped and cannot be used again.
    #[error("Network already stopped")]
    Stopped,

    /// Channel closed on the other side.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Node is shutting down.
    #[error("Node shutting down")]
    Shutdown,
}

impl From<bincode::Error> for P2pError {
    fn from(err: bincode::Error) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

impl From<prost::DecodeError> for P2pError {
    fn from(err: prost::DecodeError) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

impl From<prost::EncodeError> for P2pError {
    fn from(err: prost::EncodeError) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
