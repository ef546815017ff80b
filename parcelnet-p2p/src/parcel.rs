//! Parcels and parcel channels.
//!
//! A [`Parcel`] is the envelope passed between the network and the
//! application. Its `address` is a routing target on the way out
//! (a peer hash or one of the routing constants in [`crate::config`]) and
//! the sender's peer hash on the way in.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{P2pError, P2pResult};

/// Kind of a parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ParcelType {
    Heartbeat = 0,
    Ping = 1,
    Pong = 2,
    PeerRequest = 3,
    PeerResponse = 4,
    Alert = 5,
    Message = 6,
    MessagePart = 7,
    Handshake = 8,
    RejectAlternative = 9,
}

impl ParcelType {
    /// All parcel types, in wire order.
    pub const ALL: [ParcelType; 10] = [
        ParcelType::Heartbeat,
        ParcelType::Ping,
        ParcelType::Pong,
        ParcelType::PeerRequest,
        ParcelType::PeerResponse,
        ParcelType::Alert,
        ParcelType::Message,
        ParcelType::MessagePart,
        ParcelType::Handshake,
        ParcelType::RejectAlternative,
    ];

    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u16 as u32
    }
}

impl TryFrom<u32> for ParcelType {
    type Error = P2pError;

    fn try_from(value: u32) -> P2pResult<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(P2pError::UnknownParcelType(value))
    }
}

impl fmt::Display for ParcelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParcelType::Heartbeat => "Heartbeat",
            ParcelType::Ping => "Ping",
            ParcelType::Pong => "Pong",
            ParcelType::PeerRequest => "Peer-Request",
            ParcelType::PeerResponse => "Peer-Response",
            ParcelType::Alert => "Alert",
            ParcelType::Message => "Message",
            ParcelType::MessagePart => "MessagePart",
            ParcelType::Handshake => "Handshake",
            ParcelType::RejectAlternative => "Reject-Alternative",
        };
        f.write_str(name)
    }
}

/// A message travelling between application and network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    /// Kind of the parcel.
    pub kind: ParcelType,
    /// Routing target (outgoing) or sender hash (incoming).
    pub address: String,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Parcel {
    /// Create a parcel without address.
    pub fn new(kind: ParcelType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            address: String::new(),
            payload: payload.into(),
        }
    }

    /// Create an application message for the given routing target.
    pub fn message(address: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: ParcelType::Message,
            address: address.into(),
            payload: payload.into(),
        }
    }

    /// Set the address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Application parcels are the ones forwarded to the application.
    pub fn is_application_message(&self) -> bool {
        matches!(self.kind, ParcelType::Message | ParcelType::MessagePart)
    }

    /// A parcel must carry a payload.
    pub fn valid(&self) -> P2pResult<()> {
        if self.payload.is_empty() {
            return Err(P2pError::ZeroLengthPayload);
        }
        Ok(())
    }
}

impl fmt::Display for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}b to {:?}", self.kind, self.payload.len(), self.address)
    }
}

struct ChannelInner {
    queue: Mutex<VecDeque<Parcel>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Bounded parcel queue with non-blocking sends.
///
/// When the queue is full, the oldest half of the queued parcels is discarded
/// to make room. Receiving is async and returns `None` once the channel is
/// closed and drained.
#[derive(Clone)]
pub struct ParcelChannel {
    inner: Arc<ChannelInner>,
}

impl ParcelChannel {
    /// Create a channel holding at most `capacity` parcels.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(ChannelInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Queue a parcel without blocking. Returns false if the channel is closed.
    pub fn send(&self, parcel: Parcel) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                let drop = (queue.len() / 2).max(1);
                queue.drain(..drop);
                self.inner.dropped.fetch_add(drop as u64, Ordering::Relaxed);
            }
            queue.push_back(parcel);
        }
        self.inner.notify.notify_one();
        true
    }

    /// Wait for the next parcel.
    pub async fn recv(&self) -> Option<Parcel> {
        loop {
            if let Some(parcel) = self.try_recv() {
                return Some(parcel);
            }
            if self.is_closed() {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Take the next parcel if one is queued.
    pub fn try_recv(&self) -> Option<Parcel> {
        self.inner.queue.lock().pop_front()
    }

    /// Close the channel. Queued parcels can still be received.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of queued parcels.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued parcels.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Total parcels discarded by overflow.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Queue fill ratio in `0.0..=1.0`.
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.inner.capacity as f64
    }
}

impl fmt::Debug for ParcelChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParcelChannel")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
