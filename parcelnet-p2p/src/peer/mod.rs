//! Connected peers.
//!
//! A peer is created once its handshake succeeded. It then runs three tasks:
//!
//! - **read**: receives parcels, stamps them with the peer's hash and hands
//!   them to the controller
//! - **send**: drains the peer's send queue onto the connection
//! - **stat**: folds traffic counters into rates every few seconds
//!
//! Any I/O or protocol error stops the peer. [`Peer::stop`] may be called
//! from any task, any number of times; the shutdown sequence runs once.

pub mod metrics;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::P2pConfig;
use crate::endpoint::Endpoint;
use crate::parcel::{Parcel, ParcelChannel};
use crate::protocol::{Protocol, ProtocolReader, ProtocolWriter, Traffic};
use crate::resend::{payload_hash, ResendFilter};

pub use metrics::{PeerMetrics, PeerStats, STAT_INTERVAL};

/// A parcel received from a peer.
#[derive(Debug)]
pub struct PeerParcel {
    pub peer: Arc<Peer>,
    pub parcel: Parcel,
}

/// Online/offline notification of a peer.
#[derive(Debug)]
pub struct PeerStatus {
    pub peer: Arc<Peer>,
    pub online: bool,
}

/// Identifier of a peer connection: `ip:port nodeid`.
pub fn peer_hash(endpoint: &Endpoint, node_id: u32) -> String {
    format!("{} {:08x}", endpoint, node_id)
}

/// A connected remote node.
pub struct Peer {
    pub hash: String,
    pub endpoint: Endpoint,
    pub node_id: u32,
    pub is_incoming: bool,

    protocol: Protocol,
    send: ParcelChannel,
    stopped: AtomicBool,
    cancel: CancellationToken,
    status: mpsc::UnboundedSender<PeerStatus>,

    traffic: Arc<Traffic>,
    stats: Mutex<PeerStats>,

    last_peer_request: Mutex<Option<Instant>>,
    last_peer_send: Mutex<Option<Instant>>,
    resend: Option<ResendFilter>,
}

impl Peer {
    /// Create a peer. The connection is attached with [`Peer::start`].
    pub fn new(
        config: &P2pConfig,
        endpoint: Endpoint,
        node_id: u32,
        is_incoming: bool,
        protocol: Protocol,
        traffic: Arc<Traffic>,
        status: mpsc::UnboundedSender<PeerStatus>,
    ) -> Arc<Self> {
        let resend = config
            .peer_resend
            .then(|| ResendFilter::new(config.peer_resend_buckets, config.peer_resend_interval));

        Arc::new(Self {
            hash: peer_hash(&endpoint, node_id),
            endpoint,
            node_id,
            is_incoming,
            protocol,
            send: ParcelChannel::new(config.channel_capacity),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            status,
            traffic,
            stats: Mutex::new(PeerStats::new(SystemTime::now())),
            last_peer_request: Mutex::new(None),
            last_peer_send: Mutex::new(None),
            resend,
        })
    }

    /// Spawn the read, send and stat tasks.
    pub fn start<R, W>(
        self: &Arc<Self>,
        reader: ProtocolReader<R>,
        writer: ProtocolWriter<W>,
        data: mpsc::Sender<PeerParcel>,
        config: &P2pConfig,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(read_loop(self.clone(), reader, data, config.read_deadline));
        tokio::spawn(send_loop(self.clone(), writer, config.write_deadline));
        tokio::spawn(stat_loop(self.clone()));
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn version(&self) -> u16 {
        self.protocol.version()
    }

    /// Queue a parcel. Never blocks; a full queue loses its oldest half.
    pub fn send(&self, parcel: Parcel) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.send.send(parcel)
    }

    /// Number of parcels waiting to be written.
    pub fn queued(&self) -> usize {
        self.send.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once the peer is stopped.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Stop the peer and report it offline.
    ///
    /// Cancelling ends the read and send loops. Each drops its half of the
    /// connection on exit, which closes the socket.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(peer = %self.hash, "stopping peer");
        self.cancel.cancel();
        self.send.close();
        let _ = self.status.send(PeerStatus {
            peer: self.clone(),
            online: false,
        });
    }

    /// Time of the last parcel written to this peer.
    pub fn last_send(&self) -> SystemTime {
        self.stats.lock().last_send
    }

    /// Claim the right to answer a peer request. Fails if the last one was
    /// answered less than `interval` ago.
    pub fn take_peer_request(&self, interval: Duration) -> bool {
        take_slot(&self.last_peer_request, interval)
    }

    /// Claim the right to ask this peer for a share.
    pub fn take_peer_send(&self, interval: Duration) -> bool {
        take_slot(&self.last_peer_send, interval)
    }

    /// True if we may ask this peer for a share now.
    pub fn can_request_share(&self, interval: Duration) -> bool {
        match *self.last_peer_send.lock() {
            Some(last) => last.elapsed() >= interval,
            None => true,
        }
    }

    /// True if this peer recently sent us the payload with the given hash.
    pub fn has_sent(&self, hash: &[u8; 32]) -> bool {
        self.resend.as_ref().is_some_and(|filter| filter.contains(hash))
    }

    /// Remember that this peer sent us the payload with the given hash.
    pub fn record_received(&self, hash: &[u8; 32]) {
        if let Some(filter) = &self.resend {
            filter.record(*hash);
        }
    }

    /// Snapshot of this peer's metrics.
    pub fn metrics(&self) -> PeerMetrics {
        let stats = self.stats.lock().clone();
        PeerMetrics {
            hash: self.hash.clone(),
            peer_address: self.endpoint.ip.clone(),
            moment_connected: metrics::unix_secs(stats.connected),
            last_receive: metrics::unix_secs(stats.last_receive),
            last_send: metrics::unix_secs(stats.last_send),
            messages_sent: stats.messages_sent,
            bytes_sent: stats.bytes_sent,
            messages_received: stats.messages_received,
            bytes_received: stats.bytes_received,
            incoming: self.is_incoming,
            protocol_version: self.version(),
            mps_down: stats.mps_down,
            mps_up: stats.mps_up,
            bps_down: stats.bps_down,
            bps_up: stats.bps_up,
            send_fill_ratio: self.send.fill_ratio(),
            dropped: self.send.dropped(),
        }
    }

    fn update_stats(&self, elapsed: Duration) {
        let snapshot = self.traffic.take();
        self.stats.lock().update(snapshot, elapsed);
    }
}

fn take_slot(slot: &Mutex<Option<Instant>>, interval: Duration) -> bool {
    let mut last = slot.lock();
    match *last {
        Some(t) if t.elapsed() < interval => false,
        _ => {
            *last = Some(Instant::now());
            true
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("hash", &self.hash)
            .field("incoming", &self.is_incoming)
            .field("version", &self.version())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    peer: Arc<Peer>,
    mut reader: ProtocolReader<R>,
    data: mpsc::Sender<PeerParcel>,
    deadline: Duration,
) {
    loop {
        let received = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            received = timeout(deadline, reader.receive()) => received,
        };

        let parcel = match received {
            Ok(Ok(parcel)) => parcel,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer.hash, error = %e, "read failed");
                break;
            }
            Err(_) => {
                tracing::debug!(peer = %peer.hash, "read deadline exceeded");
                break;
            }
        };

        if let Err(e) = parcel.valid() {
            tracing::debug!(peer = %peer.hash, error = %e, "invalid parcel");
            break;
        }

        peer.stats.lock().last_receive = SystemTime::now();
        if parcel.is_application_message() {
            peer.record_received(&payload_hash(&parcel.payload));
        }

        let parcel = parcel.with_address(peer.hash.clone());
        let forward = PeerParcel {
            peer: peer.clone(),
            parcel,
        };
        tokio::select! {
            _ = peer.cancel.cancelled() => break,
            sent = data.send(forward) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    peer.stop();
}

async fn send_loop<W: AsyncWrite + Unpin>(
    peer: Arc<Peer>,
    mut writer: ProtocolWriter<W>,
    deadline: Duration,
) {
    loop {
        let parcel = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            parcel = peer.send.recv() => match parcel {
                Some(parcel) => parcel,
                None => break,
            },
        };

        match timeout(deadline, writer.send(&parcel)).await {
            Ok(Ok(())) => peer.stats.lock().last_send = SystemTime::now(),
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer.hash, error = %e, "send failed");
                break;
            }
            Err(_) => {
                tracing::debug!(peer = %peer.hash, "write deadline exceeded");
                break;
            }
        }
    }
    peer.stop();
    let _ = timeout(Duration::from_secs(1), writer.shutdown()).await;
}

async fn stat_loop(peer: Arc<Peer>) {
    let mut interval = tokio::time::interval(STAT_INTERVAL);
    interval.tick().await;
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = peer.cancel.cancelled() => break,
            _ = interval.tick() => {
                let now = Instant::now();
                peer.update_stats(now - last);
                last = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkId;
    use crate::parcel::ParcelType;
    use crate::protocol::{FrameReader, FrameWriter};
    use tokio::io::duplex;

    fn test_peer(capacity: usize) -> (Arc<Peer>, mpsc::UnboundedReceiver<PeerStatus>) {
        let config = P2pConfig::new(NetworkId::TEST_NET).with_channel_capacity(capacity);
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            &config,
            Endpoint::new("127.0.0.1", "8108").unwrap(),
            0xabc,
            false,
            Protocol::for_version(11, &config),
            Traffic::new(),
            status_tx,
        );
        (peer, status_rx)
    }

    #[test]
    fn test_peer_hash() {
        let (peer, _rx) = test_peer(10);
        assert_eq!(peer.hash, "127.0.0.1:8108 00000abc");
        assert_eq!(peer.to_string(), peer.hash);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (peer, mut status) = test_peer(10);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = peer.clone();
            handles.push(tokio::spawn(async move { p.stop() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        peer.stop();

        let first = status.recv().await.unwrap();
        assert!(!first.online);
        assert!(Arc::ptr_eq(&first.peer, &peer));
        assert!(status.try_recv().is_err());
        assert!(peer.is_stopped());
        assert!(!peer.send(Parcel::new(ParcelType::Ping, "Ping")));
    }

    #[test]
    fn test_bounded_send_never_blocks() {
        let (peer, _rx) = test_peer(10);
        for i in 0..25u8 {
            assert!(peer.send(Parcel::new(ParcelType::Message, vec![i])));
        }
        assert!(peer.queued() <= 10);
        let metrics = peer.metrics();
        assert!(metrics.dropped > 0);
        assert!(metrics.send_fill_ratio <= 1.0);
    }

    #[test]
    fn test_peer_request_rate_limit() {
        let (peer, _rx) = test_peer(10);
        let interval = Duration::from_secs(5);
        assert!(peer.take_peer_request(interval));
        assert!(!peer.take_peer_request(interval));
        assert!(peer.take_peer_request(Duration::ZERO));

        assert!(peer.can_request_share(interval));
        assert!(peer.take_peer_send(interval));
        assert!(!peer.can_request_share(interval));
    }

    #[tokio::test]
    async fn test_loops_exchange_parcels() {
        let config = P2pConfig::new(NetworkId::TEST_NET);
        let protocol = Protocol::for_version(10, &config);
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        let (peer, mut status) = test_peer(100);
        let (data_tx, mut data_rx) = mpsc::channel(16);
        peer.start(
            ProtocolReader::new(FrameReader::new(our_read, Traffic::new()), protocol.clone()),
            ProtocolWriter::new(FrameWriter::new(our_write, Traffic::new()), protocol.clone()),
            data_tx,
            &config,
        );

        // remote side sends us a message
        let mut remote_writer =
            ProtocolWriter::new(FrameWriter::new(their_write, Traffic::new()), protocol.clone());
        remote_writer
            .send(&Parcel::message("", "hello"))
            .await
            .unwrap();

        let received = data_rx.recv().await.unwrap();
        assert_eq!(received.parcel.address, peer.hash);
        assert_eq!(&received.parcel.payload[..], b"hello");
        assert!(peer.has_sent(&payload_hash(b"hello")));

        // we send a parcel to the remote side
        assert!(peer.send(Parcel::new(ParcelType::Pong, "Pong")));
        let mut remote_reader =
            ProtocolReader::new(FrameReader::new(their_read, Traffic::new()), protocol);
        let got = remote_reader.receive().await.unwrap();
        assert_eq!(got.kind, ParcelType::Pong);

        // closing the remote side stops the peer
        drop(remote_writer);
        drop(remote_reader);
        let offline = status.recv().await.unwrap();
        assert!(!offline.online);
        assert!(peer.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_closes_connection() {
        let config = P2pConfig::new(NetworkId::TEST_NET);
        let protocol = Protocol::for_version(10, &config);
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);

        let (peer, mut status) = test_peer(100);
        let (data_tx, _data_rx) = mpsc::channel(16);
        peer.start(
            ProtocolReader::new(FrameReader::new(our_read, Traffic::new()), protocol.clone()),
            ProtocolWriter::new(FrameWriter::new(our_write, Traffic::new()), protocol.clone()),
            data_tx,
            &config,
        );

        peer.stop();
        assert!(!status.recv().await.unwrap().online);

        let (their_read, _their_write) = tokio::io::split(theirs);
        let mut remote_reader = ProtocolReader::new(FrameReader::new(their_read, Traffic::new()), protocol);
        let closed = timeout(Duration::from_secs(5), remote_reader.receive()).await;
        assert!(matches!(closed, Ok(Err(_))));
    }
}
