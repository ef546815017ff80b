use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::P2pConfig;
use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};
use crate::manager::LimitedListener;
use crate::metrics::GaugeGuard;
use crate::parcel::{Parcel, ParcelType};
use crate::peer::{Peer, PeerParcel, PeerStatus};
use crate::protocol::handshake::{negotiate, Handshake, HandshakeFormat};
use crate::protocol::{FrameReader, FrameWriter, Protocol, ProtocolReader, ProtocolWriter, Traffic};

use super::Controller;

/// Ban applied to an endpoint that turned out to be ourselves.
const LOOPBACK_BAN: Duration = Duration::from_secs(50 * 365 * 24 * 60 * 60);

/// Both halves of a connection between handshake and peer start.
struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    traffic: Arc<Traffic>,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        let traffic = Traffic::new();
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader::new(read, traffic.clone()),
            writer: FrameWriter::new(write, traffic.clone()),
            traffic,
        }
    }
}

impl Controller {
    /// Check whether a connection from `ip` may be accepted.
    pub(crate) fn allow_incoming(&self, ip: &str) -> P2pResult<()> {
        if self.is_banned_ip(ip) {
            return Err(P2pError::Banned(ip.to_string()));
        }

        let config = self.config();
        let total = self.peers.total();
        if total >= config.max_incoming && !self.is_special_ip(ip) {
            return Err(P2pError::AtCapacity {
                addr: ip.to_string(),
                total,
                max: config.max_incoming,
            });
        }

        let limit = config.peer_ip_limit_incoming;
        if limit > 0 && self.peers.count(ip) >= limit {
            return Err(P2pError::IpLimit {
                addr: ip.to_string(),
                limit,
            });
        }
        Ok(())
    }

    pub(crate) async fn accept_loop(self: Arc<Self>, mut listener: LimitedListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let controller = self.clone();
                    tokio::spawn(async move {
                        let endpoint = Endpoint::from_socket_addr(&addr);
                        if let Err(e) = controller.handle_incoming(stream, endpoint).await {
                            tracing::debug!(addr = %addr, error = %e, "Incoming connection failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            }
        }
        tracing::debug!("Accept loop stopped");
    }

    /// Run the listening side of a handshake and register the peer.
    async fn handle_incoming(self: &Arc<Self>, stream: TcpStream, addr: Endpoint) -> P2pResult<()> {
        let _connecting = self.registry.as_ref().map(|r| GaugeGuard::new(&r.connecting));
        let config = self.config();
        let mut conn = Connection::new(stream);

        if let Err(e) = self.allow_incoming(&addr.ip) {
            let share = self.make_peer_share(&addr);
            let reject = Handshake::reject(&config, share);
            let _ = timeout(
                config.handshake_timeout,
                reject.write_to(&mut conn.writer, HandshakeFormat::for_version(config.protocol_version)),
            )
            .await;
            let _ = conn.writer.shutdown().await;
            return Err(e);
        }

        let (handshake, version) =
            match timeout(config.handshake_timeout, self.answer_handshake(&mut conn, &config)).await {
                Ok(result) => result?,
                Err(_) => return Err(P2pError::HandshakeTimeout),
            };

        if handshake.loopback == self.instance_id {
            return Err(P2pError::Loopback);
        }

        let endpoint = Endpoint::new(addr.ip, handshake.listen_port.clone())?;
        self.register(conn, endpoint, &handshake, version, true)?;
        Ok(())
    }

    /// Dial an endpoint and run the dialing side of the handshake.
    ///
    /// Returns whether a peer was established and the alternatives offered
    /// by a refusing node.
    pub(crate) async fn dial(self: &Arc<Self>, endpoint: &Endpoint) -> (bool, Vec<Endpoint>) {
        let _connecting = self.registry.as_ref().map(|r| GaugeGuard::new(&r.connecting));
        tracing::debug!(addr = %endpoint, "Dialing");

        let stream = match self.dialer.dial(endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(addr = %endpoint, error = %e, "Dial failed");
                return (false, Vec::new());
            }
        };

        match self.handle_outgoing(stream, endpoint).await {
            Ok(peer) => {
                tracing::debug!(peer = %peer.hash, version = peer.version(), "Connected");
                (true, Vec::new())
            }
            Err(P2pError::Loopback) => {
                tracing::info!(addr = %endpoint, "Dialed ourselves");
                self.ban_address(endpoint, LOOPBACK_BAN);
                (false, Vec::new())
            }
            Err(P2pError::Rejected { alternatives }) => {
                tracing::debug!(addr = %endpoint, alternatives = alternatives.len(), "Connection refused");
                let alternatives = alternatives
                    .into_iter()
                    .filter(|ep| ep.valid() && !self.is_banned_endpoint(ep))
                    .collect();
                (false, alternatives)
            }
            Err(e) => {
                tracing::debug!(addr = %endpoint, error = %e, "Handshake failed");
                (false, Vec::new())
            }
        }
    }

    async fn handle_outgoing(self: &Arc<Self>, stream: TcpStream, endpoint: &Endpoint) -> P2pResult<Arc<Peer>> {
        let config = self.config();
        let mut conn = Connection::new(stream);

        let (reply, version) =
            match timeout(config.handshake_timeout, self.request_handshake(&mut conn, &config)).await {
                Ok(result) => result?,
                Err(_) => return Err(P2pError::HandshakeTimeout),
            };

        self.register(conn, endpoint.clone(), &reply, version, false)
    }

    /// Read the remote handshake and answer with the negotiated version.
    async fn answer_handshake(&self, conn: &mut Connection, config: &P2pConfig) -> P2pResult<(Handshake, u16)> {
        let (handshake, format) = Handshake::read_from(&mut conn.reader).await?;
        handshake.valid(config)?;
        let version = negotiate(
            config.protocol_version_minimum,
            config.protocol_version,
            handshake.min_version,
            handshake.version,
        )?;

        let mut reply = Handshake::new(config, self.instance_id);
        reply.version = version;
        reply
            .write_to(&mut conn.writer, HandshakeFormat::for_version(version))
            .await?;
        tracing::trace!(?format, version, "Handshake answered");
        Ok((handshake, version))
    }

    /// Send our handshake and verify the answer.
    async fn request_handshake(&self, conn: &mut Connection, config: &P2pConfig) -> P2pResult<(Handshake, u16)> {
        let handshake = Handshake::new(config, self.instance_id);
        handshake
            .write_to(&mut conn.writer, HandshakeFormat::for_version(config.protocol_version))
            .await?;

        let (reply, _) = Handshake::read_from(&mut conn.reader).await?;
        reply.valid(config)?;
        if reply.kind == ParcelType::RejectAlternative {
            return Err(P2pError::Rejected {
                alternatives: reply.alternatives,
            });
        }
        if reply.loopback == self.instance_id {
            return Err(P2pError::Loopback);
        }

        let version = negotiate(
            config.protocol_version_minimum,
            config.protocol_version,
            reply.min_version,
            reply.version,
        )?;
        if version != reply.version {
            return Err(P2pError::HandshakeFailed(format!(
                "remote picked version {} instead of {}",
                reply.version, version
            )));
        }
        Ok((reply, version))
    }

    /// Create a peer for a finished handshake, start it and announce it.
    fn register(
        self: &Arc<Self>,
        conn: Connection,
        endpoint: Endpoint,
        handshake: &Handshake,
        version: u16,
        incoming: bool,
    ) -> P2pResult<Arc<Peer>> {
        let config = self.config();
        let protocol = Protocol::for_version(version, &config);
        let peer = Peer::new(
            &config,
            endpoint,
            handshake.node_id,
            incoming,
            protocol.clone(),
            conn.traffic,
            self.status_tx.clone(),
        );

        self.status_tx
            .send(PeerStatus {
                peer: peer.clone(),
                online: true,
            })
            .map_err(|_| P2pError::ChannelClosed("peer status".to_string()))?;

        peer.start(
            ProtocolReader::new(conn.reader, protocol.clone()),
            ProtocolWriter::new(conn.writer, protocol),
            self.data_tx.clone(),
            &config,
        );

        // protocol 9 nodes expect a share in response to their handshake
        if handshake.kind == ParcelType::PeerRequest {
            let parcel = Parcel::new(ParcelType::PeerRequest, "Peer Request").with_address(peer.hash.clone());
            let request = PeerParcel {
                peer: peer.clone(),
                parcel,
            };
            let data = self.data_tx.clone();
            let requester = peer.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = requester.stopped() => {}
                    sent = data.send(request) => {
                        if sent.is_err() {
                            tracing::debug!(peer = %requester.hash, "Dropped handshake peer request");
                        }
                    }
                }
            });
        }

        tracing::info!(
            peer = %peer.hash,
            incoming,
            version,
            "Peer connected"
        );
        Ok(peer)
    }

    pub(crate) async fn manage_online(self: Arc<Self>, mut status: mpsc::UnboundedReceiver<PeerStatus>) {
        loop {
            let PeerStatus { peer, online } = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                status = status.recv() => match status {
                    Some(status) => status,
                    None => break,
                },
            };

            if online {
                if peer.is_stopped() {
                    continue;
                }
                if let Some(old) = self.peers.get(&peer.hash) {
                    tracing::debug!(peer = %peer.hash, "Replacing existing connection");
                    old.stop();
                    self.peers.remove(&old);
                }
                if let Err(e) = self.peers.add(peer) {
                    tracing::error!(error = %e, "Unable to register peer");
                }
            } else if self.peers.remove(&peer) {
                tracing::info!(peer = %peer.hash, "Peer disconnected");
            }

            self.update_gauges();
        }
    }
}
