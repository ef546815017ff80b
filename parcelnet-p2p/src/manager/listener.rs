//! TCP listener that limits how often an ip may connect.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};

use crate::error::{P2pError, P2pResult};

/// Listener rejecting connections from an ip seen within `limit`.
pub struct LimitedListener {
    listener: TcpListener,
    limit: Duration,
    last_connection: Option<Instant>,
    /// Accepted ips, oldest first.
    history: VecDeque<(String, Instant)>,
}

impl LimitedListener {
    pub async fn bind(address: &str, limit: Duration) -> P2pResult<Self> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!(addr = %listener.local_addr()?, "Listening for inbound connections");
        Ok(Self {
            listener,
            limit,
            last_connection: None,
            history: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> P2pResult<SocketAddr> {
        self.listener.local_addr().map_err(P2pError::Io)
    }

    /// Accept the next connection from an ip not seen within the limit.
    /// Connections that are too frequent are closed right away.
    pub async fn accept(&mut self) -> P2pResult<(TcpStream, SocketAddr)> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let ip = addr.ip().to_string();

            if self.is_in_history(&ip) {
                tracing::debug!(addr = %addr, "Rejecting connection, connected too recently");
                drop(stream);
                continue;
            }

            self.add_to_history(ip);
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
            }
            return Ok((stream, addr));
        }
    }

    fn clear_history(&mut self) {
        let Some(last) = self.last_connection else {
            self.history.clear();
            return;
        };

        if last.elapsed() >= self.limit {
            self.history.clear();
            return;
        }

        while let Some((_, time)) = self.history.front() {
            if time.elapsed() < self.limit {
                break;
            }
            self.history.pop_front();
        }
    }

    fn is_in_history(&mut self, ip: &str) -> bool {
        self.clear_history();
        self.history.iter().any(|(seen, _)| seen == ip)
    }

    fn add_to_history(&mut self, ip: String) {
        let now = Instant::now();
        self.last_connection = Some(now);
        self.history.push_back((ip, now));
    }
}
