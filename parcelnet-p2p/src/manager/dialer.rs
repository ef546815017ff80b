//! Rate limited outgoing connections.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};

/// Opens TCP connections, at most one attempt per endpoint per interval.
pub struct Dialer {
    bind_ip: Option<IpAddr>,
    interval: Duration,
    timeout: Duration,
    attempts: Mutex<HashMap<Endpoint, Instant>>,
}

impl Dialer {
    /// Create a dialer. `bind_to` is the local ip outgoing connections use,
    /// empty for any.
    pub fn new(bind_to: &str, interval: Duration, timeout: Duration) -> P2pResult<Self> {
        let bind_ip = if bind_to.is_empty() {
            None
        } else {
            Some(
                bind_to
                    .parse::<IpAddr>()
                    .map_err(|_| P2pError::InvalidEndpoint(bind_to.to_string()))?,
            )
        };

        Ok(Self {
            bind_ip,
            interval,
            timeout,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// True if the endpoint was not dialed within the interval.
    pub fn can_dial(&self, endpoint: &Endpoint) -> bool {
        match self.attempts.lock().get(endpoint) {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        }
    }

    /// Record an attempt unless one happened within the interval. The
    /// attempt is recorded when the dial starts, not when it completes.
    fn claim(&self, endpoint: &Endpoint) -> bool {
        let mut attempts = self.attempts.lock();
        let interval = self.interval;
        attempts.retain(|_, last| last.elapsed() < interval);
        if attempts.contains_key(endpoint) {
            return false;
        }
        attempts.insert(endpoint.clone(), Instant::now());
        true
    }

    /// Connect to the endpoint.
    pub async fn dial(&self, endpoint: &Endpoint) -> P2pResult<TcpStream> {
        if !self.claim(endpoint) {
            return Err(P2pError::ConnectionTimeout {
                addr: format!("{endpoint} (dialed too recently)"),
            });
        }

        let address = endpoint.connect_address();
        match timeout(self.timeout, self.connect(&address)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(addr = %endpoint, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(P2pError::ConnectionTimeout { addr: address }),
        }
    }

    async fn connect(&self, address: &str) -> P2pResult<TcpStream> {
        let target: SocketAddr = lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| P2pError::InvalidEndpoint(address.to_string()))?;

        let Some(ip) = self.bind_ip else {
            return Ok(TcpStream::connect(target).await?);
        };

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(ip, 0))?;
        Ok(socket.connect(target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_invalid_bind() {
        assert!(Dialer::new("not an ip", Duration::from_secs(1), Duration::from_secs(1)).is_err());
        assert!(Dialer::new("", Duration::from_secs(1), Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_dial_rate_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ep = Endpoint::from_socket_addr(&listener.local_addr().unwrap());

        let dialer = Dialer::new("127.0.0.1", Duration::from_secs(60), Duration::from_secs(5)).unwrap();
        assert!(dialer.can_dial(&ep));
        dialer.dial(&ep).await.unwrap();
        assert!(!dialer.can_dial(&ep));
        assert!(dialer.dial(&ep).await.is_err());

        let other = Endpoint::new("127.0.0.1", "1").unwrap();
        assert!(dialer.can_dial(&other));
    }

    #[tokio::test]
    async fn test_failed_dial_still_counts() {
        // bind and drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let ep = Endpoint::new("127.0.0.1", port.to_string()).unwrap();

        let dialer = Dialer::new("", Duration::from_secs(60), Duration::from_secs(1)).unwrap();
        assert!(dialer.dial(&ep).await.is_err());
        assert!(!dialer.can_dial(&ep));

        let quick = Dialer::new("", Duration::ZERO, Duration::from_secs(1)).unwrap();
        assert!(quick.dial(&ep).await.is_err());
        assert!(quick.can_dial(&ep));
    }
}
