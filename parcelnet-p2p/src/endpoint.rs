//! Network endpoints.
//!
//! An [`Endpoint`] is an (ip, port) pair kept in string form. The ip may be a
//! hostname; it is resolved only when dialing. `Display` renders `ip:port`
//! and is used as the key for bans, special peers and dial history.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{P2pError, P2pResult};

/// Longest hostname accepted by [`Endpoint::valid`].
const MAX_HOSTNAME_LEN: usize = 253;

/// Longest single hostname label.
const MAX_LABEL_LEN: usize = 63;

/// An immutable network address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address or hostname.
    #[serde(rename = "IP")]
    pub ip: String,
    /// Port, decimal.
    #[serde(rename = "Port")]
    pub port: String,
}

impl Endpoint {
    /// Create an endpoint. Both parts must be non-empty; range checks happen
    /// in [`Endpoint::valid`].
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> P2pResult<Self> {
        let ip = ip.into();
        let port = port.into();
        if ip.is_empty() {
            return Err(P2pError::InvalidEndpoint(format!("no ip given for port {port:?}")));
        }
        if port.is_empty() {
            return Err(P2pError::InvalidEndpoint(format!("no port given for {ip}")));
        }
        Ok(Self { ip, port })
    }

    /// Parse an `ip:port` string and validate it.
    pub fn parse(s: &str) -> P2pResult<Self> {
        let (ip, port) = split_host_port(s)?;
        let ep = Self::new(ip, port)?;
        if !ep.valid() {
            return Err(P2pError::InvalidEndpoint(s.to_string()));
        }
        Ok(ep)
    }

    /// Build an endpoint from a socket address.
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port().to_string(),
        }
    }

    /// True if the port is a number in 1..=65535 and the ip is either an ip
    /// literal or a well-formed hostname.
    pub fn valid(&self) -> bool {
        match self.port.parse::<u16>() {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }
        if self.ip.is_empty() {
            return false;
        }
        self.ip.parse::<IpAddr>().is_ok() || valid_hostname(&self.ip)
    }

    /// The address handed to the socket layer when dialing.
    pub fn connect_address(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Split `host:port`, accepting `[v6]:port`.
fn split_host_port(s: &str) -> P2pResult<(&str, &str)> {
    let invalid = || P2pError::InvalidEndpoint(s.to_string());

    if let Some(rest) = s.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        return Ok((host, port));
    }

    let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
    if host.contains(':') {
        return Err(invalid());
    }
    Ok((host, port))
}

fn valid_hostname(host: &str) -> bool {
    if host.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(ip: &str, port: &str) -> Endpoint {
        Endpoint {
            ip: ip.to_string(),
            port: port.to_string(),
        }
    }

    #[test]
    fn test_new_endpoint() {
        assert_eq!(Endpoint::new("127.0.0.1", "8088").unwrap(), ep("127.0.0.1", "8088"));
        assert_eq!(Endpoint::new("localhost", "8088").unwrap(), ep("localhost", "8088"));
        assert_eq!(
            Endpoint::new("xn--qei9019maa.xn--z38hpa", "8088").unwrap(),
            ep("xn--qei9019maa.xn--z38hpa", "8088")
        );
        assert!(Endpoint::new("", "").is_err());
        assert!(Endpoint::new("127.0.0.1", "").is_err());
        assert!(Endpoint::new("", "8088").is_err());
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(Endpoint::parse("127.0.0.1:80").unwrap(), ep("127.0.0.1", "80"));
        assert_eq!(Endpoint::parse("[::1]:80").unwrap(), ep("::1", "80"));

        for bad in [
            "127.0.0.1:70000",
            "127.0.0.1",
            "",
            ":80",
            "127.0.0.1,80",
            "127.0.0.1:80 test",
            "ip:127.0.0.1 port:80",
        ] {
            assert!(Endpoint::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ep("127.0.0.1", "8088").to_string(), "127.0.0.1:8088");
        assert_eq!(ep("", "8088").to_string(), ":8088");
        assert_eq!(ep("127.0.0.1", "").to_string(), "127.0.0.1:");
    }

    #[test]
    fn test_valid() {
        let longest = "abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcde.\
                       abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijk.\
                       abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijk.\
                       abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijk.com";

        assert!(ep("127.0.0.1", "80").valid());
        assert!(ep("localhost", "8088").valid());
        assert!(ep("factom.fct", "8088").valid());
        assert!(ep(longest, "8088").valid());
        assert!(ep("www.google.com", "8088").valid());
        assert!(ep("xn--qei9019maa.xn--z38hpa", "8088").valid());
        assert!(ep("::1", "8088").valid());

        assert!(!ep("", "8088").valid());
        assert!(!ep("127.0.0.1", "").valid());
        assert!(!ep("127.0.0.1", "0").valid());
        assert!(!ep("127.0.0.1", "eighty").valid());
        assert!(!ep("127.0.0.1", "80th").valid());
        assert!(!ep("localho$t", "8088").valid());
        assert!(!ep("-test.com", "8088").valid());
        assert!(!ep("test.-com", "8088").valid());
        assert!(!ep("https://www.google.com", "8088").valid());
    }

    #[test]
    fn test_equality() {
        assert_eq!(Endpoint::default(), ep("", ""));
        assert_eq!(ep("localhost", ""), ep("localhost", ""));
        assert_eq!(ep("127.0.0.1", "8108"), ep("127.0.0.1", "8108"));
        assert_ne!(ep("127.0.0.1", "51"), ep("127.0.0.1", "50"));
        assert_ne!(ep("127.0.0.1", "80"), ep("127.0.0.2", "80"));
    }

    #[test]
    fn test_connect_address() {
        assert_eq!(ep("127.0.0.1", "80").connect_address(), "127.0.0.1:80");
        assert_eq!(ep("::1", "80").connect_address(), "[::1]:80");
    }
}
