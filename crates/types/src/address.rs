//! Unresolved peer endpoints.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An invalid peer address string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("unterminated IPv6 bracket")]
    UnterminatedBracket,
    #[error("trailing characters after IPv6 bracket")]
    TrailingCharacters,
}

/// An unresolved peer endpoint: a host (IPv4, IPv6 or hostname) plus a
/// port. Two addresses are equal when their unresolved forms are equal;
/// resolution to socket addresses is a separate, fallible step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Build an address from an already-split host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ParseError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ParseError::EmptyHost);
        }
        Ok(Self { host, port })
    }

    /// Parse `host`, `host:port`, `[ipv6]` or `[ipv6]:port`. Addresses
    /// without an explicit port get `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, ParseError> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6, optionally followed by `:port`.
            let end = rest.find(']').ok_or(ParseError::UnterminatedBracket)?;
            let host = &rest[..end];
            let tail = &rest[end + 1..];

            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| ParseError::InvalidPort(p.to_owned()))?,
                None if tail.is_empty() => default_port,
                None => return Err(ParseError::TrailingCharacters),
            };
            return Self::new(host, port);
        }

        // A bare IPv6 address contains multiple colons and no brackets.
        if s.matches(':').count() > 1 {
            return Self::new(s, default_port);
        }

        match s.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ParseError::InvalidPort(port.to_owned()))?;
                Self::new(host, port)
            }
            None => Self::new(s, default_port),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the host is a literal IPv6 address.
    pub fn is_ipv6(&self) -> bool {
        self.host.parse::<IpAddr>().map_or(false, |ip| ip.is_ipv6())
    }

    /// Resolve to socket addresses. This may hit the resolver and fail.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for PeerAddress {}

impl std::hash::Hash for PeerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: u16 = 12392;

    #[test]
    fn parses_bare_host() {
        let addr = PeerAddress::parse("node.example.com", PORT).unwrap();
        assert_eq!(addr.host(), "node.example.com");
        assert_eq!(addr.port(), PORT);
    }

    #[test]
    fn parses_host_with_port() {
        let addr = PeerAddress::parse("10.1.2.3:9000", PORT).unwrap();
        assert_eq!(addr.host(), "10.1.2.3");
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let addr = PeerAddress::parse("[2001:db8::1]", PORT).unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert_eq!(addr.port(), PORT);

        let addr = PeerAddress::parse("[2001:db8::1]:9000", PORT).unwrap();
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn parses_bare_ipv6() {
        let addr = PeerAddress::parse("2001:db8::1", PORT).unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert_eq!(addr.port(), PORT);
        assert!(addr.is_ipv6());
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert_eq!(PeerAddress::parse("", PORT), Err(ParseError::EmptyHost));
        assert_eq!(PeerAddress::parse(":123", PORT), Err(ParseError::EmptyHost));
        assert!(matches!(
            PeerAddress::parse("host:notaport", PORT),
            Err(ParseError::InvalidPort(_))
        ));
        assert_eq!(
            PeerAddress::parse("[2001:db8::1", PORT),
            Err(ParseError::UnterminatedBracket)
        );
        assert_eq!(
            PeerAddress::parse("[2001:db8::1]x", PORT),
            Err(ParseError::TrailingCharacters)
        );
    }

    #[test]
    fn equality_ignores_host_case() {
        let a = PeerAddress::parse("Node.Example.COM:9000", PORT).unwrap();
        let b = PeerAddress::parse("node.example.com:9000", PORT).unwrap();
        assert_eq!(a, b);

        let c = PeerAddress::parse("node.example.com:9001", PORT).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn displays_ipv6_bracketed() {
        let addr = PeerAddress::parse("2001:db8::1", 9000).unwrap();
        assert_eq!(addr.to_string(), "[2001:db8::1]:9000");
    }
}
