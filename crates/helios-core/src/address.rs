//! Structured multi-part network addresses
//!
//! Format: `/<host-proto>/<host>/<transport>/<port>[/quic-v1][/p2p/<peer-id>]`
//!
//! ```text
//! /ip4/127.0.0.1/tcp/9001
//! /ip6/::1/udp/9001/quic-v1
//! /dns4/seed.example.org/tcp/4001/p2p/6MkZ3wV7...
//! ```
//!
//! The transport segment is kept for display and round-tripping; the overlay
//! always speaks QUIC on the UDP port with the same number.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{NodeError, NodeResult};
use crate::identity::PeerId;

/// Host part of an address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    /// Any address family
    Dns(String),
    Dns4(String),
    Dns6(String),
}

impl Host {
    fn protocol(&self) -> &'static str {
        match self {
            Host::Ip4(_) => "ip4",
            Host::Ip6(_) => "ip6",
            Host::Dns(_) => "dns",
            Host::Dns4(_) => "dns4",
            Host::Dns6(_) => "dns6",
        }
    }

    fn parse(protocol: &str, value: &str) -> NodeResult<Self> {
        let malformed = |what: &str| NodeError::MalformedAddress(format!("invalid {} value '{}'", what, value));
        match protocol {
            "ip4" => value.parse().map(Host::Ip4).map_err(|_| malformed("ip4")),
            "ip6" => value.parse().map(Host::Ip6).map_err(|_| malformed("ip6")),
            "dns" | "dns4" | "dns6" => {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    return Err(malformed(protocol));
                }
                let name = value.to_string();
                Ok(match protocol {
                    "dns" => Host::Dns(name),
                    "dns4" => Host::Dns4(name),
                    _ => Host::Dns6(name),
                })
            }
            other => Err(NodeError::MalformedAddress(format!(
                "unknown host protocol '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip4(ip) => write!(f, "{}", ip),
            Host::Ip6(ip) => write!(f, "{}", ip),
            Host::Dns(name) | Host::Dns4(name) | Host::Dns6(name) => write!(f, "{}", name),
        }
    }
}

/// Transport segment of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// A parsed network address with an optional embedded peer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: Host,
    transport: Transport,
    port: u16,
    quic: bool,
    peer: Option<PeerId>,
}

impl Address {
    /// Parse an address string.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::MalformedAddress` if the string is empty, does not
    /// start with `/`, names an unknown protocol, or has a bad host, port or
    /// peer id segment.
    pub fn parse(raw: &str) -> NodeResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(NodeError::MalformedAddress("address is empty".to_string()));
        }
        let rest = raw.strip_prefix('/').ok_or_else(|| {
            NodeError::MalformedAddress(format!("address '{}' must start with '/'", raw))
        })?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let mut segments = rest.split('/');
        let mut next = |what: &str| {
            segments
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| NodeError::MalformedAddress(format!("'{}' is missing {}", raw, what)))
        };

        let host_protocol = next("a host protocol")?;
        let host_value = next("a host value")?;
        let host = Host::parse(host_protocol, host_value)?;

        let transport = match next("a transport protocol")? {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            other => {
                return Err(NodeError::MalformedAddress(format!(
                    "unknown transport protocol '{}'",
                    other
                )))
            }
        };

        let port_str = next("a port")?;
        let port = port_str
            .parse::<u16>()
            .map_err(|_| NodeError::MalformedAddress(format!("invalid port '{}'", port_str)))?;

        let mut quic = false;
        let mut peer = None;
        let mut tail = segments.peekable();

        if tail.peek() == Some(&"quic-v1") {
            if transport != Transport::Udp {
                return Err(NodeError::MalformedAddress(
                    "quic-v1 requires a udp transport".to_string(),
                ));
            }
            quic = true;
            tail.next();
        }

        if let Some(segment) = tail.next() {
            if segment != "p2p" {
                return Err(NodeError::MalformedAddress(format!(
                    "unexpected segment '{}'",
                    segment
                )));
            }
            let id = tail
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| NodeError::MalformedAddress("p2p segment is missing a peer id".to_string()))?;
            peer = Some(id.parse::<PeerId>()?);
        }

        if let Some(extra) = tail.next() {
            return Err(NodeError::MalformedAddress(format!(
                "trailing segment '{}' after peer id",
                extra
            )));
        }

        Ok(Self {
            host,
            transport,
            port,
            quic,
            peer,
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The embedded `/p2p/` peer id, if any
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer
    }

    /// Copy of this address with the peer-id suffix set
    pub fn with_peer_id(&self, peer: PeerId) -> Self {
        Self {
            peer: Some(peer),
            ..self.clone()
        }
    }

    /// Copy of this address with a different port
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Socket address for IP hosts; `None` for DNS hosts
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::Ip4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Host::Ip6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            _ => None,
        }
    }

    /// Resolve to socket addresses, looking DNS hosts up.
    pub async fn resolve(&self) -> NodeResult<Vec<SocketAddr>> {
        let (name, want_v4, want_v6) = match &self.host {
            Host::Dns(name) => (name, true, true),
            Host::Dns4(name) => (name, true, false),
            Host::Dns6(name) => (name, false, true),
            Host::Ip4(ip) => return Ok(vec![SocketAddr::new(IpAddr::V4(*ip), self.port)]),
            Host::Ip6(ip) => return Ok(vec![SocketAddr::new(IpAddr::V6(*ip), self.port)]),
        };

        let resolved: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), self.port))
            .await
            .map_err(|e| NodeError::Connect(format!("failed to resolve {}: {}", name, e)))?
            .filter(|addr| (addr.is_ipv4() && want_v4) || (addr.is_ipv6() && want_v6))
            .collect();

        if resolved.is_empty() {
            return Err(NodeError::Connect(format!("{} resolved to no usable addresses", name)));
        }
        Ok(resolved)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.host.protocol(),
            self.host,
            self.transport,
            self.port
        )?;
        if self.quic {
            write!(f, "/quic-v1")?;
        }
        if let Some(peer) = &self.peer {
            write!(f, "/p2p/{}", peer)?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Ordered list of addresses, in configuration order.
///
/// The first listen address is the one advertised in announce messages, so
/// insertion order matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList(Vec<Address>);

impl AddressList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Parse `raw` and append it to the list
    pub fn append(&mut self, raw: &str) -> NodeResult<()> {
        self.0.push(Address::parse(raw)?);
        Ok(())
    }

    pub fn push(&mut self, address: Address) {
        self.0.push(address);
    }

    pub fn first(&self) -> Option<&Address> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Address> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AddressList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|a| a.to_string()).collect();
        write!(f, "{}", joined.join(","))
    }
}

impl FromIterator<Address> for AddressList {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a AddressList {
    type Item = &'a Address;
    type IntoIter = std::slice::Iter<'a, Address>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
