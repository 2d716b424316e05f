//! Node configuration
//!
//! Built once at startup (usually from CLI flags) and validated before any
//! socket is bound.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::address::{Address, AddressList, Host};
use crate::error::{NodeError, NodeResult};

/// Protocol id used for direct streams when none is given
pub const DEFAULT_PROTOCOL_ID: &str = "/test/0.0.1";

/// Gossip topic name used when none is given
pub const DEFAULT_TOPIC: &str = "helios";

/// Default bound on a single outbound connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on waiting for the first gossip neighbor after bootstrap
pub const DEFAULT_MESH_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// ALPN identifiers are length-prefixed with a single byte
const MAX_PROTOCOL_ID_LEN: usize = 255;

/// Which identity counts as "ourselves" when deciding whether to react to an
/// announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelfReplyPolicy {
    /// Skip only messages whose verified sender is this node
    #[default]
    Sender,
    /// Additionally skip announces whose `/p2p/` id is this node, even when
    /// relayed or re-published by someone else
    Announced,
}

impl fmt::Display for SelfReplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfReplyPolicy::Sender => write!(f, "sender"),
            SelfReplyPolicy::Announced => write!(f, "announced"),
        }
    }
}

impl FromStr for SelfReplyPolicy {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sender" => Ok(SelfReplyPolicy::Sender),
            "announced" => Ok(SelfReplyPolicy::Announced),
            other => Err(NodeError::Config(format!(
                "unknown self-reply policy '{}' (expected 'sender' or 'announced')",
                other
            ))),
        }
    }
}

/// Startup configuration for a node
#[derive(Debug, Clone)]
pub struct Config {
    /// Addresses to listen on; the first one is announced
    pub listen_addresses: AddressList,
    /// Peers dialed at startup and used as gossip bootstrap
    pub bootstrap_peers: AddressList,
    /// Direct-stream protocol id (used as the ALPN)
    pub protocol_id: String,
    /// Gossip topic name
    pub topic: String,
    pub self_reply_policy: SelfReplyPolicy,
    /// Publish our own address once the topic is joined
    pub announce_on_start: bool,
    pub connect_timeout: Duration,
    pub mesh_ready_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addresses: AddressList::new(),
            bootstrap_peers: AddressList::new(),
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            self_reply_policy: SelfReplyPolicy::default(),
            announce_on_start: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            mesh_ready_timeout: DEFAULT_MESH_READY_TIMEOUT,
        }
    }
}

impl Config {
    pub fn with_listen_address(mut self, address: Address) -> Self {
        self.listen_addresses.push(address);
        self
    }

    pub fn with_bootstrap_peer(mut self, address: Address) -> Self {
        self.bootstrap_peers.push(address);
        self
    }

    pub fn with_protocol_id(mut self, protocol_id: impl Into<String>) -> Self {
        self.protocol_id = protocol_id.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_self_reply_policy(mut self, policy: SelfReplyPolicy) -> Self {
        self.self_reply_policy = policy;
        self
    }

    pub fn with_announce_on_start(mut self, announce: bool) -> Self {
        self.announce_on_start = announce;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_mesh_ready_timeout(mut self, timeout: Duration) -> Self {
        self.mesh_ready_timeout = timeout;
        self
    }

    /// Check the configuration before starting a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Config` if no listen address is given, a listen
    /// address is not an IP literal, or the protocol id / topic is unusable.
    pub fn validate(&self) -> NodeResult<()> {
        if self.listen_addresses.is_empty() {
            return Err(NodeError::Config(
                "at least one listen address is required".to_string(),
            ));
        }

        for address in self.listen_addresses.iter() {
            if !matches!(address.host(), Host::Ip4(_) | Host::Ip6(_)) {
                return Err(NodeError::Config(format!(
                    "listen address {} must use /ip4 or /ip6",
                    address
                )));
            }
        }

        if self.protocol_id.is_empty() {
            return Err(NodeError::Config("protocol id must not be empty".to_string()));
        }
        if self.protocol_id.len() > MAX_PROTOCOL_ID_LEN {
            return Err(NodeError::Config(format!(
                "protocol id is {} bytes, limit is {}",
                self.protocol_id.len(),
                MAX_PROTOCOL_ID_LEN
            )));
        }
        if self.protocol_id.as_bytes() == iroh_gossip::net::GOSSIP_ALPN {
            return Err(NodeError::Config(
                "protocol id collides with the gossip protocol".to_string(),
            ));
        }

        if self.topic.trim().is_empty() {
            return Err(NodeError::Config("topic must not be empty".to_string()));
        }

        if self.connect_timeout.is_zero() {
            return Err(NodeError::Config("connect timeout must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen() -> Address {
        Address::parse("/ip4/127.0.0.1/udp/0").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.protocol_id, "/test/0.0.1");
        assert_eq!(config.topic, "helios");
        assert_eq!(config.self_reply_policy, SelfReplyPolicy::Sender);
        assert!(config.announce_on_start);
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_missing_listen_rejected() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn test_minimal_config_is_valid() {
        assert!(Config::default().with_listen_address(listen()).validate().is_ok());
    }

    #[test]
    fn test_dns_listen_rejected() {
        let config = Config::default()
            .with_listen_address(Address::parse("/dns4/localhost/udp/0").unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_protocol_ids_rejected() {
        let empty = Config::default().with_listen_address(listen()).with_protocol_id("");
        assert!(empty.validate().is_err());

        let long = Config::default()
            .with_listen_address(listen())
            .with_protocol_id("x".repeat(300));
        assert!(long.validate().is_err());

        let gossip = Config::default().with_listen_address(listen()).with_protocol_id(
            String::from_utf8(iroh_gossip::net::GOSSIP_ALPN.to_vec()).unwrap(),
        );
        assert!(gossip.validate().is_err());
    }

    #[test]
    fn test_empty_topic_rejected() {
        let config = Config::default().with_listen_address(listen()).with_topic("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_reply_policy_parse() {
        assert_eq!("sender".parse::<SelfReplyPolicy>().unwrap(), SelfReplyPolicy::Sender);
        assert_eq!("Announced".parse::<SelfReplyPolicy>().unwrap(), SelfReplyPolicy::Announced);
        assert!("everyone".parse::<SelfReplyPolicy>().is_err());
    }
}
