//! Gossip payloads
//!
//! Messages on the topic are tagged so a receiver never has to guess whether
//! a payload is meant to be dialed:
//!
//! - **Announce**: `<listen-multiaddr>/p2p/<peer-id>` of the publisher, an
//!   invitation to connect back and open a direct stream
//! - **Chat**: free-form bytes, only logged and surfaced as events

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::identity::PeerId;

/// Body of a gossip message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Connect-back address of the publisher (UTF-8 multiaddr text)
    Announce { address: String },
    /// Free-form message
    Chat { body: Vec<u8> },
}

impl Payload {
    /// Announce payload for a full address (including `/p2p/` suffix)
    pub fn announce(address: &Address) -> Self {
        Payload::Announce {
            address: address.to_string(),
        }
    }

    /// Chat payload from any bytes
    pub fn chat(body: impl Into<Vec<u8>>) -> Self {
        Payload::Chat { body: body.into() }
    }

    pub fn is_announce(&self) -> bool {
        matches!(self, Payload::Announce { .. })
    }

    /// Raw payload bytes: the address text or the chat body
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Announce { address } => address.as_bytes(),
            Payload::Chat { body } => body,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Announce { address } => write!(f, "announce {}", address),
            Payload::Chat { body } => write!(f, "{}", String::from_utf8_lossy(body)),
        }
    }
}

/// A verified message received from the topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    /// Original publisher (verified by signature), not the relaying neighbor
    pub sender: PeerId,
    /// Topic name the message was published on
    pub topic: String,
    pub payload: Payload,
}
