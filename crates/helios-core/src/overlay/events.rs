//! Node events for UI and CLI consumers
//!
//! The node runs its loops in background tasks. Anything a user would want to
//! see (neighbors, gossip, stream lines) is mirrored onto a broadcast channel so
//! a front end can print it without touching the loops themselves.

use std::fmt;

use tokio::sync::broadcast;

use crate::identity::PeerId;
use crate::overlay::protocol::GossipMessage;

/// Capacity of the node event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which side opened a direct stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Remote peer opened the stream to us
    Inbound,
    /// We opened the stream in reaction to an announce
    Outbound,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::Inbound => write!(f, "inbound"),
            StreamDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Events emitted by a running node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A gossip neighbor joined the topic mesh
    NeighborUp { peer: PeerId },
    /// A gossip neighbor left the topic mesh
    NeighborDown { peer: PeerId },
    /// A verified message arrived on the topic (including our own)
    MessageReceived(GossipMessage),
    /// A direct stream session started
    StreamOpened {
        peer: PeerId,
        direction: StreamDirection,
    },
    /// A non-empty line was read from a direct stream
    LineReceived { peer: PeerId, line: String },
    /// A direct stream session ended
    StreamClosed {
        peer: PeerId,
        direction: StreamDirection,
    },
    /// Reacting to an announce failed (connect, open, or greeting write)
    ReactionFailed { peer: PeerId, error: String },
}

/// Sender half of the node event channel
pub type EventSender = broadcast::Sender<NodeEvent>;
