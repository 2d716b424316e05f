//! Helios Core Library
//!
//! A minimal peer-to-peer overlay node: gossip announce plus direct chat
//! streams over iroh.
//!
//! ## Overview
//!
//! Every node gets an ephemeral Ed25519 identity, listens on one or more
//! addresses, dials its bootstrap peers and joins a gossip topic. When a node
//! announces its address on the topic, every other node connects back, opens
//! a direct stream and greets it with `hello from: <peer-id>`. From then on,
//! lines typed on either side travel over the stream.
//!
//! ## Quick Start
//!
//! ```ignore
//! use helios_core::{Address, Config, Node, NodeEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default()
//!         .with_listen_address(Address::parse("/ip4/127.0.0.1/udp/9001")?);
//!
//!     let node = Node::start(config).await?;
//!     println!("announce: {}", node.announce_address());
//!
//!     let mut events = node.subscribe_events();
//!     while let Ok(event) = events.recv().await {
//!         if let NodeEvent::LineReceived { peer, line } = event {
//!             println!("{}> {}", peer.short(), line);
//!         }
//!     }
//!
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod identity;
pub mod node;
pub mod overlay;

// Re-exports
pub use address::{Address, AddressList, Host, Transport};
pub use config::{Config, SelfReplyPolicy, DEFAULT_PROTOCOL_ID, DEFAULT_TOPIC};
pub use error::{Fault, NodeError, NodeResult};
pub use identity::{NodeIdentity, PeerId};
pub use node::Node;
pub use overlay::{
    BootstrapReport, GossipMessage, GossipSession, NodeEvent, Payload, StreamDirection,
    TopicPublisher,
};
