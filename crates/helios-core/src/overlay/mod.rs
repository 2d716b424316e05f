//! Peer overlay: gossip announce and direct streams
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Overlay                                                        │
//! │  ├── Endpoint (QUIC transport, static discovery, no relay)     │
//! │  ├── Gossip (topic pub/sub)                                    │
//! │  └── Router                                                    │
//! │      ├── gossip ALPN        -> Gossip                          │
//! │      └── protocol id ALPN   -> StreamAcceptor                  │
//! │                                                                 │
//! │  GossipSession (one topic)                                     │
//! │  ├── TopicPublisher (signed envelopes)                         │
//! │  └── BroadcastLoop (receive, log, react to announces)          │
//! │                                                                 │
//! │  Stream sessions (read loop + write loop per stream)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Flow
//!
//! 1. Node A announces `<listen>/p2p/<A>` on the topic
//! 2. Node B receives it, dials A and opens a direct stream
//! 3. B writes `hello from: <B>`; A prints it
//! 4. Lines typed on either side are sent to every open stream

pub mod bootstrap;
pub mod broadcast;
pub mod envelope;
pub mod events;
pub mod gossip;
pub mod protocol;
pub mod stream;
pub mod stream_handler;
pub mod transport;

pub use bootstrap::{connect_all, connect_to_peer, BootstrapReport};
pub use broadcast::{plan_reaction, BroadcastLoop, IgnoreReason, Reaction};
pub use envelope::{Envelope, ENVELOPE_VERSION};
pub use events::{NodeEvent, StreamDirection, EVENT_CHANNEL_CAPACITY};
pub use gossip::{topic_id, GossipSession, TopicEvent, TopicPublisher};
pub use protocol::{GossipMessage, Payload};
pub use stream::{
    greeting_line, parse_greeting, pump_lines, read_loop, run_session, write_line, write_loop,
    DirectStream, SessionContext, GREETING_PREFIX, INPUT_CHANNEL_CAPACITY,
};
pub use stream_handler::StreamAcceptor;
pub use transport::Overlay;
