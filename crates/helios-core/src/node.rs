//! Node orchestration
//!
//! Wires the pieces together in startup order:
//!
//! 1. validate configuration and create (or take) an identity
//! 2. bind the overlay on the listen addresses
//! 3. dial bootstrap peers
//! 4. join the gossip topic and wait briefly for a neighbor
//! 5. start the broadcast loop
//! 6. announce our own address (unless disabled)
//!
//! Any failure up to step 5 aborts startup. After that, failures are
//! contained by the loop that hit them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::address::{Address, Host};
use crate::config::Config;
use crate::error::{NodeError, NodeResult};
use crate::identity::{NodeIdentity, PeerId};
use crate::overlay::bootstrap::{self, BootstrapReport};
use crate::overlay::broadcast::BroadcastLoop;
use crate::overlay::events::{NodeEvent, EVENT_CHANNEL_CAPACITY};
use crate::overlay::gossip::{GossipSession, TopicPublisher};
use crate::overlay::protocol::Payload;
use crate::overlay::stream::{SessionContext, INPUT_CHANNEL_CAPACITY};
use crate::overlay::stream_handler::StreamAcceptor;
use crate::overlay::transport::Overlay;

/// How long shutdown waits for background tasks
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running overlay node
pub struct Node {
    identity: Arc<NodeIdentity>,
    config: Config,
    overlay: Arc<Overlay>,
    publisher: TopicPublisher,
    announce_address: Address,
    bootstrap: BootstrapReport,
    ctx: SessionContext,
}

impl Node {
    /// Start a node with a freshly generated identity.
    pub async fn start(config: Config) -> NodeResult<Self> {
        let identity = NodeIdentity::generate()?;
        Self::start_with_identity(config, identity).await
    }

    /// Start a node with the given identity.
    ///
    /// # Errors
    ///
    /// Returns a startup error (`Config`, `Bind`, `Join`) if the node could
    /// not come up. Bootstrap peers that fail are only logged.
    pub async fn start_with_identity(config: Config, identity: NodeIdentity) -> NodeResult<Self> {
        config.validate()?;

        let identity = Arc::new(identity);
        info!(peer_id = %identity.peer_id(), "Starting node");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (input, _) = broadcast::channel(INPUT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ctx = SessionContext::new(events, input, cancel.clone(), tracker.clone());

        let acceptor = StreamAcceptor::new(config.protocol_id.clone(), ctx.clone());
        let overlay = Arc::new(
            Overlay::listen(&identity, &config.listen_addresses, acceptor, config.connect_timeout)
                .await?,
        );

        let first_listen = config
            .listen_addresses
            .first()
            .ok_or_else(|| NodeError::Config("at least one listen address is required".to_string()))?;
        let announce_address =
            announce_address(first_listen, &overlay.bound_addresses(), identity.peer_id());
        if is_unspecified(&announce_address) {
            warn!(address = %announce_address, "Announcing an unspecified address, peers may not be able to dial it");
        }
        info!(address = %announce_address, "Listening");

        let report = bootstrap::connect_all(&overlay, &config.bootstrap_peers).await;

        let mut session = GossipSession::new(overlay.gossip().clone(), identity.clone(), cancel.child_token());
        if let Err(e) = session.join(&config.topic, report.connected.clone()).await {
            overlay.shutdown().await;
            return Err(e);
        }

        if !report.connected.is_empty() && !session.wait_ready(config.mesh_ready_timeout).await {
            warn!(
                timeout = ?config.mesh_ready_timeout,
                "No gossip neighbor yet, continuing without one"
            );
        }

        let publisher = session.publisher()?;
        let broadcast_loop =
            BroadcastLoop::new(session, overlay.clone(), config.self_reply_policy, ctx.clone());
        tracker.spawn(broadcast_loop.run());

        let node = Self {
            identity,
            config,
            overlay,
            publisher,
            announce_address,
            bootstrap: report,
            ctx,
        };

        if node.config.announce_on_start {
            if let Err(e) = node.announce().await {
                warn!(error = %e, "Failed to publish startup announce");
            }
        }

        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address published by [`Node::announce`]: first listen address with the
    /// bound port and our `/p2p/` id
    pub fn announce_address(&self) -> &Address {
        &self.announce_address
    }

    /// Outcome of the startup bootstrap
    pub fn bootstrap_report(&self) -> &BootstrapReport {
        &self.bootstrap
    }

    /// Subscribe to node events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.events().subscribe()
    }

    /// Sender feeding the write loop of every open stream
    pub fn input(&self) -> broadcast::Sender<String> {
        self.ctx.input().clone()
    }

    /// Send one line to every open stream; returns how many streams got it
    pub fn send_line(&self, line: impl Into<String>) -> usize {
        self.ctx.input().send(line.into()).unwrap_or(0)
    }

    /// Number of stream sessions currently running
    pub fn open_streams(&self) -> usize {
        self.ctx.input().receiver_count()
    }

    /// Publish a payload on the topic
    pub async fn publish(&self, payload: Payload) -> NodeResult<()> {
        self.publisher.publish(payload).await
    }

    /// Publish our announce address on the topic
    pub async fn announce(&self) -> NodeResult<()> {
        info!(address = %self.announce_address, "Announcing");
        self.publish(Payload::announce(&self.announce_address)).await
    }

    /// Stop all loops and sessions, then close the overlay.
    pub async fn shutdown(self) -> NodeResult<()> {
        info!("Closing host");

        self.ctx.cancel_token().cancel();
        let tracker = self.ctx.tracker();
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "Background tasks still running at shutdown");
        }

        self.overlay.shutdown().await;
        info!("Node shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.identity.peer_id())
            .field("announce_address", &self.announce_address.to_string())
            .field("topic", &self.config.topic)
            .finish_non_exhaustive()
    }
}

/// Announce address for `listen`: a zero port is replaced with the port
/// actually bound for the same address family.
pub fn announce_address(listen: &Address, bound: &[SocketAddr], local: PeerId) -> Address {
    let mut address = listen.clone();
    if address.port() == 0 {
        let want_v4 = matches!(address.host(), Host::Ip4(_));
        if let Some(socket) = bound.iter().find(|socket| socket.is_ipv4() == want_v4) {
            address = address.with_port(socket.port());
        }
    }
    address.with_peer_id(local)
}

fn is_unspecified(address: &Address) -> bool {
    address
        .socket_addr()
        .map(|socket| socket.ip().is_unspecified())
        .unwrap_or(false)
}
