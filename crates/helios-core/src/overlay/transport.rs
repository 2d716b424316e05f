//! The overlay transport
//!
//! Wraps one iroh endpoint with two protocols registered on its router:
//!
//! - the gossip protocol (iroh-gossip ALPN)
//! - the direct-stream protocol, negotiated with the configured protocol id
//!
//! Peer addresses are only ever learned out of band (bootstrap flags and
//! announces), so the endpoint uses a static discovery provider and no relay.
//! Every address, whatever its transport segment, is dialed as QUIC on the
//! UDP port with the same number.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::Connection;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, RelayMode};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::{Address, AddressList};
use crate::error::{NodeError, NodeResult};
use crate::identity::{NodeIdentity, PeerId};
use crate::overlay::stream::DirectStream;
use crate::overlay::stream_handler::StreamAcceptor;

/// Upper bound for a single gossip message
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A bound endpoint with gossip and direct streams attached
#[derive(Debug)]
pub struct Overlay {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    alpn: Vec<u8>,
    /// Live direct-protocol connections, reused for stream opens
    connections: Mutex<HashMap<PeerId, Connection>>,
    connect_timeout: Duration,
}

impl Overlay {
    /// Bind the endpoint on `listen` and start the router.
    ///
    /// Only the first IPv4 and the first IPv6 address are bound; further
    /// addresses of the same family are ignored with a warning.
    pub async fn listen(
        identity: &NodeIdentity,
        listen: &AddressList,
        acceptor: StreamAcceptor,
        connect_timeout: Duration,
    ) -> NodeResult<Self> {
        let alpn = acceptor.protocol_id().as_bytes().to_vec();
        let static_provider = StaticProvider::new();

        let mut builder = Endpoint::builder()
            .secret_key(identity.secret_key())
            .alpns(vec![GOSSIP_ALPN.to_vec(), alpn.clone()])
            .relay_mode(RelayMode::Disabled)
            .clear_discovery()
            .discovery(static_provider.clone());

        let (mut bound_v4, mut bound_v6) = (false, false);
        for address in listen.iter() {
            match address.socket_addr() {
                Some(SocketAddr::V4(addr)) if !bound_v4 => {
                    builder = builder.bind_addr_v4(addr);
                    bound_v4 = true;
                }
                Some(SocketAddr::V6(addr)) if !bound_v6 => {
                    builder = builder.bind_addr_v6(addr);
                    bound_v6 = true;
                }
                Some(_) => warn!(%address, "Only one listen address per family is bound, ignoring"),
                None => {
                    return Err(NodeError::Config(format!(
                        "listen address {} is not an IP address",
                        address
                    )))
                }
            }
        }

        let endpoint = builder
            .bind()
            .await
            .map_err(|e| NodeError::Bind(e.to_string()))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, sockets = ?endpoint.bound_sockets(), "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(&alpn, acceptor)
            .spawn();
        debug!(protocol_id = %String::from_utf8_lossy(&alpn), "Router spawned");

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            alpn,
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
        })
    }

    /// This node's peer id
    pub fn local_id(&self) -> PeerId {
        PeerId::from(self.endpoint.id())
    }

    /// Sockets the endpoint is actually bound to (ports resolved)
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.endpoint.bound_sockets().into_iter().collect()
    }

    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    /// Connect to the peer named in `address`.
    ///
    /// The address must carry a `/p2p/` peer id. It is resolved, remembered
    /// for later dials (gossip included), and dialed on the direct-stream
    /// protocol. A live connection to the same peer is reused.
    pub async fn connect(&self, address: &Address) -> NodeResult<PeerId> {
        let peer = address
            .peer_id()
            .ok_or_else(|| NodeError::Connect(format!("{} has no /p2p/ peer id", address)))?;

        if peer == self.local_id() {
            return Err(NodeError::Connect("refusing to dial ourselves".to_string()));
        }

        if self.cached_connection(&peer).is_some() {
            debug!(peer = %peer.short(), "Already connected");
            return Ok(peer);
        }

        let sockets = address.resolve().await?;
        let mut endpoint_addr = EndpointAddr::new(peer.to_endpoint_id()?);
        for socket in sockets {
            endpoint_addr = endpoint_addr.with_ip_addr(socket);
        }
        self.add_peer_addr(endpoint_addr.clone());

        self.dial(peer, endpoint_addr).await?;
        Ok(peer)
    }

    /// Open a new bidirectional direct stream to `peer`.
    ///
    /// Reuses the connection from [`Overlay::connect`] when it is still alive,
    /// otherwise dials using whatever address was learned for the peer.
    pub async fn open_stream(&self, peer: PeerId) -> NodeResult<DirectStream> {
        let conn = match self.cached_connection(&peer) {
            Some(conn) => conn,
            None => self.dial(peer, EndpointAddr::new(peer.to_endpoint_id()?)).await?,
        };

        match conn.open_bi().await {
            Ok((send, recv)) => Ok(DirectStream::new(peer, conn, send, recv)),
            Err(e) => {
                self.connections.lock().remove(&peer);
                Err(NodeError::Stream(format!(
                    "Failed to open stream to {}: {}",
                    peer.short(),
                    e
                )))
            }
        }
    }

    /// Make an address known to the static discovery provider
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        debug!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    async fn dial(&self, peer: PeerId, endpoint_addr: EndpointAddr) -> NodeResult<Connection> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.endpoint.connect(endpoint_addr, &self.alpn),
        )
        .await
        .map_err(|_| {
            NodeError::Connect(format!(
                "timed out after {:?} connecting to {}",
                self.connect_timeout,
                peer.short()
            ))
        })?
        .map_err(|e| NodeError::Connect(format!("Failed to connect to {}: {}", peer.short(), e)))?;

        info!(peer = %peer, "Connected to peer");
        self.connections.lock().insert(peer, conn.clone());
        Ok(conn)
    }

    fn cached_connection(&self, peer: &PeerId) -> Option<Connection> {
        let mut connections = self.connections.lock();
        match connections.get(peer) {
            Some(conn) if conn.close_reason().is_none() => Some(conn.clone()),
            Some(_) => {
                connections.remove(peer);
                None
            }
            None => None,
        }
    }

    /// Stop the router and close the endpoint.
    pub async fn shutdown(&self) {
        info!("Shutting down overlay");

        self.connections.lock().clear();

        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }

        self.endpoint.close().await;
        info!("Overlay shutdown complete");
    }
}
