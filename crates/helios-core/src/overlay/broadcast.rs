//! Broadcast loop
//!
//! Owns the receiving side of the gossip session. Every message is logged and
//! surfaced as a [`NodeEvent`]; announces from other peers trigger a
//! connect-back: dial the announced address, open a direct stream, write the
//! greeting, then run a normal stream session on it.
//!
//! Reactions run on the node's task tracker so a slow or unreachable peer
//! never stalls the loop. A peer is greeted at most once while a reaction to
//! it is in flight or its session is open.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::config::SelfReplyPolicy;
use crate::error::{NodeError, NodeResult};
use crate::identity::PeerId;
use crate::overlay::bootstrap::connect_to_peer;
use crate::overlay::events::{NodeEvent, StreamDirection};
use crate::overlay::gossip::{GossipSession, TopicEvent};
use crate::overlay::protocol::{GossipMessage, Payload};
use crate::overlay::stream::{greeting_line, run_session, write_line, SessionContext};
use crate::overlay::transport::Overlay;

/// Why a message did not trigger a connect-back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Published by this node
    OwnMessage,
    /// Not an announce
    NotAnnounce,
    /// Announce text is not a valid address
    MalformedAddress(String),
    /// Announce address has no `/p2p/` suffix
    MissingPeerId,
    /// Announce names this node
    OwnAddress,
}

/// What to do about one gossip message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    /// Dial this address and greet the peer
    ConnectBack(Address),
    Ignore(IgnoreReason),
}

/// Decide how to react to `message` received by `local`.
pub fn plan_reaction(message: &GossipMessage, local: PeerId, policy: SelfReplyPolicy) -> Reaction {
    if message.sender == local {
        return Reaction::Ignore(IgnoreReason::OwnMessage);
    }

    let Payload::Announce { address } = &message.payload else {
        return Reaction::Ignore(IgnoreReason::NotAnnounce);
    };

    let address = match Address::parse(address) {
        Ok(address) => address,
        Err(e) => return Reaction::Ignore(IgnoreReason::MalformedAddress(e.to_string())),
    };

    match address.peer_id() {
        None => Reaction::Ignore(IgnoreReason::MissingPeerId),
        Some(peer) if peer == local && policy == SelfReplyPolicy::Announced => {
            Reaction::Ignore(IgnoreReason::OwnAddress)
        }
        Some(_) => Reaction::ConnectBack(address),
    }
}

/// Receives gossip and reacts to announces
pub struct BroadcastLoop {
    session: GossipSession,
    overlay: Arc<Overlay>,
    local: PeerId,
    policy: SelfReplyPolicy,
    ctx: SessionContext,
    greeted: Arc<Mutex<HashSet<PeerId>>>,
}

impl BroadcastLoop {
    pub fn new(
        session: GossipSession,
        overlay: Arc<Overlay>,
        policy: SelfReplyPolicy,
        ctx: SessionContext,
    ) -> Self {
        let local = overlay.local_id();
        Self {
            session,
            overlay,
            local,
            policy,
            ctx,
            greeted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Process topic events until the session is cancelled or the
    /// subscription ends, then close the session.
    pub async fn run(mut self) {
        info!(node = %self.local.short(), "Broadcast loop started");

        loop {
            match self.session.next_event().await {
                Ok(TopicEvent::Message(message)) => self.handle_message(message),
                Ok(TopicEvent::NeighborUp(peer)) => {
                    self.ctx.emit(NodeEvent::NeighborUp { peer });
                }
                Ok(TopicEvent::NeighborDown(peer)) => {
                    self.ctx.emit(NodeEvent::NeighborDown { peer });
                }
                Err(NodeError::Cancelled) => {
                    debug!("Broadcast loop cancelled");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Gossip subscription ended");
                    break;
                }
            }
        }

        self.session.close();
        info!(node = %self.local.short(), "Broadcast loop stopped");
    }

    fn handle_message(&self, message: GossipMessage) {
        info!(
            node = %self.local.short(),
            from = %message.sender,
            payload = %message.payload,
            "Received gossip message"
        );

        let reaction = plan_reaction(&message, self.local, self.policy);
        self.ctx.emit(NodeEvent::MessageReceived(message));

        match reaction {
            Reaction::ConnectBack(address) => self.spawn_reaction(address),
            Reaction::Ignore(IgnoreReason::MalformedAddress(e)) => {
                warn!(error = %e, "Ignoring announce with malformed address");
            }
            Reaction::Ignore(reason) => {
                debug!(?reason, "Not reacting to message");
            }
        }
    }

    fn spawn_reaction(&self, address: Address) {
        let Some(peer) = address.peer_id() else {
            return;
        };

        if !self.greeted.lock().insert(peer) {
            debug!(peer = %peer.short(), "Already greeting this peer");
            return;
        }

        let overlay = self.overlay.clone();
        let ctx = self.ctx.clone();
        let greeted = self.greeted.clone();
        let local = self.local;

        self.ctx.tracker().spawn(async move {
            let cancel = ctx.cancel_token().clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                result = react(&overlay, &ctx, local, &address) => result,
            };

            greeted.lock().remove(&peer);

            if let Err(e) = result {
                warn!(peer = %peer, %address, error = %e, "Failed to react to announce");
                ctx.emit(NodeEvent::ReactionFailed {
                    peer,
                    error: e.to_string(),
                });
            }
        });
    }
}

/// Connect back to an announced peer, greet it and run the session.
async fn react(
    overlay: &Overlay,
    ctx: &SessionContext,
    local: PeerId,
    address: &Address,
) -> NodeResult<()> {
    let peer = connect_to_peer(overlay, address).await?;
    let stream = overlay.open_stream(peer).await?;
    let (reader, mut writer, _connection) = stream.into_parts();

    write_line(&mut writer, &greeting_line(&local)).await?;
    info!(peer = %peer, "Greeted peer");

    run_session(ctx, peer, StreamDirection::Outbound, reader, writer).await;
    Ok(())
}
