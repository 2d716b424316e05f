//! Gossip session on a single named topic
//!
//! A session moves through three states:
//!
//! ```text
//! Idle --join--> Joined --close--> Closed
//!   \______________close_______________/
//! ```
//!
//! Publishing goes through a cloneable [`TopicPublisher`] so the announce path
//! does not contend with the task that owns the receiving side.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::Gossip;
use iroh_gossip::proto::TopicId;
use n0_future::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::identity::{NodeIdentity, PeerId};
use crate::overlay::envelope::Envelope;
use crate::overlay::protocol::{GossipMessage, Payload};

/// Derive the gossip topic id for a topic name
///
/// BLAKE3("helios-topic" || name)
pub fn topic_id(name: &str) -> TopicId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"helios-topic");
    hasher.update(name.as_bytes());
    TopicId::from_bytes(*hasher.finalize().as_bytes())
}

/// Event from the joined topic
#[derive(Debug, Clone)]
pub enum TopicEvent {
    /// A verified message (ours included)
    Message(GossipMessage),
    NeighborUp(PeerId),
    NeighborDown(PeerId),
}

/// Cloneable publishing handle for a joined topic
#[derive(Clone)]
pub struct TopicPublisher {
    sender: Arc<Mutex<GossipSender>>,
    topic: String,
    identity: Arc<NodeIdentity>,
    seq: Arc<AtomicU64>,
    closed: CancellationToken,
}

impl TopicPublisher {
    /// Sign `payload` and hand it to the gossip layer.
    ///
    /// Success means the message was accepted locally; delivery to any
    /// particular peer is not guaranteed.
    pub async fn publish(&self, payload: Payload) -> NodeResult<()> {
        if self.closed.is_cancelled() {
            return Err(NodeError::SessionClosed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let bytes = Envelope::seal(&self.identity, &self.topic, seq, payload)?.to_bytes()?;
        debug!(topic = %self.topic, seq, len = bytes.len(), "Publishing message");

        self.sender
            .lock()
            .await
            .broadcast(Bytes::from(bytes))
            .await
            .map_err(|e| NodeError::Publish(format!("Failed to broadcast: {}", e)))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl std::fmt::Debug for TopicPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPublisher")
            .field("topic", &self.topic)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

enum SessionState {
    Idle,
    Joined {
        publisher: TopicPublisher,
        receiver: GossipReceiver,
    },
    Closed,
}

/// A node's membership in one gossip topic
pub struct GossipSession {
    gossip: Gossip,
    identity: Arc<NodeIdentity>,
    cancel: CancellationToken,
    state: SessionState,
    neighbors: HashSet<PeerId>,
    /// Events read while waiting for readiness, handed out first
    pending: VecDeque<TopicEvent>,
}

impl GossipSession {
    /// New idle session. `cancel` ends receiving and marks publishers closed.
    pub fn new(gossip: Gossip, identity: Arc<NodeIdentity>, cancel: CancellationToken) -> Self {
        Self {
            gossip,
            identity,
            cancel,
            state: SessionState::Idle,
            neighbors: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    /// Subscribe to `topic`, using `bootstrap` as initial gossip neighbors.
    ///
    /// Returns once the subscription exists; the mesh may still be forming.
    pub async fn join(&mut self, topic: &str, bootstrap: Vec<PeerId>) -> NodeResult<()> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Joined { ref publisher, .. } => {
                return Err(NodeError::Join(format!(
                    "already joined topic '{}'",
                    publisher.topic()
                )))
            }
            SessionState::Closed => return Err(NodeError::SessionClosed),
        }

        let bootstrap_ids = bootstrap
            .iter()
            .map(PeerId::to_endpoint_id)
            .collect::<NodeResult<Vec<_>>>()?;

        let id = topic_id(topic);
        info!(topic, topic_id = ?id, peer_count = bootstrap_ids.len(), "Joining topic");

        let (sender, receiver) = self
            .gossip
            .subscribe(id, bootstrap_ids)
            .await
            .map_err(|e| NodeError::Join(format!("Failed to subscribe: {}", e)))?
            .split();

        let publisher = TopicPublisher {
            sender: Arc::new(Mutex::new(sender)),
            topic: topic.to_string(),
            identity: self.identity.clone(),
            seq: Arc::new(AtomicU64::new(0)),
            closed: self.cancel.clone(),
        };
        self.state = SessionState::Joined {
            publisher,
            receiver,
        };
        Ok(())
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, SessionState::Joined { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    /// Name of the joined topic
    pub fn topic(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined { publisher, .. } => Some(publisher.topic()),
            _ => None,
        }
    }

    /// Gossip neighbors currently known to be up
    pub fn neighbors(&self) -> &HashSet<PeerId> {
        &self.neighbors
    }

    /// Publishing handle for the joined topic
    pub fn publisher(&self) -> NodeResult<TopicPublisher> {
        match &self.state {
            SessionState::Joined { publisher, .. } => Ok(publisher.clone()),
            SessionState::Idle => Err(NodeError::NotJoined),
            SessionState::Closed => Err(NodeError::SessionClosed),
        }
    }

    /// Publish on the joined topic.
    ///
    /// # Errors
    ///
    /// `NotJoined` before [`GossipSession::join`], `SessionClosed` after
    /// [`GossipSession::close`].
    pub async fn publish(&self, payload: Payload) -> NodeResult<()> {
        self.publisher()?.publish(payload).await
    }

    /// Next event from the topic.
    ///
    /// Messages that fail to decode or verify are logged and skipped.
    pub async fn next_event(&mut self) -> NodeResult<TopicEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        self.poll_event().await
    }

    /// Next message from the topic, skipping neighbor events.
    pub async fn receive_next(&mut self) -> NodeResult<GossipMessage> {
        loop {
            if let TopicEvent::Message(message) = self.next_event().await? {
                return Ok(message);
            }
        }
    }

    /// Wait until at least one gossip neighbor is up.
    ///
    /// Returns `false` on timeout or if the subscription ends. Events read
    /// while waiting are kept for [`GossipSession::next_event`].
    pub async fn wait_ready(&mut self, timeout: Duration) -> bool {
        if !self.neighbors.is_empty() {
            return true;
        }

        let waited = tokio::time::timeout(timeout, async {
            loop {
                match self.poll_event().await {
                    Ok(event) => {
                        let ready = matches!(event, TopicEvent::NeighborUp(_));
                        self.pending.push_back(event);
                        if ready {
                            return true;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Stopped waiting for neighbors");
                        return false;
                    }
                }
            }
        })
        .await;

        match waited {
            Ok(ready) => ready,
            Err(_) => {
                debug!(?timeout, "Timeout waiting for a gossip neighbor");
                false
            }
        }
    }

    async fn poll_event(&mut self) -> NodeResult<TopicEvent> {
        let (topic, receiver) = match &mut self.state {
            SessionState::Joined {
                publisher,
                receiver,
            } => (publisher.topic().to_string(), receiver),
            SessionState::Idle => return Err(NodeError::NotJoined),
            SessionState::Closed => return Err(NodeError::SessionClosed),
        };

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(NodeError::Cancelled),
                event = receiver.try_next() => event,
            };

            match event {
                Ok(Some(Event::Received(msg))) => {
                    match decode_message(&msg.content, &topic) {
                        Ok(message) => {
                            debug!(
                                topic = %topic,
                                sender = %message.sender.short(),
                                via = %msg.delivered_from,
                                "Received message"
                            );
                            return Ok(TopicEvent::Message(message));
                        }
                        Err(e) => {
                            warn!(topic = %topic, via = %msg.delivered_from, error = %e, "Dropping undecodable gossip message");
                        }
                    }
                }
                Ok(Some(Event::NeighborUp(peer))) => {
                    let peer = PeerId::from(peer);
                    info!(topic = %topic, peer = %peer, "Neighbor joined");
                    self.neighbors.insert(peer);
                    return Ok(TopicEvent::NeighborUp(peer));
                }
                Ok(Some(Event::NeighborDown(peer))) => {
                    let peer = PeerId::from(peer);
                    info!(topic = %topic, peer = %peer, "Neighbor left");
                    self.neighbors.remove(&peer);
                    return Ok(TopicEvent::NeighborDown(peer));
                }
                Ok(Some(Event::Lagged)) => {
                    warn!(topic = %topic, "Lagged behind on topic");
                }
                Ok(None) => {
                    return Err(NodeError::Receive("topic subscription closed".to_string()));
                }
                Err(e) => {
                    return Err(NodeError::Receive(format!("Error receiving from topic: {}", e)));
                }
            }
        }
    }

    /// Leave the topic. Idempotent.
    pub fn close(&mut self) {
        if let SessionState::Joined { publisher, .. } = &self.state {
            info!(topic = %publisher.topic(), "Leaving topic");
        }
        self.state = SessionState::Closed;
        self.pending.clear();
        self.neighbors.clear();
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for GossipSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            SessionState::Idle => "idle",
            SessionState::Joined { .. } => "joined",
            SessionState::Closed => "closed",
        };
        f.debug_struct("GossipSession")
            .field("state", &state)
            .field("topic", &self.topic())
            .field("neighbors", &self.neighbors.len())
            .finish()
    }
}

fn decode_message(bytes: &[u8], topic: &str) -> NodeResult<GossipMessage> {
    let message = Envelope::from_bytes(bytes)?.open()?;
    if message.topic != topic {
        return Err(NodeError::Serialization(format!(
            "message for topic '{}' arrived on '{}'",
            message.topic, topic
        )));
    }
    Ok(message)
}
