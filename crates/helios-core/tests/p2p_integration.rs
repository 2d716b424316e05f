//! P2P Integration Tests
//!
//! Real nodes on 127.0.0.1 talking over iroh.
//!
//! - Node startup and announce address
//! - Gossip session state rules against a real gossip instance
//! - Messages published by one session arrive through `receive_next` on another
//! - Bootstrap keeps going past unreachable peers
//! - Announce triggers connect-back and `hello from: <id>`
//! - Lines flow both ways over the direct stream
//! - Startup announce reaches an existing node
//! - Chat payloads reach neighbors without opening streams
//! - The broadcast loop survives malformed announces and failed reactions

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helios_core::identity::NodeIdentity;
use helios_core::node::announce_address;
use helios_core::overlay::{
    greeting_line, GossipSession, Overlay, SessionContext, StreamAcceptor, EVENT_CHANNEL_CAPACITY,
    INPUT_CHANNEL_CAPACITY,
};
use helios_core::{
    Address, Config, Node, NodeError, NodeEvent, Payload, PeerId, StreamDirection,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ============================================================================
// Test Utilities
// ============================================================================

const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("helios_core=debug,iroh=warn,iroh_gossip=warn")
        .with_test_writer()
        .try_init()
        .ok();
}

fn localhost() -> Address {
    Address::parse("/ip4/127.0.0.1/udp/0").unwrap()
}

/// Topic name unique to one test run
fn unique_topic() -> String {
    format!("helios-test-{}", NodeIdentity::generate().unwrap().peer_id().short())
}

fn test_config(topic: &str) -> Config {
    Config::default()
        .with_listen_address(localhost())
        .with_topic(topic)
        .with_announce_on_start(false)
        .with_connect_timeout(Duration::from_secs(5))
        .with_mesh_ready_timeout(Duration::from_secs(10))
}

/// Bound overlay on localhost with a throwaway session context
async fn test_overlay(identity: &NodeIdentity) -> Result<Overlay> {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (input, _) = broadcast::channel(INPUT_CHANNEL_CAPACITY);
    let ctx = SessionContext::new(events, input, CancellationToken::new(), TaskTracker::new());
    let acceptor = StreamAcceptor::new("/test/0.0.1", ctx);

    let mut listen = helios_core::AddressList::new();
    listen.push(localhost());
    Ok(Overlay::listen(identity, &listen, acceptor, Duration::from_secs(5)).await?)
}

/// Wait for the first event matching `pred`, panicking after `EVENT_TIMEOUT`
async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<NodeEvent>,
    what: &str,
    mut pred: F,
) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => panic!("event channel closed waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}

fn is_line_from(event: &NodeEvent, from: PeerId, expected: &str) -> bool {
    matches!(event, NodeEvent::LineReceived { peer, line } if *peer == from && line == expected)
}

/// Two nodes on one topic: B bootstrapped off A, A announced, B greeted A.
struct GreetedPair {
    a: Node,
    b: Node,
    a_events: broadcast::Receiver<NodeEvent>,
    b_events: broadcast::Receiver<NodeEvent>,
}

async fn greeted_pair() -> GreetedPair {
    let topic = unique_topic();

    let a = Node::start(test_config(&topic)).await.unwrap();
    let mut a_events = a.subscribe_events();

    let b = Node::start(test_config(&topic).with_bootstrap_peer(a.announce_address().clone()))
        .await
        .unwrap();
    let b_events = b.subscribe_events();
    assert_eq!(b.bootstrap_report().connected, vec![a.peer_id()]);

    let b_id = b.peer_id();
    wait_for_event(&mut a_events, "B as gossip neighbor", |event| {
        matches!(event, NodeEvent::NeighborUp { peer } if *peer == b_id)
    })
    .await;

    a.announce().await.unwrap();

    let greeting = greeting_line(&b_id);
    wait_for_event(&mut a_events, "greeting from B", |event| {
        is_line_from(event, b_id, &greeting)
    })
    .await;

    GreetedPair {
        a,
        b,
        a_events,
        b_events,
    }
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_node_reports_announce_address() {
    init_tracing();

    let node = Node::start(test_config(&unique_topic())).await.unwrap();
    let address = node.announce_address();

    assert_ne!(address.port(), 0, "bound port should replace port 0");
    assert_eq!(address.peer_id(), Some(node.peer_id()));
    assert!(address.to_string().starts_with("/ip4/127.0.0.1/udp/"));
    assert!(node.bootstrap_report().is_empty());
    assert_eq!(node.open_streams(), 0);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_node_rejects_config_without_listen() {
    let err = Node::start(Config::default()).await.unwrap_err();
    assert!(matches!(err, NodeError::Config(_)));
    assert!(err.fault().is_fatal());
}

#[tokio::test]
async fn test_identities_differ_between_nodes() {
    let topic = unique_topic();
    let a = Node::start(test_config(&topic)).await.unwrap();
    let b = Node::start(test_config(&topic)).await.unwrap();

    assert_ne!(a.peer_id(), b.peer_id());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ============================================================================
// Gossip Session Rules
// ============================================================================

#[tokio::test]
async fn test_gossip_session_state_rules() {
    init_tracing();

    let identity = Arc::new(NodeIdentity::generate().unwrap());
    let overlay = test_overlay(&identity).await.unwrap();

    let mut session =
        GossipSession::new(overlay.gossip().clone(), identity.clone(), CancellationToken::new());

    // Publish before join
    let err = session.publish(Payload::chat("too early")).await.unwrap_err();
    assert!(matches!(err, NodeError::NotJoined));
    assert!(matches!(session.publisher(), Err(NodeError::NotJoined)));

    // Joining with no bootstrap peers succeeds; publishing with no neighbors
    // is accepted locally
    session.join("solo", Vec::new()).await.unwrap();
    assert!(session.is_joined());
    assert_eq!(session.topic(), Some("solo"));
    session.publish(Payload::chat("anyone?")).await.unwrap();

    // Second join is refused
    assert!(matches!(
        session.join("other", Vec::new()).await,
        Err(NodeError::Join(_))
    ));

    // A publisher taken before close reports the session as closed
    let publisher = session.publisher().unwrap();
    session.close();
    session.close();
    assert!(session.is_closed());
    assert!(matches!(
        publisher.publish(Payload::chat("late")).await,
        Err(NodeError::SessionClosed)
    ));
    assert!(matches!(
        session.publish(Payload::chat("late")).await,
        Err(NodeError::SessionClosed)
    ));
    assert!(matches!(session.next_event().await, Err(NodeError::SessionClosed)));
    assert!(matches!(
        session.join("again", Vec::new()).await,
        Err(NodeError::SessionClosed)
    ));

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_receive_next_delivers_published_message() -> Result<()> {
    init_tracing();
    let topic = unique_topic();

    let identity_a = Arc::new(NodeIdentity::generate()?);
    let identity_b = Arc::new(NodeIdentity::generate()?);
    let overlay_a = test_overlay(&identity_a).await?;
    let overlay_b = test_overlay(&identity_b).await?;

    let address_a = announce_address(&localhost(), &overlay_a.bound_addresses(), overlay_a.local_id());
    let a_id = overlay_b.connect(&address_a).await?;
    assert_eq!(a_id, identity_a.peer_id());

    let mut session_a =
        GossipSession::new(overlay_a.gossip().clone(), identity_a.clone(), CancellationToken::new());
    let mut session_b =
        GossipSession::new(overlay_b.gossip().clone(), identity_b.clone(), CancellationToken::new());
    session_a.join(&topic, Vec::new()).await?;
    session_b.join(&topic, vec![a_id]).await?;

    assert!(session_b.wait_ready(EVENT_TIMEOUT).await, "B never saw a neighbor");
    assert!(session_a.wait_ready(EVENT_TIMEOUT).await, "A never saw a neighbor");
    assert!(session_b.neighbors().contains(&a_id));

    session_a.publish(Payload::chat("ping")).await?;

    let message = tokio::time::timeout(EVENT_TIMEOUT, session_b.receive_next()).await??;
    assert_eq!(message.payload, Payload::chat("ping"));
    assert_eq!(message.sender, a_id);
    assert_eq!(message.topic, topic);

    session_a.close();
    session_b.close();
    overlay_b.shutdown().await;
    overlay_a.shutdown().await;
    Ok(())
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn test_bootstrap_skips_unreachable_peers() {
    init_tracing();
    let topic = unique_topic();

    let a = Node::start(test_config(&topic)).await.unwrap();

    // Valid peer id, but nobody listens there
    let stranger = NodeIdentity::generate().unwrap().peer_id();
    let unreachable = Address::parse(&format!("/ip4/127.0.0.1/udp/9/p2p/{}", stranger)).unwrap();
    // No peer id to dial
    let anonymous = Address::parse("/ip4/127.0.0.1/udp/9").unwrap();

    let config = test_config(&topic)
        .with_connect_timeout(Duration::from_secs(2))
        .with_bootstrap_peer(unreachable.clone())
        .with_bootstrap_peer(anonymous.clone())
        .with_bootstrap_peer(a.announce_address().clone());
    let b = Node::start(config).await.unwrap();

    let report = b.bootstrap_report();
    assert_eq!(report.connected, vec![a.peer_id()]);
    assert_eq!(report.failed.len(), 2);
    let failed: Vec<&Address> = report.failed.iter().map(|(address, _)| address).collect();
    assert!(failed.contains(&&unreachable));
    assert!(failed.contains(&&anonymous));

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_bootstrap_entries_connect_once() {
    let topic = unique_topic();
    let a = Node::start(test_config(&topic)).await.unwrap();

    let config = test_config(&topic)
        .with_bootstrap_peer(a.announce_address().clone())
        .with_bootstrap_peer(a.announce_address().clone());
    let b = Node::start(config).await.unwrap();

    assert_eq!(b.bootstrap_report().connected, vec![a.peer_id()]);

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

// ============================================================================
// Announce / Hello Scenario
// ============================================================================

#[tokio::test]
async fn test_announce_triggers_hello() {
    init_tracing();

    let GreetedPair {
        a,
        b,
        mut b_events,
        ..
    } = greeted_pair().await;

    // B's side of the same stream is an outbound session to A
    let a_id = a.peer_id();
    wait_for_event(&mut b_events, "B outbound stream", |event| {
        matches!(
            event,
            NodeEvent::StreamOpened { peer, direction }
                if *peer == a_id && *direction == StreamDirection::Outbound
        )
    })
    .await;

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lines_flow_both_ways() {
    init_tracing();

    let GreetedPair {
        a,
        b,
        mut a_events,
        mut b_events,
    } = greeted_pair().await;

    assert!(a.send_line("ping") >= 1);
    wait_for_event(&mut b_events, "ping on B", |event| {
        is_line_from(event, a.peer_id(), "ping")
    })
    .await;

    assert!(b.send_line("pong") >= 1);
    wait_for_event(&mut a_events, "pong on A", |event| {
        is_line_from(event, b.peer_id(), "pong")
    })
    .await;

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeat_announce_does_not_open_second_stream() {
    init_tracing();

    let GreetedPair {
        a,
        b,
        mut a_events,
        ..
    } = greeted_pair().await;

    // B already has a session with A; a second announce is skipped
    a.announce().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let b_id = b.peer_id();
    let mut extra_streams = 0;
    while let Ok(event) = a_events.try_recv() {
        if matches!(event, NodeEvent::StreamOpened { peer, .. } if peer == b_id) {
            extra_streams += 1;
        }
    }
    assert_eq!(extra_streams, 0);

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_startup_announce_reaches_existing_node() {
    init_tracing();
    let topic = unique_topic();

    let a = Node::start(test_config(&topic)).await.unwrap();
    let mut a_events = a.subscribe_events();

    let b = Node::start(
        test_config(&topic)
            .with_announce_on_start(true)
            .with_bootstrap_peer(a.announce_address().clone()),
    )
    .await
    .unwrap();
    let b_id = b.peer_id();

    // A reacts to B's announce by dialing B
    wait_for_event(&mut a_events, "A outbound stream to B", |event| {
        matches!(
            event,
            NodeEvent::StreamOpened { peer, direction }
                if *peer == b_id && *direction == StreamDirection::Outbound
        )
    })
    .await;

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn test_chat_reaches_neighbor_without_stream() {
    init_tracing();
    let topic = unique_topic();

    let a = Node::start(test_config(&topic)).await.unwrap();
    let mut a_events = a.subscribe_events();
    let b = Node::start(test_config(&topic).with_bootstrap_peer(a.announce_address().clone()))
        .await
        .unwrap();
    let mut b_events = b.subscribe_events();

    let b_id = b.peer_id();
    wait_for_event(&mut a_events, "B as gossip neighbor", |event| {
        matches!(event, NodeEvent::NeighborUp { peer } if *peer == b_id)
    })
    .await;

    a.publish(Payload::chat("hello topic")).await.unwrap();
    // Same body twice must still arrive twice
    a.publish(Payload::chat("hello topic")).await.unwrap();

    let a_id = a.peer_id();
    for _ in 0..2 {
        let event = wait_for_event(&mut b_events, "chat on B", |event| {
            matches!(event, NodeEvent::MessageReceived(_))
        })
        .await;
        match event {
            NodeEvent::MessageReceived(message) => {
                assert_eq!(message.sender, a_id);
                assert_eq!(message.topic, topic);
                assert_eq!(message.payload, Payload::chat("hello topic"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(b.open_streams(), 0);

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

// ============================================================================
// Broadcast Loop Resilience
// ============================================================================

#[tokio::test]
async fn test_broadcast_loop_survives_bad_announces() -> Result<()> {
    init_tracing();
    let topic = unique_topic();

    let a = Node::start(test_config(&topic).with_connect_timeout(Duration::from_secs(2))).await?;
    let mut a_events = a.subscribe_events();
    let b = Node::start(test_config(&topic).with_bootstrap_peer(a.announce_address().clone())).await?;

    let b_id = b.peer_id();
    wait_for_event(&mut a_events, "B as gossip neighbor", |event| {
        matches!(event, NodeEvent::NeighborUp { peer } if *peer == b_id)
    })
    .await;

    let stranger = NodeIdentity::generate()?.peer_id();
    b.publish(Payload::Announce {
        address: "garbage".to_string(),
    })
    .await?;
    b.publish(Payload::Announce {
        address: format!("/ip4/127.0.0.1/udp/9/p2p/{}", stranger),
    })
    .await?;
    b.announce().await?;

    // The failed dial and the stream to B finish in either order
    let (mut failed, mut opened) = (false, false);
    wait_for_event(&mut a_events, "failed reaction and stream to B", |event| {
        match event {
            NodeEvent::ReactionFailed { peer, .. } if *peer == stranger => failed = true,
            NodeEvent::StreamOpened { peer, direction }
                if *peer == b_id && *direction == StreamDirection::Outbound =>
            {
                opened = true
            }
            _ => {}
        }
        failed && opened
    })
    .await;

    // The failed reaction released its mark, so the same announce is tried again
    b.publish(Payload::Announce {
        address: format!("/ip4/127.0.0.1/udp/9/p2p/{}", stranger),
    })
    .await?;
    wait_for_event(&mut a_events, "second failed reaction", |event| {
        matches!(event, NodeEvent::ReactionFailed { peer, .. } if *peer == stranger)
    })
    .await;

    b.shutdown().await?;
    a.shutdown().await?;
    Ok(())
}
