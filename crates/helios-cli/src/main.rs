//! Helios CLI
//!
//! Runs one overlay node in the foreground.
//!
//! ## Usage
//!
//! ```bash
//! # First node
//! helios --listen /ip4/127.0.0.1/udp/9001
//!
//! # Second node, bootstrapping off the first (copy its announce address)
//! helios --listen /ip4/127.0.0.1/udp/9002 \
//!        --peer /ip4/127.0.0.1/udp/9001/p2p/<peer-id>
//! ```
//!
//! Lines typed on stdin are sent to every open direct stream. Lines read
//! from streams are printed as `<peer>> <line>`.
//!
//! Long options also take a single dash (`-listen`, `-peer`, `-pid=/x/1`).

use std::ffi::OsString;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use helios_core::overlay::pump_lines;
use helios_core::{
    Address, Config, Node, NodeEvent, Payload, SelfReplyPolicy, DEFAULT_PROTOCOL_ID,
    DEFAULT_TOPIC,
};
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Helios - gossip announce and direct peer chat
#[derive(Parser, Debug)]
#[command(name = "helios")]
#[command(version)]
#[command(about = "Helios - gossip announce and direct peer chat")]
#[command(
    long_about = "Joins a gossip topic, announces its own address, and opens a direct stream to every peer that announces. Lines typed on stdin go to every open stream."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Bootstrap peer address (repeatable), e.g. /ip4/1.2.3.4/udp/9001/p2p/<id>
    #[arg(long = "peer", value_name = "MULTIADDR")]
    peers: Vec<Address>,

    /// Address to listen on (repeatable, at least one), e.g. /ip4/0.0.0.0/udp/9001
    #[arg(long = "listen", value_name = "MULTIADDR")]
    listen: Vec<Address>,

    /// Protocol id for direct streams
    #[arg(long, default_value = DEFAULT_PROTOCOL_ID)]
    pid: String,

    /// Gossip topic name
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Which announces count as our own: sender or announced
    #[arg(long, default_value = "sender", value_name = "POLICY")]
    self_reply: SelfReplyPolicy,

    /// Do not announce our address after joining the topic
    #[arg(long)]
    no_announce: bool,

    /// Seconds to wait for each outbound connection
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    connect_timeout: u64,

    /// Seconds to wait for the first gossip neighbor after bootstrap
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    ready_timeout: u64,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::default()
            .with_protocol_id(self.pid)
            .with_topic(self.topic)
            .with_self_reply_policy(self.self_reply)
            .with_announce_on_start(!self.no_announce)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_mesh_ready_timeout(Duration::from_secs(self.ready_timeout));

        for address in self.listen {
            config = config.with_listen_address(address);
        }
        for address in self.peers {
            config = config.with_bootstrap_peer(address);
        }
        config
    }
}

/// Rewrite single-dash long options (`-peer`, `-pid=/x`) to `--` form.
///
/// Short flags such as `-h` and `-vv` are left alone, as is everything after
/// a bare `--`.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let command = Cli::command();
    let mut longs: Vec<&str> = command
        .get_arguments()
        .filter_map(|arg| arg.get_long())
        .collect();
    longs.extend(["help", "version"]);

    let mut passthrough = false;
    args.into_iter()
        .enumerate()
        .map(|(index, arg)| {
            if index == 0 || passthrough {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                passthrough = true;
                return arg;
            }
            match text.strip_prefix('-') {
                Some(rest) if !rest.starts_with('-') => {
                    let name = rest.split_once('=').map_or(rest, |(name, _)| name);
                    if name.len() > 1 && longs.contains(&name) {
                        OsString::from(format!("-{}", text))
                    } else {
                        arg
                    }
                }
                _ => arg,
            }
        })
        .collect()
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = format!("warn,helios={level},helios_core={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::NeighborUp { peer } => println!("[gossip] neighbor up: {}", peer),
        NodeEvent::NeighborDown { peer } => println!("[gossip] neighbor down: {}", peer),
        NodeEvent::MessageReceived(message) => match &message.payload {
            Payload::Announce { address } => {
                println!("[gossip] {} announced {}", message.sender.short(), address)
            }
            Payload::Chat { .. } => {
                println!("[gossip] {}: {}", message.sender.short(), message.payload)
            }
        },
        NodeEvent::StreamOpened { peer, direction } => {
            println!("[stream] opened ({}) with {}", direction, peer)
        }
        NodeEvent::LineReceived { peer, line } => {
            println!("\x1b[32m{}\x1b[0m> {}", peer.short(), line)
        }
        NodeEvent::StreamClosed { peer, direction } => {
            println!("[stream] closed ({}) with {}", direction, peer)
        }
        NodeEvent::ReactionFailed { peer, error } => {
            println!("[stream] could not reach {}: {}", peer.short(), error)
        }
    }
}

/// Print events until `shutdown` resolves or the event channel closes.
///
/// `shutdown` is created once and polled across iterations, so a signal that
/// arrives while events are flowing is not lost.
async fn print_events<F>(events: &mut broadcast::Receiver<NodeEvent>, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event output lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    setup_logging(cli.verbose);

    let config = cli.into_config();
    let node = Node::start(config).await.context("failed to start node")?;

    println!("Helios node");
    println!("  Peer ID: {}", node.peer_id());
    println!("  Address: {}", node.announce_address());
    println!("  Topic:   {}", node.config().topic);
    let report = node.bootstrap_report();
    if !report.is_empty() {
        println!(
            "  Bootstrap: {} connected, {} failed",
            report.connected.len(),
            report.failed.len()
        );
    }
    println!();
    println!("Type a line and press Enter to send it to every open stream. Ctrl+C to stop.");
    println!();

    let input_cancel = CancellationToken::new();
    let input = tokio::spawn(pump_lines(
        BufReader::new(tokio::io::stdin()),
        node.input(),
        input_cancel.clone(),
    ));

    let mut events = node.subscribe_events();
    print_events(&mut events, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    })
    .await;

    input_cancel.cancel();
    input.abort();
    node.shutdown().await.context("shutdown failed")?;
    println!("Shutdown complete.");

    // The stdin reader may still be parked in a blocking read.
    std::process::exit(0);
}
