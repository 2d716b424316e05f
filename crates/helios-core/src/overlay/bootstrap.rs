//! Bootstrap connector
//!
//! Dials every configured peer once at startup. Peers are independent: one
//! failing (bad address, unreachable, timeout) is logged and the rest are
//! still tried. The peers that answered become the gossip bootstrap set.

use futures::future::join_all;
use tracing::{info, warn};

use crate::address::{Address, AddressList};
use crate::error::NodeResult;
use crate::identity::PeerId;
use crate::overlay::transport::Overlay;

/// Outcome of dialing the bootstrap list
#[derive(Debug, Default, Clone)]
pub struct BootstrapReport {
    /// Peers connected, in configuration order, without duplicates
    pub connected: Vec<PeerId>,
    /// Addresses that failed and why
    pub failed: Vec<(Address, String)>,
}

impl BootstrapReport {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.failed.is_empty()
    }
}

/// Connect to the peer named by `address`.
pub async fn connect_to_peer(overlay: &Overlay, address: &Address) -> NodeResult<PeerId> {
    info!(%address, "Connecting to peer");
    overlay.connect(address).await
}

/// Dial every peer in `peers` concurrently and collect the outcome.
///
/// Never fails as a whole.
pub async fn connect_all(overlay: &Overlay, peers: &AddressList) -> BootstrapReport {
    let attempts = peers
        .iter()
        .map(|address| async move { (address, connect_to_peer(overlay, address).await) });

    let mut report = BootstrapReport::default();
    for (address, result) in join_all(attempts).await {
        match result {
            Ok(peer) => {
                if !report.connected.contains(&peer) {
                    report.connected.push(peer);
                }
            }
            Err(e) => {
                warn!(%address, error = %e, "Failed to connect to bootstrap peer");
                report.failed.push((address.clone(), e.to_string()));
            }
        }
    }

    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "Bootstrap finished"
    );
    report
}
