//! Inbound direct-stream handler
//!
//! Registered with the router under the configured protocol id. Every
//! connection negotiated with that ALPN is kept open for as long as the peer
//! keeps it, and each bidirectional stream the peer opens on it becomes a
//! session on the node's task tracker.

use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tracing::{debug, info};

use crate::identity::PeerId;
use crate::overlay::events::StreamDirection;
use crate::overlay::stream::{DirectStream, SessionContext};

/// Accepts direct streams for one protocol id
#[derive(Clone)]
pub struct StreamAcceptor {
    protocol_id: String,
    ctx: SessionContext,
}

impl std::fmt::Debug for StreamAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAcceptor")
            .field("protocol_id", &self.protocol_id)
            .finish_non_exhaustive()
    }
}

impl StreamAcceptor {
    pub fn new(protocol_id: impl Into<String>, ctx: SessionContext) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            ctx,
        }
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    async fn serve_connection(ctx: SessionContext, conn: Connection) {
        let peer = PeerId::from(conn.remote_id());
        let cancel = ctx.cancel_token().clone();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = conn.accept_bi() => accepted,
            };

            match accepted {
                Ok((send, recv)) => {
                    info!(peer = %peer, "Got a new stream");
                    let stream = DirectStream::new(peer, conn.clone(), send, recv);
                    ctx.spawn_session(stream, StreamDirection::Inbound);
                }
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "Connection no longer accepting streams");
                    break;
                }
            }
        }
    }
}

impl ProtocolHandler for StreamAcceptor {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let ctx = self.ctx.clone();
        let protocol_id = self.protocol_id.clone();

        async move {
            debug!(peer = %conn.remote_id(), %protocol_id, "Router accepting direct-stream connection");
            Self::serve_connection(ctx, conn).await;
            Ok(())
        }
    }
}
