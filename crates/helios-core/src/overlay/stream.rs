//! Direct stream sessions
//!
//! A direct stream is one bidirectional QUIC stream between two peers,
//! negotiated with the configured protocol id as ALPN. Both ends run the same
//! session:
//!
//! - a **read loop** that splits incoming bytes into newline-terminated lines
//!   and surfaces every non-empty one as [`NodeEvent::LineReceived`]. Lines
//!   longer than [`MAX_LINE_LENGTH`] end the read loop.
//! - a **write loop** that forwards every line typed on the local input
//!   channel, newline-terminated and flushed immediately
//!
//! The loops stop independently: the read loop on EOF or read error, the
//! write loop on write error or when input ends. The session is over when
//! both have stopped or the node is cancelled.
//!
//! The peer that opened the stream writes one greeting line first:
//!
//! ```text
//! hello from: <peer-id>\n
//! ```

use futures::StreamExt;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::identity::PeerId;
use crate::overlay::events::{EventSender, NodeEvent, StreamDirection};

/// Prefix of the greeting line sent by the stream initiator
pub const GREETING_PREFIX: &str = "hello from: ";

/// Longest line accepted from a peer, in bytes
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Capacity of the shared input line channel
pub const INPUT_CHANNEL_CAPACITY: usize = 128;

/// Greeting text for `peer` (without the trailing newline)
pub fn greeting_line(peer: &PeerId) -> String {
    format!("{}{}", GREETING_PREFIX, peer)
}

/// Peer id named in a greeting line, if `line` is one
pub fn parse_greeting(line: &str) -> Option<PeerId> {
    line.strip_prefix(GREETING_PREFIX)?.trim().parse().ok()
}

/// An open bidirectional stream to a peer.
///
/// Holds the connection handle so the connection outlives the session even
/// when nothing else references it.
pub struct DirectStream {
    peer: PeerId,
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl DirectStream {
    pub fn new(peer: PeerId, connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            peer,
            connection,
            send,
            recv,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Split into the read half, a buffered write half and the connection handle
    pub fn into_parts(self) -> (RecvStream, BufWriter<SendStream>, Connection) {
        (self.recv, BufWriter::new(self.send), self.connection)
    }
}

impl std::fmt::Debug for DirectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectStream").field("peer", &self.peer).finish()
    }
}

/// Everything a stream session needs from the node.
///
/// Cloned into the inbound protocol handler and into every reaction task.
#[derive(Clone)]
pub struct SessionContext {
    events: EventSender,
    input: broadcast::Sender<String>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SessionContext {
    pub fn new(
        events: EventSender,
        input: broadcast::Sender<String>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            events,
            input,
            cancel,
            tracker,
        }
    }

    /// Publish an event; having no subscribers is fine.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Channel feeding every session's write loop
    pub fn input(&self) -> &broadcast::Sender<String> {
        &self.input
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Run a session for `stream` on the node's task tracker.
    pub fn spawn_session(&self, stream: DirectStream, direction: StreamDirection) {
        let ctx = self.clone();
        self.tracker.spawn(async move {
            let peer = stream.peer();
            let (reader, writer, _connection) = stream.into_parts();
            run_session(&ctx, peer, direction, reader, writer).await;
        });
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

/// Write `line` followed by a newline and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');

    writer
        .write_all(&buf)
        .await
        .map_err(|e| NodeError::StreamIo(format!("Failed to write line: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| NodeError::StreamIo(format!("Failed to flush stream: {}", e)))
}

/// Read lines from `reader` until EOF, a read error, an over-long line, or
/// cancellation.
///
/// Empty lines are skipped.
pub async fn read_loop<R>(
    peer: PeerId,
    reader: R,
    events: &EventSender,
    cancel: CancellationToken,
) -> NodeResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next() => line,
        };

        match line {
            Some(Ok(line)) => {
                if line.is_empty() {
                    continue;
                }
                debug!(peer = %peer.short(), %line, "Read line from stream");
                let _ = events.send(NodeEvent::LineReceived { peer, line });
            }
            None => {
                debug!(peer = %peer.short(), "Stream reached end of input");
                return Ok(());
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                return Err(NodeError::StreamIo(format!(
                    "line from {} exceeds {} bytes",
                    peer.short(),
                    MAX_LINE_LENGTH
                )));
            }
            Some(Err(LinesCodecError::Io(e))) => {
                return Err(NodeError::StreamIo(format!("Failed to read from stream: {}", e)));
            }
        }
    }
}

/// Forward input lines to `writer` until a write fails, input ends, or
/// cancellation. The writer is shut down on the way out.
pub async fn write_loop<W>(
    peer: PeerId,
    mut writer: W,
    mut input: broadcast::Receiver<String>,
    cancel: CancellationToken,
) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            line = input.recv() => line,
        };

        match line {
            Ok(line) => {
                if let Err(e) = write_line(&mut writer, &line).await {
                    break Err(e);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(peer = %peer.short(), skipped, "Input lagged, lines dropped for this stream");
            }
            Err(RecvError::Closed) => {
                debug!(peer = %peer.short(), "Input closed");
                break Ok(());
            }
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!(peer = %peer.short(), error = %e, "Stream shutdown after write loop failed");
    }

    result
}

/// Run both loops for one stream until they have stopped.
pub async fn run_session<R, W>(
    ctx: &SessionContext,
    peer: PeerId,
    direction: StreamDirection,
    reader: R,
    writer: W,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancel = ctx.cancel.child_token();
    let input = ctx.input.subscribe();

    info!(peer = %peer, %direction, "Stream session started");
    ctx.emit(NodeEvent::StreamOpened { peer, direction });

    let (read, write) = tokio::join!(
        read_loop(peer, reader, &ctx.events, cancel.clone()),
        write_loop(peer, writer, input, cancel.clone()),
    );

    if let Err(e) = read {
        warn!(peer = %peer.short(), error = %e, "Read loop ended with error");
    }
    if let Err(e) = write {
        warn!(peer = %peer.short(), error = %e, "Write loop ended with error");
    }

    info!(peer = %peer, %direction, "Stream session closed");
    ctx.emit(NodeEvent::StreamClosed { peer, direction });
}

/// Copy lines from `reader` (usually stdin) onto the input channel until EOF
/// or cancellation.
///
/// Lines typed while no stream is open are dropped.
pub async fn pump_lines<R>(reader: R, input: broadcast::Sender<String>, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if input.send(line).is_err() {
                    info!("No open stream, line not sent");
                }
            }
            Ok(None) => {
                debug!("Input reached end of file");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read input");
                break;
            }
        }
    }
}
