//! Error types for Helios

use thiserror::Error;

/// How a failure is treated by the node.
///
/// Startup faults abort the process. Everything else is contained by the
/// loop that hit it and surfaced as a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Key generation, host creation, topic join, invalid configuration
    Startup,
    /// Bootstrap or reactive connect, stream open
    Connectivity,
    /// Malformed gossip payload or unparsable address
    Protocol,
    /// Read/write/flush failure on an active stream
    StreamIo,
}

impl Fault {
    /// Only startup faults escalate to process termination.
    pub fn is_fatal(self) -> bool {
        matches!(self, Fault::Startup)
    }
}

/// Main error type for Helios operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// The randomness source could not produce key material
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// String does not follow the `/proto/value/...` address syntax
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    /// Startup configuration is unusable
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The transport endpoint could not be created
    #[error("Failed to bind endpoint: {0}")]
    Bind(String),

    /// Connecting to a peer failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// Joining the gossip topic failed
    #[error("Failed to join topic: {0}")]
    Join(String),

    /// Publish was attempted on a session that never joined a topic
    #[error("Gossip session has not joined a topic")]
    NotJoined,

    /// Publish or receive was attempted after close
    #[error("Gossip session is closed")]
    SessionClosed,

    /// The message could not be injected into the gossip layer
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The subscription ended while waiting for the next message
    #[error("Receive failed: {0}")]
    Receive(String),

    /// The run context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Opening or accepting a direct stream failed
    #[error("Stream error: {0}")]
    Stream(String),

    /// Writing or flushing an active stream failed
    #[error("Stream I/O error: {0}")]
    StreamIo(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Envelope signature did not verify against its sender
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Envelope protocol version not supported
    #[error("Envelope version {0} is not supported")]
    UnsupportedVersion(u8),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Classify this error into the node's fault taxonomy.
    pub fn fault(&self) -> Fault {
        match self {
            NodeError::KeyGeneration(_)
            | NodeError::Config(_)
            | NodeError::Bind(_)
            | NodeError::Join(_) => Fault::Startup,
            NodeError::Connect(_)
            | NodeError::Stream(_)
            | NodeError::Publish(_)
            | NodeError::Receive(_)
            | NodeError::Cancelled => Fault::Connectivity,
            NodeError::MalformedAddress(_)
            | NodeError::NotJoined
            | NodeError::SessionClosed
            | NodeError::Serialization(_)
            | NodeError::SignatureInvalid(_)
            | NodeError::UnsupportedVersion(_) => Fault::Protocol,
            NodeError::StreamIo(_) | NodeError::Io(_) => Fault::StreamIo,
        }
    }
}

/// Result type alias using NodeError
pub type NodeResult<T> = Result<T, NodeError>;
