//! Peer identifier derived from a node's Ed25519 public key
//!
//! Format: base58 of the 32 public key bytes, e.g.
//! `6MkZ3wV7...` (44 characters or fewer).
//!
//! The same bytes are the iroh endpoint id, so a `PeerId` converts to and
//! from the transport's addressing without any lookup.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Stable identifier of a node, content-derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Build a peer id from raw public key bytes.
    ///
    /// Fails if the bytes are not a valid Ed25519 point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, NodeError> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| NodeError::MalformedAddress(format!("invalid peer id key: {}", e)))?;
        Ok(Self(bytes))
    }

    /// Peer id of a verifying key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    /// Raw public key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to the transport's endpoint id
    pub fn to_endpoint_id(&self) -> Result<iroh::EndpointId, NodeError> {
        iroh::PublicKey::from_bytes(&self.0)
            .map_err(|e| NodeError::MalformedAddress(format!("invalid endpoint id: {}", e)))
    }

    /// Short form for log lines (first 8 characters)
    pub fn short(&self) -> String {
        self.to_string().chars().take(8).collect()
    }
}

impl From<iroh::EndpointId> for PeerId {
    fn from(id: iroh::EndpointId) -> Self {
        Self(*id.as_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NodeError::MalformedAddress("peer id cannot be empty".to_string()));
        }

        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|_| NodeError::MalformedAddress(format!("peer id '{}' is not base58", s)))?;

        let bytes: [u8; 32] = decoded.try_into().map_err(|v: Vec<u8>| {
            NodeError::MalformedAddress(format!("peer id must be 32 bytes (got {})", v.len()))
        })?;

        Self::from_bytes(bytes)
    }
}
