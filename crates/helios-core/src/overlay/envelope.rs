//! Signed gossip envelopes
//!
//! iroh-gossip reports the neighbor that *delivered* a message, not the node
//! that published it. The envelope carries the publisher's peer id and an
//! Ed25519 signature over every other field, so `sender` can be trusted for
//! the "never react to our own message" rule.
//!
//! ## Wire Format
//!
//! postcard encoding of:
//!
//! ```text
//! +----------+--------+-------+-----+---------+-----------+
//! | version  | sender | topic | seq | payload | signature |
//! | (1 byte) | (32)   | (str) | u64 | (enum)  | (64)      |
//! +----------+--------+-------+-----+---------+-----------+
//! ```
//!
//! `seq` increases per publisher so identical payloads published twice are
//! distinct messages to the gossip layer's duplicate suppression.

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::identity::{verify, NodeIdentity, PeerId};
use crate::overlay::protocol::{GossipMessage, Payload};

/// Current envelope protocol version
pub const ENVELOPE_VERSION: u8 = 1;

/// A signed gossip message as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub sender: PeerId,
    pub topic: String,
    pub seq: u64,
    pub payload: Payload,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    version: u8,
    sender: &'a PeerId,
    topic: &'a str,
    seq: u64,
    payload: &'a Payload,
}

impl Envelope {
    /// Build and sign an envelope for `payload`.
    pub fn seal(identity: &NodeIdentity, topic: &str, seq: u64, payload: Payload) -> NodeResult<Self> {
        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            sender: identity.peer_id(),
            topic: topic.to_string(),
            seq,
            payload,
            signature: Vec::new(),
        };
        let signed = envelope.signed_data()?;
        envelope.signature = identity.sign(&signed).to_vec();
        Ok(envelope)
    }

    /// Check version and signature and unwrap the message.
    ///
    /// # Errors
    ///
    /// - `NodeError::UnsupportedVersion` if the version is unknown
    /// - `NodeError::SignatureInvalid` if the signature does not match `sender`
    pub fn open(self) -> NodeResult<GossipMessage> {
        if self.version != ENVELOPE_VERSION {
            return Err(NodeError::UnsupportedVersion(self.version));
        }

        let signed = self.signed_data()?;
        verify(&self.sender, &signed, &self.signature)?;

        Ok(GossipMessage {
            sender: self.sender,
            topic: self.topic,
            payload: self.payload,
        })
    }

    fn signed_data(&self) -> NodeResult<Vec<u8>> {
        postcard::to_allocvec(&SignedFields {
            version: self.version,
            sender: &self.sender,
            topic: &self.topic,
            seq: self.seq,
            payload: &self.payload,
        })
        .map_err(|e| NodeError::Serialization(format!("Failed to encode signed fields: {}", e)))
    }

    /// Encode the envelope to bytes for transmission.
    pub fn to_bytes(&self) -> NodeResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| NodeError::Serialization(format!("Failed to encode envelope: {}", e)))
    }

    /// Decode an envelope from bytes.
    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| NodeError::Serialization(format!("Failed to decode envelope: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let identity = NodeIdentity::generate().unwrap();
        let envelope = Envelope::seal(&identity, "helios", 1, Payload::chat("ping")).unwrap();

        let bytes = envelope.to_bytes().unwrap();
        let message = Envelope::from_bytes(&bytes).unwrap().open().unwrap();

        assert_eq!(message.sender, identity.peer_id());
        assert_eq!(message.topic, "helios");
        assert_eq!(message.payload, Payload::chat("ping"));
    }

    #[test]
    fn test_forged_sender_rejected() {
        let alice = NodeIdentity::generate().unwrap();
        let mallory = NodeIdentity::generate().unwrap();

        let mut envelope = Envelope::seal(&mallory, "helios", 0, Payload::chat("hi")).unwrap();
        envelope.sender = alice.peer_id();

        let err = envelope.open().unwrap_err();
        assert!(matches!(err, NodeError::SignatureInvalid(_)));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let identity = NodeIdentity::generate().unwrap();
        let mut envelope = Envelope::seal(&identity, "helios", 0, Payload::chat("hi")).unwrap();
        envelope.payload = Payload::chat("bye");

        assert!(envelope.open().is_err());
    }

    #[test]
    fn test_tampered_seq_rejected() {
        let identity = NodeIdentity::generate().unwrap();
        let mut envelope = Envelope::seal(&identity, "helios", 0, Payload::chat("hi")).unwrap();
        envelope.seq = 5;

        assert!(envelope.open().is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let identity = NodeIdentity::generate().unwrap();
        let mut envelope = Envelope::seal(&identity, "helios", 0, Payload::chat("hi")).unwrap();
        envelope.version = 9;

        assert!(matches!(envelope.open(), Err(NodeError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_same_payload_different_seq_differs_on_wire() {
        let identity = NodeIdentity::generate().unwrap();
        let a = Envelope::seal(&identity, "t", 0, Payload::chat("ping")).unwrap();
        let b = Envelope::seal(&identity, "t", 1, Payload::chat("ping")).unwrap();
        assert_ne!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let err = Envelope::from_bytes(b"/ip4/127.0.0.1/tcp/9001").unwrap_err();
        assert!(matches!(err, NodeError::Serialization(_)));
    }
}
