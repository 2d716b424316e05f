//! Ephemeral Ed25519 node identity
//!
//! A fresh key is drawn from the OS randomness source at process start and
//! never written to disk.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{NodeError, NodeResult};
use crate::identity::PeerId;

/// Length of an Ed25519 signature in bytes
pub const SIGNATURE_LEN: usize = 64;

/// A node's key pair and the peer id derived from it.
pub struct NodeIdentity {
    signing: SigningKey,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate a new random identity.
    ///
    /// Fails with `KeyGeneration` when the OS randomness source is unavailable.
    pub fn generate() -> NodeResult<Self> {
        // Use getrandom directly to avoid rand version conflicts with iroh
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| NodeError::KeyGeneration(format!("randomness source unavailable: {}", e)))?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic identity from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let peer_id = PeerId::from_public_key(&signing.verifying_key());
        Self { signing, peer_id }
    }

    /// This node's peer id
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// This node's public key
    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The same key in the form the iroh endpoint expects
    pub fn secret_key(&self) -> iroh::SecretKey {
        iroh::SecretKey::from_bytes(&self.signing.to_bytes())
    }

    /// Sign `data` with this node's key
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(data).to_bytes()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .field("signing", &"<redacted>")
            .finish()
    }
}

/// Verify that `signature` over `data` was produced by `signer`.
pub fn verify(signer: &PeerId, data: &[u8], signature: &[u8]) -> NodeResult<()> {
    let key = VerifyingKey::from_bytes(signer.as_bytes())
        .map_err(|e| NodeError::SignatureInvalid(format!("bad signer key: {}", e)))?;

    let signature = Signature::from_slice(signature)
        .map_err(|e| NodeError::SignatureInvalid(format!("bad signature encoding: {}", e)))?;

    key.verify(data, &signature)
        .map_err(|_| NodeError::SignatureInvalid(format!("signature does not match {}", signer)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_yields_unrelated_identities() {
        let a = NodeIdentity::generate().unwrap();
        let b = NodeIdentity::generate().unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = NodeIdentity::from_seed(&[7u8; 32]);
        let b = NodeIdentity::from_seed(&[7u8; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = NodeIdentity::generate().unwrap();
        let signature = identity.sign(b"hello");

        assert!(verify(&identity.peer_id(), b"hello", &signature).is_ok());
        assert!(verify(&identity.peer_id(), b"goodbye", &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_other_signer() {
        let alice = NodeIdentity::generate().unwrap();
        let bob = NodeIdentity::generate().unwrap();
        let signature = alice.sign(b"from alice");

        let err = verify(&bob.peer_id(), b"from alice", &signature).unwrap_err();
        assert!(matches!(err, NodeError::SignatureInvalid(_)));
    }

    #[test]
    fn test_verify_rejects_truncated_signature() {
        let identity = NodeIdentity::generate().unwrap();
        let signature = identity.sign(b"data");
        assert!(verify(&identity.peer_id(), b"data", &signature[..10]).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let identity = NodeIdentity::generate().unwrap();
        let debug = format!("{:?}", identity);
        assert!(debug.contains("<redacted>"));
    }
}
