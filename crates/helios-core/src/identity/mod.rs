//! Node identity
//!
//! Every process owns exactly one [`NodeIdentity`]: an Ed25519 key pair and
//! the [`PeerId`] derived from its public key. The identity is ephemeral;
//! restarting a node yields a new peer id.
//!
//! ## Example
//!
//! ```rust
//! use helios_core::identity::{verify, NodeIdentity};
//!
//! let identity = NodeIdentity::generate().expect("OS randomness available");
//! println!("peer id: {}", identity.peer_id());
//!
//! let signature = identity.sign(b"announce");
//! assert!(verify(&identity.peer_id(), b"announce", &signature).is_ok());
//! ```

mod keypair;
mod peer_id;

pub use keypair::{verify, NodeIdentity, SIGNATURE_LEN};
pub use peer_id::PeerId;
