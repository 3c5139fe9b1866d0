//! Vouch cryptographic layer: identities, contacts and key pinning.
//!
//! This crate provides:
//! - The local signing identity (ECDSA P-256 via ring)
//! - Public key export/import in JWK form and SHA-256 fingerprints
//! - Contacts and the out-of-band contact-exchange payload
//! - Key-value stores for pinned keys (in-memory and JSON file)
//! - The trust-on-first-use trust store

pub mod contact;
pub mod error;
pub mod identity;
pub mod stores;
pub mod trust;

// Re-export key types for convenience
pub use contact::{Contact, ContactBook, ContactCard, ContactChange};
pub use error::{CryptoError, StoreError, TrustError};
pub use identity::{random_nonce, verify_signature, Fingerprint, Identity, PublicKey, NONCE_LEN};
pub use stores::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use trust::{PinOutcome, SecurityClass, TrustStore};
