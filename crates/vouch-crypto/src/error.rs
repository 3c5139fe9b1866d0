use thiserror::Error;

/// Failures of the signing provider or of key import.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed")]
    KeyGeneration,

    #[error("key rejected: {0}")]
    KeyRejected(String),

    #[error("signing failed")]
    Signing,

    #[error("RNG failed")]
    Random,

    #[error("invalid public key: {0}")]
    InvalidKey(String),
}

/// The persistent key-value store could not be used.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key store unavailable: {0}")]
    Unavailable(String),

    #[error("key store corrupted: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum TrustError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A different key is already pinned for this contact.
    #[error("pinned key mismatch for contact {contact_id}")]
    Mismatch { contact_id: String },
}
