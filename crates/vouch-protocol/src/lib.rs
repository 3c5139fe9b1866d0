pub mod codec;
pub mod error;
pub mod peer;
pub mod signaling;
pub mod types;

pub use error::ProtocolError;
pub use peer::{AudioChunk, IdentityProof, PeerFrame};
pub use signaling::{Signal, SignalKind, SignalingMessage};
pub use types::{Role, Timestamp, UserId};
