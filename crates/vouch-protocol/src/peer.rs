use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Proof of private-key possession sent during the identity handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    /// The id the sender claims to be.
    pub user_id: UserId,
    /// Fresh random nonce generated by the sender (32 bytes).
    pub nonce: Vec<u8>,
    /// Signature over the handshake transcript ending in `nonce`.
    pub signature: Vec<u8>,
}

/// A signed audio chunk. Only exchanged after both sides verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    /// Strictly increasing per sender, starting at 1.
    pub sequence: u64,
    pub audio_data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Everything sent over the peer channel once it is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFrame {
    /// Initiator -> responder, first handshake step.
    Challenge(IdentityProof),
    /// Responder -> initiator, second handshake step.
    Response(IdentityProof),
    Audio(AudioChunk),
}

impl PeerFrame {
    pub fn label(&self) -> &'static str {
        match self {
            PeerFrame::Challenge(_) => "challenge",
            PeerFrame::Response(_) => "response",
            PeerFrame::Audio(_) => "audio",
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, PeerFrame::Challenge(_) | PeerFrame::Response(_))
    }
}
