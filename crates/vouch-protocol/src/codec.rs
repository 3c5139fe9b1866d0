use crate::error::ProtocolError;
use crate::peer::PeerFrame;
use crate::signaling::SignalingMessage;

/// Maximum encoded peer frame size: 64 KiB.
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Handshake protocol version, mixed into every signed transcript.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a signaling message as a JSON string for the mailbox store.
pub fn encode_signal(msg: &SignalingMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode one stored mailbox entry.
pub fn decode_signal(raw: &str) -> Result<SignalingMessage, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
}

/// Encode a `PeerFrame` into a postcard payload for the peer channel.
pub fn encode_frame(frame: &PeerFrame) -> Result<Vec<u8>, ProtocolError> {
    let payload = postcard::to_allocvec(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    Ok(payload)
}

/// Decode a `PeerFrame` received from the peer channel.
pub fn decode_frame(payload: &[u8]) -> Result<PeerFrame, ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    Ok(postcard::from_bytes(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{AudioChunk, IdentityProof};
    use crate::signaling::Signal;

    #[test]
    fn signal_survives_store_roundtrip() {
        let msg = SignalingMessage::new("alice", "bob", Signal::Offer("{\"link\":1}".into()));
        let raw = encode_signal(&msg).unwrap();
        let decoded = decode_signal(&raw).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn garbage_signal_fails() {
        assert!(matches!(decode_signal("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn challenge_frame_decodes() {
        let frame = PeerFrame::Challenge(IdentityProof {
            user_id: "alice".into(),
            nonce: vec![7; 32],
            signature: vec![9; 64],
        });
        let payload = encode_frame(&frame).unwrap();
        match decode_frame(&payload).unwrap() {
            PeerFrame::Challenge(proof) => {
                assert_eq!(proof.user_id, "alice");
                assert_eq!(proof.nonce, vec![7; 32]);
            }
            other => panic!("wrong variant: {}", other.label()),
        }
    }

    #[test]
    fn oversized_frame_rejected_on_encode() {
        let frame = PeerFrame::Audio(AudioChunk {
            sequence: 1,
            audio_data: vec![0; MAX_FRAME_SIZE + 1],
            signature: vec![],
        });
        assert!(matches!(
            encode_frame(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected_on_decode() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 10];
        assert!(matches!(
            decode_frame(&payload),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn truncated_frame_fails() {
        let frame = PeerFrame::Audio(AudioChunk {
            sequence: 3,
            audio_data: vec![1, 2, 3, 4],
            signature: vec![5; 64],
        });
        let payload = encode_frame(&frame).unwrap();
        assert!(matches!(
            decode_frame(&payload[..payload.len() - 5]),
            Err(ProtocolError::Serialization(_))
        ));
    }
}
