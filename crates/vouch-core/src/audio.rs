//! Signed audio chunks for a verified session.
//!
//! Every chunk is signed over the session binding, the sender id, a
//! per-sender sequence number and the payload. The receiver accepts only
//! strictly increasing sequence numbers, so a chunk cannot be injected,
//! replayed or moved between sessions.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use vouch_crypto::{Contact, CryptoError, Identity};
use vouch_protocol::{AudioChunk, PeerFrame};

use crate::handshake::Transcript;

const AUDIO_LABEL: &[u8] = b"vouch/audio";

fn audio_transcript(binding: &[u8; 32], sender: &str, sequence: u64, data: &[u8]) -> Vec<u8> {
    let mut t = Transcript::new(AUDIO_LABEL);
    t.push(binding)
        .push(sender.as_bytes())
        .push(&sequence.to_be_bytes())
        .push(data);
    t.into_bytes()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkVerdict {
    Deliver(Bytes),
    /// Arrived before verification completed; ignored.
    Dropped,
    /// Bad signature or replayed sequence number.
    Forged,
}

pub struct SecureAudioChannel {
    identity: Arc<Identity>,
    peer: Contact,
    binding: [u8; 32],
    sent: u64,
    last_received: u64,
}

impl SecureAudioChannel {
    pub fn new(identity: Arc<Identity>, peer: Contact, binding: [u8; 32]) -> Self {
        Self {
            identity,
            peer,
            binding,
            sent: 0,
            last_received: 0,
        }
    }

    /// Wrap an outbound chunk. Returns `None` while the session is not
    /// verified; nothing leaves before that.
    pub fn seal(&mut self, verified: bool, audio: &[u8]) -> Result<Option<PeerFrame>, CryptoError> {
        if !verified {
            return Ok(None);
        }
        let sequence = self.sent + 1;
        let signature = self.identity.sign(&audio_transcript(
            &self.binding,
            self.identity.id(),
            sequence,
            audio,
        ))?;
        self.sent = sequence;
        Ok(Some(PeerFrame::Audio(AudioChunk {
            sequence,
            audio_data: audio.to_vec(),
            signature,
        })))
    }

    pub fn open(&mut self, verified: bool, chunk: AudioChunk) -> ChunkVerdict {
        if !verified {
            return ChunkVerdict::Dropped;
        }
        if chunk.sequence <= self.last_received {
            warn!(
                peer = %self.peer.id,
                sequence = chunk.sequence,
                last = self.last_received,
                "replayed audio chunk"
            );
            return ChunkVerdict::Forged;
        }
        let transcript =
            audio_transcript(&self.binding, &self.peer.id, chunk.sequence, &chunk.audio_data);
        if !self.peer.public_key.verify(&transcript, &chunk.signature) {
            warn!(peer = %self.peer.id, sequence = chunk.sequence, "audio chunk signature invalid");
            return ChunkVerdict::Forged;
        }
        self.last_received = chunk.sequence;
        ChunkVerdict::Deliver(Bytes::from(chunk.audio_data))
    }
}
