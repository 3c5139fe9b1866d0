//! Per-call session record.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};
use uuid::Uuid;

use vouch_crypto::{Contact, Identity, SecurityClass};
use vouch_protocol::codec::{decode_frame, encode_frame};
use vouch_protocol::{PeerFrame, Role};

use crate::audio::{ChunkVerdict, SecureAudioChannel};
use crate::bootstrap::ConnectionBootstrap;
use crate::error::{CallError, VerificationFailure};
use crate::handshake::{session_binding, Handshake};

/// Verification status of a session. Moves forward only: once revoked a
/// session never becomes verified again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verification {
    #[default]
    Pending,
    Verified,
    Revoked,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// Handshake frame consumed, not yet verified.
    Progress,
    /// This frame completed verification.
    Verified,
    Audio(Bytes),
    Ignored,
}

pub struct Session {
    pub id: Uuid,
    pub contact: Contact,
    pub role: Role,
    pub security: SecurityClass,
    pub bootstrap: ConnectionBootstrap,
    identity: Arc<Identity>,
    verification: Verification,
    offer: Option<String>,
    answer: Option<String>,
    handshake: Option<Handshake>,
    audio: Option<SecureAudioChannel>,
}

impl Session {
    pub fn new(
        identity: Arc<Identity>,
        contact: Contact,
        role: Role,
        bootstrap: ConnectionBootstrap,
        security: SecurityClass,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact,
            role,
            security,
            bootstrap,
            identity,
            verification: Verification::Pending,
            offer: None,
            answer: None,
            handshake: None,
            audio: None,
        }
    }

    pub fn offer(&self) -> Option<&str> {
        self.offer.as_deref()
    }

    pub fn set_offer(&mut self, blob: String) {
        self.offer = Some(blob);
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn set_answer(&mut self, blob: String) {
        self.answer = Some(blob);
    }

    /// Whether the peer knows about this session (an offer went out or came in).
    pub fn peer_aware(&self) -> bool {
        self.offer.is_some()
    }

    pub fn verification(&self) -> Verification {
        self.verification
    }

    pub fn is_verified(&self) -> bool {
        self.verification == Verification::Verified
    }

    pub fn revoke(&mut self) {
        self.verification = Verification::Revoked;
    }

    /// The contact's key cannot be trusted for this session.
    pub fn compromise(&mut self) {
        self.security = SecurityClass::Compromised;
        self.revoke();
    }

    /// Start the handshake after the channel connected. Sends the
    /// initiator's challenge.
    pub fn begin_handshake(&mut self) -> Result<(), CallError> {
        if self.handshake.is_some() {
            return Ok(());
        }
        let (Some(offer), Some(answer)) = (self.offer.as_deref(), self.answer.as_deref()) else {
            return Err(CallError::InvalidSignal(
                "connected before offer and answer were exchanged".into(),
            ));
        };
        let binding = session_binding(offer, answer);

        let mut handshake = Handshake::new(
            self.role,
            self.identity.clone(),
            self.contact.clone(),
            binding,
        );
        let first = handshake.start();
        self.handshake = Some(handshake);
        self.audio = Some(SecureAudioChannel::new(
            self.identity.clone(),
            self.contact.clone(),
            binding,
        ));

        match first {
            Ok(Some(frame)) => self.send_frame(&frame),
            Ok(None) => Ok(()),
            Err(e) => {
                self.revoke();
                Err(e.into())
            }
        }
    }

    fn send_frame(&mut self, frame: &PeerFrame) -> Result<(), CallError> {
        let payload =
            encode_frame(frame).map_err(|e| CallError::Transport(e.to_string()))?;
        trace!(session = %self.id, frame = frame.label(), len = payload.len(), "frame sent");
        self.bootstrap.send(payload)
    }

    /// Process one inbound payload from the peer channel.
    pub fn handle_data(&mut self, data: Vec<u8>) -> Result<DataOutcome, CallError> {
        if self.verification == Verification::Revoked {
            return Ok(DataOutcome::Ignored);
        }
        let frame = match decode_frame(&data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = %self.id, "undecodable peer frame: {}", e);
                self.revoke();
                return Err(VerificationFailure::MalformedProof("peer frame").into());
            }
        };

        match frame {
            PeerFrame::Audio(chunk) => {
                let verified = self.is_verified();
                let Some(audio) = self.audio.as_mut() else {
                    return Ok(DataOutcome::Ignored);
                };
                match audio.open(verified, chunk) {
                    ChunkVerdict::Deliver(bytes) => Ok(DataOutcome::Audio(bytes)),
                    ChunkVerdict::Dropped => {
                        trace!(session = %self.id, "audio before verification dropped");
                        Ok(DataOutcome::Ignored)
                    }
                    ChunkVerdict::Forged => {
                        self.revoke();
                        Err(VerificationFailure::ForgedAudio.into())
                    }
                }
            }
            handshake_frame => {
                let Some(handshake) = self.handshake.as_mut() else {
                    self.revoke();
                    return Err(VerificationFailure::UnexpectedFrame(handshake_frame.label()).into());
                };
                let outcome = match handshake.handle(&handshake_frame) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.revoke();
                        return Err(e.into());
                    }
                };
                if let Some(reply) = &outcome.reply {
                    self.send_frame(reply)?;
                }
                if outcome.verified && self.verification == Verification::Pending {
                    self.verification = Verification::Verified;
                    return Ok(DataOutcome::Verified);
                }
                Ok(DataOutcome::Progress)
            }
        }
    }

    /// Sign and send a local audio chunk. Returns `false` without sending
    /// while the session is not verified.
    pub fn send_audio(&mut self, chunk: &[u8]) -> Result<bool, CallError> {
        let verified = self.is_verified();
        let Some(audio) = self.audio.as_mut() else {
            return Ok(false);
        };
        let frame = audio
            .seal(verified, chunk)
            .map_err(|_| CallError::from(VerificationFailure::LocalSigning))?;
        match frame {
            Some(frame) => {
                self.send_frame(&frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close the channel and release media. The session can no longer be
    /// verified afterwards.
    pub fn close(&mut self) {
        self.revoke();
        self.bootstrap.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
