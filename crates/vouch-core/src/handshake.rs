//! Mutual identity handshake run over a freshly connected peer channel.
//!
//! ```text
//! initiator                                   responder
//!   Challenge { id_i, n1, sig_i(T1) }  ──────►  verify with contact key
//!                                      ◄──────  Response { id_r, n2, sig_r(T2) }
//!   verify with contact key
//! ```
//!
//! `T1` covers the session binding (a hash of the offer and answer blobs),
//! both user ids in role order and `n1`. `T2` adds `n2` and `n1` again, so a
//! response is only valid for the challenge it answers. A proof therefore
//! cannot be replayed into another session or reflected back at its sender.
//!
//! The state machine is pure: it consumes frames and returns frames to
//! send. Any failure is terminal.

use std::sync::Arc;

use ring::digest;
use tracing::{debug, warn};

use vouch_crypto::{random_nonce, Contact, Identity, NONCE_LEN};
use vouch_protocol::codec::PROTOCOL_VERSION;
use vouch_protocol::{IdentityProof, PeerFrame, Role};

use crate::error::VerificationFailure;

const BINDING_LABEL: &[u8] = b"vouch/binding";
const CHALLENGE_LABEL: &[u8] = b"vouch/handshake/challenge";
const RESPONSE_LABEL: &[u8] = b"vouch/handshake/response";

/// Length-prefixed concatenation of labelled fields.
pub(crate) struct Transcript(Vec<u8>);

impl Transcript {
    pub(crate) fn new(label: &[u8]) -> Self {
        let mut t = Self(Vec::with_capacity(256));
        t.push(label);
        t.0.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        t
    }

    pub(crate) fn push(&mut self, field: &[u8]) -> &mut Self {
        self.0.extend_from_slice(&(field.len() as u32).to_be_bytes());
        self.0.extend_from_slice(field);
        self
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Hash of the offer and answer blobs that set up this session.
pub fn session_binding(offer: &str, answer: &str) -> [u8; 32] {
    let mut t = Transcript::new(BINDING_LABEL);
    t.push(offer.as_bytes()).push(answer.as_bytes());
    let hash = digest::digest(&digest::SHA256, &t.into_bytes());
    let mut binding = [0u8; 32];
    binding.copy_from_slice(hash.as_ref());
    binding
}

fn challenge_transcript(binding: &[u8; 32], initiator: &str, responder: &str, n1: &[u8]) -> Vec<u8> {
    let mut t = Transcript::new(CHALLENGE_LABEL);
    t.push(binding)
        .push(initiator.as_bytes())
        .push(responder.as_bytes())
        .push(n1);
    t.into_bytes()
}

fn response_transcript(
    binding: &[u8; 32],
    initiator: &str,
    responder: &str,
    n2: &[u8],
    n1: &[u8],
) -> Vec<u8> {
    let mut t = Transcript::new(RESPONSE_LABEL);
    t.push(binding)
        .push(initiator.as_bytes())
        .push(responder.as_bytes())
        .push(n2)
        .push(n1);
    t.into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    AwaitingChallenge,
    AwaitingResponse,
    Verified,
    Failed,
}

#[derive(Debug)]
pub struct HandshakeOutcome {
    pub reply: Option<PeerFrame>,
    pub verified: bool,
}

pub struct Handshake {
    role: Role,
    identity: Arc<Identity>,
    peer: Contact,
    binding: [u8; 32],
    state: HandshakeState,
    /// The initiator's own challenge nonce.
    challenge_nonce: Option<[u8; NONCE_LEN]>,
}

impl Handshake {
    pub fn new(role: Role, identity: Arc<Identity>, peer: Contact, binding: [u8; 32]) -> Self {
        Self {
            role,
            identity,
            peer,
            binding,
            state: HandshakeState::NotStarted,
            challenge_nonce: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        self.state == HandshakeState::Verified
    }

    /// Begin the handshake once the channel is connected. The initiator
    /// gets its challenge frame back; the responder starts waiting.
    pub fn start(&mut self) -> Result<Option<PeerFrame>, VerificationFailure> {
        match self.state {
            HandshakeState::NotStarted => {}
            HandshakeState::Failed => return Err(VerificationFailure::Terminated),
            _ => return Ok(None),
        }

        match self.role {
            Role::Responder => {
                self.state = HandshakeState::AwaitingChallenge;
                Ok(None)
            }
            Role::Initiator => {
                let result = self.challenge();
                if result.is_err() {
                    self.state = HandshakeState::Failed;
                }
                result.map(Some)
            }
        }
    }

    fn challenge(&mut self) -> Result<PeerFrame, VerificationFailure> {
        let nonce = random_nonce().map_err(|_| VerificationFailure::LocalSigning)?;
        let transcript =
            challenge_transcript(&self.binding, self.identity.id(), &self.peer.id, &nonce);
        let signature = self
            .identity
            .sign(&transcript)
            .map_err(|_| VerificationFailure::LocalSigning)?;

        self.challenge_nonce = Some(nonce);
        self.state = HandshakeState::AwaitingResponse;
        debug!(peer = %self.peer.id, "challenge sent");
        Ok(PeerFrame::Challenge(IdentityProof {
            user_id: self.identity.id().to_string(),
            nonce: nonce.to_vec(),
            signature,
        }))
    }

    /// Feed one handshake frame from the peer.
    pub fn handle(&mut self, frame: &PeerFrame) -> Result<HandshakeOutcome, VerificationFailure> {
        if self.state == HandshakeState::Failed {
            return Err(VerificationFailure::Terminated);
        }
        // A challenge can overtake the local start on a responder.
        if self.role == Role::Responder && self.state == HandshakeState::NotStarted {
            self.state = HandshakeState::AwaitingChallenge;
        }

        let result = match (self.state, frame) {
            (HandshakeState::AwaitingChallenge, PeerFrame::Challenge(proof)) => {
                self.on_challenge(proof)
            }
            (HandshakeState::AwaitingResponse, PeerFrame::Response(proof)) => {
                self.on_response(proof)
            }
            (_, frame) => Err(VerificationFailure::UnexpectedFrame(frame.label())),
        };

        if let Err(e) = &result {
            warn!(peer = %self.peer.id, role = %self.role, "handshake failed: {}", e);
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn check_claim(&self, proof: &IdentityProof, stage: &'static str) -> Result<(), VerificationFailure> {
        if proof.user_id != self.peer.id {
            return Err(VerificationFailure::UserIdMismatch {
                expected: self.peer.id.clone(),
                actual: proof.user_id.clone(),
            });
        }
        if proof.nonce.len() != NONCE_LEN {
            return Err(VerificationFailure::MalformedProof(stage));
        }
        Ok(())
    }

    fn on_challenge(&mut self, proof: &IdentityProof) -> Result<HandshakeOutcome, VerificationFailure> {
        self.check_claim(proof, "challenge")?;
        let transcript =
            challenge_transcript(&self.binding, &self.peer.id, self.identity.id(), &proof.nonce);
        if !self.peer.public_key.verify(&transcript, &proof.signature) {
            return Err(VerificationFailure::BadSignature("challenge"));
        }

        let nonce = random_nonce().map_err(|_| VerificationFailure::LocalSigning)?;
        let transcript = response_transcript(
            &self.binding,
            &self.peer.id,
            self.identity.id(),
            &nonce,
            &proof.nonce,
        );
        let signature = self
            .identity
            .sign(&transcript)
            .map_err(|_| VerificationFailure::LocalSigning)?;

        self.state = HandshakeState::Verified;
        debug!(peer = %self.peer.id, "challenge verified, response sent");
        Ok(HandshakeOutcome {
            reply: Some(PeerFrame::Response(IdentityProof {
                user_id: self.identity.id().to_string(),
                nonce: nonce.to_vec(),
                signature,
            })),
            verified: true,
        })
    }

    fn on_response(&mut self, proof: &IdentityProof) -> Result<HandshakeOutcome, VerificationFailure> {
        self.check_claim(proof, "response")?;
        let n1 = self
            .challenge_nonce
            .ok_or(VerificationFailure::UnexpectedFrame("response"))?;
        let transcript = response_transcript(
            &self.binding,
            self.identity.id(),
            &self.peer.id,
            &proof.nonce,
            &n1,
        );
        if !self.peer.public_key.verify(&transcript, &proof.signature) {
            return Err(VerificationFailure::BadSignature("response"));
        }

        self.state = HandshakeState::Verified;
        debug!(peer = %self.peer.id, "response verified");
        Ok(HandshakeOutcome {
            reply: None,
            verified: true,
        })
    }
}
