use serde::Serialize;
use thiserror::Error;

use vouch_crypto::{StoreError, TrustError};
use vouch_protocol::ProtocolError;

/// Why the identity of the peer could not be trusted. Always terminal for
/// the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("peer claimed to be {actual}, expected {expected}")]
    UserIdMismatch { expected: String, actual: String },

    #[error("{0} signature does not verify against the contact's key")]
    BadSignature(&'static str),

    #[error("malformed {0}")]
    MalformedProof(&'static str),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("contact key differs from the pinned key")]
    KeyMismatch,

    #[error("unauthenticated audio chunk")]
    ForgedAudio,

    #[error("could not produce a local proof")]
    LocalSigning,

    #[error("handshake already failed")]
    Terminated,
}

/// Errors reported by a peer channel implementation.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel initialization failed: {0}")]
    Init(String),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("channel not connected")]
    NotConnected,

    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signaling store unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("channel initialization failed: {0}")]
    ChannelInit(String),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("verification failed: {0}")]
    Verification(#[from] VerificationFailure),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("peer channel error: {0}")]
    Transport(String),

    #[error("identity handshake timed out")]
    HandshakeTimeout,

    #[error("unknown contact: {0}")]
    UnknownContact(String),

    #[error("a call is already in progress")]
    Busy,

    #[error("call service stopped")]
    Stopped,
}

/// Failure reason shown next to `CallStatus::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFailure {
    /// Possible impersonation. Never conflated with the network cases.
    Verification,
    ChannelInit,
    InvalidSignal,
    Storage,
    Transport,
    Timeout,
}

impl CallError {
    /// The failure reason for errors that end a call; `None` for request
    /// errors that leave the call state untouched.
    pub fn failure(&self) -> Option<CallFailure> {
        match self {
            CallError::ChannelInit(_) => Some(CallFailure::ChannelInit),
            CallError::InvalidSignal(_) => Some(CallFailure::InvalidSignal),
            CallError::Verification(_) => Some(CallFailure::Verification),
            CallError::StorageUnavailable(_) => Some(CallFailure::Storage),
            CallError::Transport(_) => Some(CallFailure::Transport),
            CallError::HandshakeTimeout => Some(CallFailure::Timeout),
            CallError::UnknownContact(_) | CallError::Busy | CallError::Stopped => None,
        }
    }

    pub fn is_verification(&self) -> bool {
        matches!(self, CallError::Verification(_))
    }
}

impl From<ChannelError> for CallError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Init(reason) => CallError::ChannelInit(reason),
            ChannelError::InvalidSignal(reason) => CallError::InvalidSignal(reason),
            other => CallError::Transport(other.to_string()),
        }
    }
}

impl From<RelayError> for CallError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::StorageUnavailable(reason) => CallError::StorageUnavailable(reason),
            RelayError::Protocol(e) => CallError::InvalidSignal(e.to_string()),
        }
    }
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        CallError::StorageUnavailable(e.to_string())
    }
}

impl From<TrustError> for CallError {
    fn from(e: TrustError) -> Self {
        match e {
            TrustError::Store(e) => e.into(),
            TrustError::Mismatch { .. } => VerificationFailure::KeyMismatch.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_errors_are_distinct_from_network_errors() {
        let e: CallError = VerificationFailure::BadSignature("challenge").into();
        assert!(e.is_verification());
        assert_eq!(e.failure(), Some(CallFailure::Verification));

        let e: CallError = ChannelError::Closed.into();
        assert!(!e.is_verification());
        assert_eq!(e.failure(), Some(CallFailure::Transport));
    }

    #[test]
    fn channel_error_mapping() {
        let e: CallError = ChannelError::Init("no microphone".into()).into();
        assert_eq!(e, CallError::ChannelInit("no microphone".into()));
        let e: CallError = ChannelError::InvalidSignal("bad blob".into()).into();
        assert_eq!(e.failure(), Some(CallFailure::InvalidSignal));
    }

    #[test]
    fn trust_mismatch_is_verification_failure() {
        let e: CallError = TrustError::Mismatch {
            contact_id: "alice".into(),
        }
        .into();
        assert_eq!(e, CallError::Verification(VerificationFailure::KeyMismatch));

        let e: CallError = TrustError::Store(StoreError::Unavailable("disk".into())).into();
        assert_eq!(e.failure(), Some(CallFailure::Storage));
    }

    #[test]
    fn request_errors_have_no_failure_reason() {
        assert_eq!(CallError::Busy.failure(), None);
        assert_eq!(CallError::UnknownContact("x".into()).failure(), None);
    }

    #[test]
    fn display_messages() {
        let e = VerificationFailure::UserIdMismatch {
            expected: "alice".into(),
            actual: "mallory".into(),
        };
        assert_eq!(e.to_string(), "peer claimed to be mallory, expected alice");
        assert!(CallError::HandshakeTimeout.to_string().contains("timed out"));
    }
}
