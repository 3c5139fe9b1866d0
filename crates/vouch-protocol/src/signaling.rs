use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{now_millis, Timestamp, UserId};

/// A signal carried through the relay between two users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Connection-setup blob produced by the caller.
    Offer(String),
    /// Connection-setup blob produced by the callee in reply to an offer.
    Answer(String),
    /// The sender ended the call.
    Disconnect,
    /// The sender declined (or could not take) the call.
    Reject,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Disconnect => SignalKind::Disconnect,
            Signal::Reject => SignalKind::Reject,
        }
    }
}

/// The `type` discriminator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Disconnect,
    Reject,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Disconnect => "disconnect",
            SignalKind::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// One message in a recipient's mailbox.
///
/// Serialized as `{from, to, type, data, timestamp}`. Parsing validates the
/// message once at the relay boundary: unknown types fail to deserialize and
/// an offer or answer without data is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct SignalingMessage {
    pub from: UserId,
    pub to: UserId,
    pub signal: Signal,
    pub timestamp: Timestamp,
}

impl SignalingMessage {
    /// Build a message stamped with the current time.
    pub fn new(from: impl Into<UserId>, to: impl Into<UserId>, signal: Signal) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            signal,
            timestamp: now_millis(),
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.signal.kind()
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    from: String,
    to: String,
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default)]
    data: String,
    timestamp: Timestamp,
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        if wire.from.is_empty() || wire.to.is_empty() {
            return Err(ProtocolError::InvalidSignal("missing sender or recipient".into()));
        }

        let signal = match wire.kind {
            SignalKind::Offer | SignalKind::Answer if wire.data.is_empty() => {
                return Err(ProtocolError::InvalidSignal(format!(
                    "{} without data",
                    wire.kind
                )));
            }
            SignalKind::Offer => Signal::Offer(wire.data),
            SignalKind::Answer => Signal::Answer(wire.data),
            SignalKind::Disconnect => Signal::Disconnect,
            SignalKind::Reject => Signal::Reject,
        };

        Ok(Self {
            from: wire.from,
            to: wire.to,
            signal,
            timestamp: wire.timestamp,
        })
    }
}

impl From<SignalingMessage> for WireMessage {
    fn from(msg: SignalingMessage) -> Self {
        let kind = msg.signal.kind();
        let data = match msg.signal {
            Signal::Offer(data) | Signal::Answer(data) => data,
            Signal::Disconnect | Signal::Reject => String::new(),
        };
        Self {
            from: msg.from,
            to: msg.to,
            kind,
            data,
            timestamp: msg.timestamp,
        }
    }
}
