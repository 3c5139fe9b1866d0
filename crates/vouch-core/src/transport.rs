//! Seam between the call runtime and whatever carries peer-to-peer bytes.
//!
//! A connector opens one channel per session. The channel reports
//! everything asynchronously on the event sender it was opened with: its
//! own signal blob (offer or answer) to relay to the peer, connection,
//! inbound data, and closure.

use tokio::sync::mpsc;

use vouch_protocol::Role;

use crate::error::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connection-setup blob to hand to the peer through signaling.
    Signal(String),
    Connected,
    Data(Vec<u8>),
    Closed,
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

pub trait PeerChannel: Send {
    /// Apply the peer's signal blob (the offer on a responder, the answer on
    /// an initiator).
    fn signal(&mut self, blob: &str) -> Result<(), ChannelError>;

    fn send(&mut self, data: Vec<u8>) -> Result<(), ChannelError>;

    /// Must be idempotent.
    fn close(&mut self);
}

pub trait PeerConnector: Send + Sync {
    /// Open a channel. An initiator emits its offer as a
    /// [`ChannelEvent::Signal`] without further prompting.
    fn open(&self, role: Role, events: EventSender) -> Result<Box<dyn PeerChannel>, ChannelError>;
}
