//! Peer channel lifecycle for one call.
//!
//! Wraps a [`PeerChannel`] with the media lease it needs and turns the
//! channel's raw events into a stream the call runtime consumes. The
//! bootstrap is single-use: once closed it cannot be reopened.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use vouch_protocol::Role;

use crate::error::CallError;
use crate::media::{MediaLease, MediaSlot};
use crate::transport::{ChannelEvent, PeerChannel, PeerConnector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapEvent {
    /// Our offer or answer, to be relayed to the peer.
    LocalSignal(String),
    /// Emitted once per bootstrap.
    Connected,
    Data(Vec<u8>),
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Initiator { answered: bool },
    Responder,
    Closed,
}

pub struct ConnectionBootstrap {
    connector: Arc<dyn PeerConnector>,
    media: MediaSlot,
    signal_timeout: Duration,
    phase: Phase,
    channel: Option<Box<dyn PeerChannel>>,
    lease: Option<MediaLease>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    /// Events read ahead while waiting for the local signal.
    backlog: VecDeque<ChannelEvent>,
    connected: bool,
}

impl ConnectionBootstrap {
    pub fn new(connector: Arc<dyn PeerConnector>, media: MediaSlot, signal_timeout: Duration) -> Self {
        Self {
            connector,
            media,
            signal_timeout,
            phase: Phase::Idle,
            channel: None,
            lease: None,
            events: None,
            backlog: VecDeque::new(),
            connected: false,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self.phase {
            Phase::Initiator { .. } => Some(Role::Initiator),
            Phase::Responder => Some(Role::Responder),
            Phase::Idle | Phase::Closed => None,
        }
    }

    /// True once a channel has been opened and not yet closed.
    pub fn is_open(&self) -> bool {
        self.role().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Whether [`next_event`](Self::next_event) can still yield anything.
    pub fn has_events(&self) -> bool {
        self.events.is_some() || !self.backlog.is_empty()
    }

    fn open(&mut self, role: Role) -> Result<(), CallError> {
        match self.phase {
            Phase::Idle => {}
            Phase::Closed => return Err(CallError::ChannelInit("channel already closed".into())),
            _ => return Err(CallError::ChannelInit("channel already initialized".into())),
        }

        let lease = self.media.acquire()?;
        let (tx, rx) = mpsc::unbounded_channel();
        // On error the lease drops here and the device is released.
        let channel = self.connector.open(role, tx)?;

        self.lease = Some(lease);
        self.channel = Some(channel);
        self.events = Some(rx);
        self.phase = match role {
            Role::Initiator => Phase::Initiator { answered: false },
            Role::Responder => Phase::Responder,
        };
        debug!(%role, "peer channel opened");
        Ok(())
    }

    /// Open as initiator. The offer arrives later as a
    /// [`BootstrapEvent::LocalSignal`].
    pub fn open_initiator(&mut self) -> Result<(), CallError> {
        self.open(Role::Initiator)
    }

    /// Open as responder and apply the peer's offer. The answer arrives
    /// later as a [`BootstrapEvent::LocalSignal`].
    pub fn open_responder(&mut self, offer: &str) -> Result<(), CallError> {
        self.open(Role::Responder)?;
        let applied = match self.channel.as_mut() {
            Some(channel) => channel.signal(offer),
            None => return Err(CallError::ChannelInit("channel missing after open".into())),
        };
        if let Err(e) = applied {
            self.close();
            return Err(CallError::InvalidSignal(e.to_string()));
        }
        Ok(())
    }

    /// Open as initiator and wait for the offer blob.
    pub async fn create_offer(&mut self) -> Result<String, CallError> {
        self.open_initiator()?;
        self.local_signal().await
    }

    /// Open as responder with `offer` and wait for the answer blob.
    pub async fn receive_offer(&mut self, offer: &str) -> Result<String, CallError> {
        self.open_responder(offer)?;
        self.local_signal().await
    }

    pub fn receive_answer(&mut self, answer: &str) -> Result<(), CallError> {
        match self.phase {
            Phase::Initiator { answered: false } => {}
            Phase::Initiator { answered: true } => {
                return Err(CallError::InvalidSignal("answer already applied".into()))
            }
            _ => {
                return Err(CallError::InvalidSignal(
                    "answer received without a pending offer".into(),
                ))
            }
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| CallError::InvalidSignal("no open channel".into()))?;
        channel
            .signal(answer)
            .map_err(|e| CallError::InvalidSignal(e.to_string()))?;
        self.phase = Phase::Initiator { answered: true };
        Ok(())
    }

    pub fn send(&mut self, data: Vec<u8>) -> Result<(), CallError> {
        if !self.connected {
            return Err(CallError::Transport("channel not connected".into()));
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| CallError::Transport("channel closed".into()))?;
        channel.send(data).map_err(|e| CallError::Transport(e.to_string()))
    }

    /// Next channel event. `None` once the bootstrap has nothing more to
    /// report (never opened, closed, or the event source went away after
    /// a final `Closed`).
    pub async fn next_event(&mut self) -> Option<BootstrapEvent> {
        loop {
            let raw = match self.backlog.pop_front() {
                Some(event) => event,
                None => {
                    let rx = self.events.as_mut()?;
                    match rx.recv().await {
                        Some(event) => event,
                        None => {
                            self.events = None;
                            ChannelEvent::Closed
                        }
                    }
                }
            };

            match raw {
                ChannelEvent::Signal(blob) => return Some(BootstrapEvent::LocalSignal(blob)),
                ChannelEvent::Connected => {
                    if self.connected {
                        trace!("duplicate connected event ignored");
                        continue;
                    }
                    self.connected = true;
                    return Some(BootstrapEvent::Connected);
                }
                ChannelEvent::Data(data) => {
                    if !self.connected {
                        debug!(len = data.len(), "data before connect dropped");
                        continue;
                    }
                    return Some(BootstrapEvent::Data(data));
                }
                ChannelEvent::Closed => return Some(BootstrapEvent::Closed),
                ChannelEvent::Error(e) => return Some(BootstrapEvent::Error(e)),
            }
        }
    }

    async fn local_signal(&mut self) -> Result<String, CallError> {
        let timeout = self.signal_timeout;
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let Some(rx) = self.events.as_mut() else {
                    return Err(CallError::ChannelInit("channel closed".into()));
                };
                match rx.recv().await {
                    Some(ChannelEvent::Signal(blob)) => return Ok(blob),
                    Some(ChannelEvent::Error(e)) => return Err(CallError::ChannelInit(e)),
                    Some(ChannelEvent::Closed) | None => {
                        return Err(CallError::ChannelInit(
                            "channel closed before producing a signal".into(),
                        ))
                    }
                    Some(other) => self.backlog.push_back(other),
                }
            }
        })
        .await;

        let result = waited.unwrap_or_else(|_| {
            Err(CallError::ChannelInit(format!(
                "no local signal within {}s",
                timeout.as_secs()
            )))
        });
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Tear down the channel and release the media device. Idempotent and
    /// safe on a bootstrap that never finished opening.
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let was_open = self.is_open();
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
        self.events = None;
        self.backlog.clear();
        self.connected = false;
        self.phase = Phase::Closed;
        if was_open {
            debug!("peer channel closed");
        }
    }
}

impl Drop for ConnectionBootstrap {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::loopback::LoopbackNetwork;
    use crate::media::NullMedia;
    use crate::transport::EventSender;

    fn bootstrap(net: &LoopbackNetwork, media: &MediaSlot) -> ConnectionBootstrap {
        ConnectionBootstrap::new(Arc::new(net.clone()), media.clone(), Duration::from_secs(10))
    }

    fn slot() -> MediaSlot {
        MediaSlot::new(Arc::new(NullMedia))
    }

    #[tokio::test]
    async fn offer_answer_connects() {
        let net = LoopbackNetwork::new();
        let (media_a, media_b) = (slot(), slot());
        let mut a = bootstrap(&net, &media_a);
        let mut b = bootstrap(&net, &media_b);

        let offer = a.create_offer().await.unwrap();
        let answer = b.receive_offer(&offer).await.unwrap();
        a.receive_answer(&answer).unwrap();

        assert_eq!(a.next_event().await, Some(BootstrapEvent::Connected));
        assert_eq!(b.next_event().await, Some(BootstrapEvent::Connected));
        assert!(a.is_connected() && b.is_connected());

        a.send(vec![7]).unwrap();
        assert_eq!(b.next_event().await, Some(BootstrapEvent::Data(vec![7])));
    }

    #[tokio::test]
    async fn answer_rules() {
        let net = LoopbackNetwork::new();
        let media = slot();
        let mut idle = bootstrap(&net, &media);
        assert!(matches!(
            idle.receive_answer("{}"),
            Err(CallError::InvalidSignal(_))
        ));

        let mut a = bootstrap(&net, &media);
        let offer = a.create_offer().await.unwrap();
        let mut b = bootstrap(&net, &slot());
        let answer = b.receive_offer(&offer).await.unwrap();
        a.receive_answer(&answer).unwrap();
        assert!(matches!(
            a.receive_answer(&answer),
            Err(CallError::InvalidSignal(_))
        ));
        assert!(matches!(
            b.receive_answer(&answer),
            Err(CallError::InvalidSignal(_))
        ));
    }

    #[tokio::test]
    async fn malformed_offer_is_invalid_signal_and_releases_media() {
        let net = LoopbackNetwork::new();
        let media = slot();
        let mut b = bootstrap(&net, &media);
        assert!(matches!(
            b.receive_offer("not a blob").await,
            Err(CallError::InvalidSignal(_))
        ));
        assert!(b.is_closed());
        assert!(!media.is_in_use());
    }

    #[tokio::test]
    async fn media_busy_is_channel_init_error() {
        let net = LoopbackNetwork::new();
        let media = slot();
        let mut first = bootstrap(&net, &media);
        first.open_initiator().unwrap();
        let mut second = bootstrap(&net, &media);
        assert!(matches!(
            second.open_initiator(),
            Err(CallError::ChannelInit(_))
        ));
        first.close();
        assert!(!media.is_in_use());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let net = LoopbackNetwork::new();
        let media = slot();
        let mut never_opened = bootstrap(&net, &media);
        never_opened.close();
        never_opened.close();
        assert!(never_opened.next_event().await.is_none());
        assert!(matches!(
            never_opened.open_initiator(),
            Err(CallError::ChannelInit(_))
        ));

        let mut a = bootstrap(&net, &media);
        a.create_offer().await.unwrap();
        assert!(media.is_in_use());
        drop(a);
        assert!(!media.is_in_use());
        assert_eq!(net.pending_links(), 0);
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let net = LoopbackNetwork::new();
        let mut a = bootstrap(&net, &slot());
        a.create_offer().await.unwrap();
        assert!(matches!(a.send(vec![1]), Err(CallError::Transport(_))));
    }

    /// A connector whose channel never produces a signal.
    struct Silent;

    struct SilentChannel(#[allow(dead_code)] EventSender);

    impl PeerChannel for SilentChannel {
        fn signal(&mut self, _blob: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        fn send(&mut self, _data: Vec<u8>) -> Result<(), ChannelError> {
            Err(ChannelError::NotConnected)
        }
        fn close(&mut self) {}
    }

    impl PeerConnector for Silent {
        fn open(&self, _role: Role, events: EventSender) -> Result<Box<dyn PeerChannel>, ChannelError> {
            Ok(Box::new(SilentChannel(events)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn local_signal_times_out() {
        let media = slot();
        let mut a = ConnectionBootstrap::new(Arc::new(Silent), media.clone(), Duration::from_secs(2));
        let err = a.create_offer().await.unwrap_err();
        assert!(matches!(err, CallError::ChannelInit(_)));
        assert!(a.is_closed());
        assert!(!media.is_in_use());
    }

    #[tokio::test]
    async fn duplicate_connected_is_reported_once() {
        let media = slot();
        let mut a = ConnectionBootstrap::new(Arc::new(Silent), media, Duration::from_secs(2));
        a.open_initiator().unwrap();
        // Feed raw events through the backlog.
        a.backlog.push_back(ChannelEvent::Data(vec![0]));
        a.backlog.push_back(ChannelEvent::Connected);
        a.backlog.push_back(ChannelEvent::Connected);
        a.backlog.push_back(ChannelEvent::Data(vec![1]));
        assert_eq!(a.next_event().await, Some(BootstrapEvent::Connected));
        assert_eq!(a.next_event().await, Some(BootstrapEvent::Data(vec![1])));
    }
}
