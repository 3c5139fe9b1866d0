//! In-process peer connector.
//!
//! Channels opened on the same [`LoopbackNetwork`] find each other through
//! small JSON link blobs exchanged as offer and answer, so the whole
//! signaling path runs for real without any network.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use vouch_protocol::Role;

use crate::error::ChannelError;
use crate::transport::{ChannelEvent, EventSender, PeerChannel, PeerConnector};

#[derive(Serialize, Deserialize)]
struct LinkBlob {
    link: String,
    token: String,
}

fn link_blob(link: &str) -> Result<String, ChannelError> {
    serde_json::to_string(&LinkBlob {
        link: link.to_string(),
        token: uuid::Uuid::new_v4().simple().to_string(),
    })
    .map_err(|e| ChannelError::Init(e.to_string()))
}

/// Where a channel delivers outbound data once connected.
type PeerSlot = Arc<Mutex<Option<EventSender>>>;

fn lock(slot: &PeerSlot) -> MutexGuard<'_, Option<EventSender>> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

struct PendingLink {
    initiator_events: EventSender,
    responder: Option<(EventSender, PeerSlot)>,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    links: Arc<DashMap<String, PendingLink>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers that have not been answered yet.
    pub fn pending_links(&self) -> usize {
        self.links.len()
    }
}

impl PeerConnector for LoopbackNetwork {
    fn open(&self, role: Role, events: EventSender) -> Result<Box<dyn PeerChannel>, ChannelError> {
        let mut link = None;
        if role == Role::Initiator {
            let id = uuid::Uuid::new_v4().simple().to_string();
            let offer = link_blob(&id)?;
            self.links.insert(
                id.clone(),
                PendingLink {
                    initiator_events: events.clone(),
                    responder: None,
                },
            );
            if events.send(ChannelEvent::Signal(offer)).is_err() {
                self.links.remove(&id);
                return Err(ChannelError::Init("event receiver dropped".into()));
            }
            debug!(link = %id, "loopback offer created");
            link = Some(id);
        }

        Ok(Box::new(LoopbackChannel {
            links: self.links.clone(),
            role,
            link,
            events,
            peer: PeerSlot::default(),
            closed: false,
        }))
    }
}

struct LoopbackChannel {
    links: Arc<DashMap<String, PendingLink>>,
    role: Role,
    link: Option<String>,
    events: EventSender,
    peer: PeerSlot,
    closed: bool,
}

impl LoopbackChannel {
    fn accept_offer(&mut self, link: String) -> Result<(), ChannelError> {
        if self.link.is_some() {
            return Err(ChannelError::InvalidSignal("offer already applied".into()));
        }
        {
            let mut pending = self
                .links
                .get_mut(&link)
                .ok_or_else(|| ChannelError::InvalidSignal(format!("unknown link {link}")))?;
            if pending.responder.is_some() {
                return Err(ChannelError::InvalidSignal("link already answered".into()));
            }
            pending.responder = Some((self.events.clone(), self.peer.clone()));
        }

        let answer = link_blob(&link)?;
        debug!(link = %link, "loopback answer created");
        self.link = Some(link);
        let _ = self.events.send(ChannelEvent::Signal(answer));
        Ok(())
    }

    fn accept_answer(&mut self, link: String) -> Result<(), ChannelError> {
        if self.link.as_deref() != Some(link.as_str()) {
            return Err(ChannelError::InvalidSignal(
                "answer does not match the pending offer".into(),
            ));
        }
        let (_, pending) = self
            .links
            .remove_if(&link, |_, p| p.responder.is_some())
            .ok_or_else(|| ChannelError::InvalidSignal("link has no responder".into()))?;
        let Some((responder_events, responder_peer)) = pending.responder else {
            return Err(ChannelError::InvalidSignal("link has no responder".into()));
        };

        *lock(&responder_peer) = Some(pending.initiator_events);
        if responder_events.send(ChannelEvent::Connected).is_err() {
            let _ = self.events.send(ChannelEvent::Closed);
            return Ok(());
        }
        *lock(&self.peer) = Some(responder_events);
        let _ = self.events.send(ChannelEvent::Connected);
        debug!(link = %link, "loopback link connected");
        Ok(())
    }
}

impl PeerChannel for LoopbackChannel {
    fn signal(&mut self, blob: &str) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let parsed: LinkBlob = serde_json::from_str(blob)
            .map_err(|e| ChannelError::InvalidSignal(format!("not a link blob: {e}")))?;
        match self.role {
            Role::Responder => self.accept_offer(parsed.link),
            Role::Initiator => self.accept_answer(parsed.link),
        }
    }

    fn send(&mut self, data: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let peer = lock(&self.peer);
        let tx = peer.as_ref().ok_or(ChannelError::NotConnected)?;
        tx.send(ChannelEvent::Data(data))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(peer) = lock(&self.peer).take() {
            let _ = peer.send(ChannelEvent::Closed);
        }
        if let Some(link) = &self.link {
            match self.role {
                Role::Initiator => {
                    self.links.remove(link);
                }
                Role::Responder => {
                    if let Some(mut pending) = self.links.get_mut(link) {
                        pending.responder = None;
                    }
                }
            }
        }
        trace!(role = %self.role, "loopback channel closed");
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.close();
    }
}
