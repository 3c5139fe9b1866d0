//! The call state machine.
//!
//! One [`CallService`] task runs per local user and owns at most one
//! [`Session`]. The UI drives it through a cloneable [`CallHandle`] and
//! watches [`CallState`] snapshots. Every input (commands, relayed
//! signals, peer channel events, timers) is handled on that one task, so
//! transitions never interleave.
//!
//! ```text
//! Idle ──call/offer──► Ringing ──answer sent/received──► Connecting
//!                         │                                  │
//!                    reject/disconnect                 handshake verified
//!                         ▼                                  ▼
//!                       Idle ◄──────hang up/disconnect──── Connected
//!
//! any active state ──error──► Failed ──(linger)──► Idle
//! ```

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, trace, warn};

use vouch_crypto::{
    Contact, ContactBook, ContactChange, Identity, PinOutcome, SecurityClass, TrustStore,
};
use vouch_protocol::types::now_millis;
use vouch_protocol::{Role, Signal, SignalingMessage};

use crate::bootstrap::{BootstrapEvent, ConnectionBootstrap};
use crate::config::CallConfig;
use crate::error::{CallError, CallFailure, VerificationFailure};
use crate::media::MediaSlot;
use crate::relay::SignalingRelay;
use crate::session::{DataOutcome, Session};
use crate::transport::PeerConnector;

const COMMAND_QUEUE: usize = 32;
const AUDIO_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Ringing,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// The contact on the other end, as shown in the call UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallPeer {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
}

impl From<&Contact> for CallPeer {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id.clone(),
            name: contact.name.clone(),
            fingerprint: contact.public_key.fingerprint().to_string(),
        }
    }
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub status: CallStatus,
    pub contact: Option<CallPeer>,
    /// Set only when the failure means the peer could not prove its
    /// identity, never for network problems.
    pub verification_failed: bool,
    pub direction: Option<CallDirection>,
    pub security: Option<SecurityClass>,
    pub failure: Option<CallFailure>,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            status: CallStatus::Idle,
            contact: None,
            verification_failed: false,
            direction: None,
            security: None,
            failure: None,
        }
    }
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            CallStatus::Ringing | CallStatus::Connecting | CallStatus::Connected
        )
    }
}

enum Command {
    Call {
        contact_id: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept,
    Reject,
    HangUp,
    SendAudio(Bytes),
    AddContact {
        contact: Contact,
        reply: oneshot::Sender<ContactChange>,
    },
    Shutdown,
}

// ── Handle ──────────────────────────────────────────────────────────────

/// Cloneable front end of a running [`CallService`].
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    async fn send(&self, cmd: Command) -> Result<(), CallError> {
        self.commands.send(cmd).await.map_err(|_| CallError::Stopped)
    }

    /// Place a call. Fails right away for an unknown contact, while another
    /// call is active, or when the call cannot even be set up; later
    /// failures show up in the call state.
    pub async fn call(&self, contact_id: &str) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            contact_id: contact_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.send(Command::Accept).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.send(Command::Reject).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.send(Command::HangUp).await
    }

    /// Queue a captured audio chunk. Silently dropped until the call is
    /// verified.
    pub async fn send_audio(&self, chunk: Bytes) -> Result<(), CallError> {
        self.send(Command::SendAudio(chunk)).await
    }

    pub async fn add_contact(&self, contact: Contact) -> Result<ContactChange, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddContact { contact, reply }).await?;
        rx.await.map_err(|_| CallError::Stopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&CallState) -> bool,
    ) -> Result<CallState, CallError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| CallError::Stopped)?;
        Ok((*state).clone())
    }
}

// ── Service ─────────────────────────────────────────────────────────────

/// Everything a call service needs from the outside.
pub struct CallDeps {
    pub identity: Arc<Identity>,
    pub contacts: ContactBook,
    pub relay: Arc<SignalingRelay>,
    pub connector: Arc<dyn PeerConnector>,
    pub media: MediaSlot,
    pub trust: Arc<TrustStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    Handshake,
    /// The verified channel closed; waiting for the peer's `disconnect`.
    PeerLeft,
    FailureReset,
}

struct Deadline {
    kind: DeadlineKind,
    sleep: Pin<Box<Sleep>>,
}

pub struct CallService {
    identity: Arc<Identity>,
    contacts: ContactBook,
    relay: Arc<SignalingRelay>,
    connector: Arc<dyn PeerConnector>,
    media: MediaSlot,
    trust: Arc<TrustStore>,
    config: CallConfig,
    commands: mpsc::Receiver<Command>,
    signals: mpsc::UnboundedReceiver<SignalingMessage>,
    state: watch::Sender<CallState>,
    audio_out: mpsc::Sender<Bytes>,
    session: Option<Session>,
    deadline: Option<Deadline>,
}

impl CallService {
    /// Start listening for signals and spawn the service task. Returns the
    /// handle and the stream of verified inbound audio chunks.
    pub fn spawn(deps: CallDeps, config: CallConfig) -> (CallHandle, mpsc::Receiver<Bytes>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(CallState::default());
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let signals = deps.relay.start_listening(deps.identity.id());

        let service = CallService {
            identity: deps.identity,
            contacts: deps.contacts,
            relay: deps.relay,
            connector: deps.connector,
            media: deps.media,
            trust: deps.trust,
            config,
            commands: cmd_rx,
            signals,
            state: state_tx,
            audio_out: audio_tx,
            session: None,
            deadline: None,
        };
        tokio::spawn(service.run());

        (
            CallHandle {
                commands: cmd_tx,
                state: state_rx,
            },
            audio_rx,
        )
    }

    async fn run(mut self) {
        info!(user = %self.identity.id(), contacts = self.contacts.len(), "call service started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(msg) = self.signals.recv() => self.handle_signal(msg),
                Some(event) = next_channel_event(&mut self.session) => {
                    self.handle_channel_event(event)
                }
                kind = expire(&mut self.deadline) => self.handle_deadline(kind),
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(peer) = self.aware_peer() {
            self.notify(&peer, Signal::Disconnect);
        }
        self.end_session("service stopped");
        self.relay.stop_listening(self.identity.id());
        info!(user = %self.identity.id(), "call service stopped");
    }

    // --- Commands ---

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { contact_id, reply } => {
                let result = self.start_outgoing(&contact_id);
                let _ = reply.send(result);
            }
            Command::Accept => self.accept_incoming(),
            Command::Reject => self.reject_incoming(),
            Command::HangUp => self.hang_up(),
            Command::SendAudio(chunk) => self.send_audio(&chunk),
            Command::AddContact { contact, reply } => {
                let change = self.contacts.insert(contact);
                let _ = reply.send(change);
            }
            Command::Shutdown => {}
        }
    }

    fn start_outgoing(&mut self, contact_id: &str) -> Result<(), CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }
        let contact = self
            .contacts
            .get(contact_id)
            .cloned()
            .ok_or_else(|| CallError::UnknownContact(contact_id.to_string()))?;

        let session = Session::new(
            self.identity.clone(),
            contact.clone(),
            Role::Initiator,
            self.new_bootstrap(),
            SecurityClass::Unknown,
        );
        info!(contact = %contact.id, session = %session.id, "placing call");
        self.begin(session, CallDirection::Outgoing);

        self.check_trust()?;
        let opened = match self.session.as_mut() {
            Some(session) => session.bootstrap.open_initiator(),
            None => return Ok(()),
        };
        opened.map_err(|e| self.fail(e))
    }

    fn accept_incoming(&mut self) {
        let offer = match &self.session {
            Some(s) if s.role == Role::Responder && !s.bootstrap.is_open() => {
                s.offer().map(str::to_string)
            }
            _ => None,
        };
        let Some(offer) = offer else {
            debug!("accept ignored, no incoming call is ringing");
            return;
        };

        if self.check_trust().is_err() {
            return;
        }
        let opened = match self.session.as_mut() {
            Some(session) => session.bootstrap.open_responder(&offer),
            None => return,
        };
        match opened {
            Ok(()) => info!("incoming call accepted"),
            Err(e) => {
                self.fail(e);
            }
        }
    }

    fn reject_incoming(&mut self) {
        let peer = match &self.session {
            Some(s) if s.role == Role::Responder && !s.bootstrap.is_open() => s.contact.id.clone(),
            _ => {
                debug!("reject ignored, no incoming call is ringing");
                return;
            }
        };
        self.notify(&peer, Signal::Reject);
        self.end_session("rejected");
    }

    fn hang_up(&mut self) {
        if self.session.is_none() {
            let failed = self.state.borrow().status == CallStatus::Failed;
            if failed {
                self.deadline = None;
                self.state.send_replace(CallState::default());
            }
            return;
        }
        if let Some(peer) = self.aware_peer() {
            self.notify(&peer, Signal::Disconnect);
        }
        self.end_session("hung up");
    }

    fn send_audio(&mut self, chunk: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.send_audio(chunk) {
            Ok(true) => {}
            Ok(false) => trace!("audio not sent, call not verified"),
            Err(e) => {
                self.fail(e);
            }
        }
    }

    // --- Relayed signals ---

    fn handle_signal(&mut self, msg: SignalingMessage) {
        debug!(from = %msg.from, kind = %msg.kind(), "signal received");
        let from = msg.from;
        match msg.signal {
            Signal::Offer(blob) => {
                let age_ms = now_millis().saturating_sub(msg.timestamp);
                if u128::from(age_ms) > self.config.offer_max_age().as_millis() {
                    warn!(from = %from, age_ms, "stale offer dropped");
                    return;
                }
                self.on_offer(from, blob)
            }
            Signal::Answer(blob) => self.on_answer(&from, blob),
            Signal::Reject => self.on_reject(&from),
            Signal::Disconnect => self.on_disconnect(&from),
        }
    }

    fn on_offer(&mut self, from: String, blob: String) {
        let Some(contact) = self.contacts.get(&from).cloned() else {
            warn!(from = %from, "offer from unknown contact dropped");
            return;
        };
        let mut crossed = false;
        if let Some(current) = self.session.as_ref() {
            if current.contact.id != from {
                info!(from = %from, "busy, rejecting incoming call");
                self.notify(&from, Signal::Reject);
                return;
            }
            // Both sides called each other. The lower id keeps its offer,
            // the other side answers it.
            crossed = current.role == Role::Initiator && current.answer().is_none();
            if !crossed {
                debug!(from = %from, "duplicate offer dropped");
                return;
            }
            if self.identity.id() < from.as_str() {
                debug!(from = %from, "calls crossed, keeping our offer");
                return;
            }
            info!(from = %from, "calls crossed, answering the peer's offer");
            if let Some(mut ours) = self.session.take() {
                ours.close();
            }
        }

        let mut session = Session::new(
            self.identity.clone(),
            contact,
            Role::Responder,
            self.new_bootstrap(),
            SecurityClass::Unknown,
        );
        session.set_offer(blob);
        info!(from = %from, session = %session.id, "incoming call");
        self.begin(session, CallDirection::Incoming);
        if crossed {
            self.accept_incoming();
        }
    }

    fn on_answer(&mut self, from: &str, blob: String) {
        let Some(session) = self.session.as_mut() else {
            debug!(from, "answer without a call dropped");
            return;
        };
        if session.contact.id != from
            || session.role != Role::Initiator
            || session.offer().is_none()
            || session.answer().is_some()
        {
            debug!(from, "unexpected answer dropped");
            return;
        }

        match session.bootstrap.receive_answer(&blob) {
            Ok(()) => {
                session.set_answer(blob);
                self.enter_connecting();
            }
            Err(e) => {
                self.fail(e);
            }
        }
    }

    fn on_reject(&mut self, from: &str) {
        let ringing_out = self.session.as_ref().is_some_and(|s| {
            s.contact.id == from && s.role == Role::Initiator && s.answer().is_none()
        });
        if ringing_out {
            info!(from, "call rejected by peer");
            self.end_session("rejected by peer");
        } else {
            debug!(from, "stray reject dropped");
        }
    }

    fn on_disconnect(&mut self, from: &str) {
        if self.session.as_ref().is_some_and(|s| s.contact.id == from) {
            info!(from, "peer ended the call");
            self.end_session("peer hung up");
        } else {
            debug!(from, "stray disconnect dropped");
        }
    }

    // --- Peer channel ---

    fn handle_channel_event(&mut self, event: BootstrapEvent) {
        match event {
            BootstrapEvent::LocalSignal(blob) => self.on_local_signal(blob),
            BootstrapEvent::Connected => self.on_connected(),
            BootstrapEvent::Data(data) => self.on_data(data),
            BootstrapEvent::Closed => self.on_channel_closed(),
            BootstrapEvent::Error(e) => {
                if self.session.is_some() {
                    self.fail(CallError::Transport(e));
                }
            }
        }
    }

    fn on_local_signal(&mut self, blob: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let peer = session.contact.id.clone();
        let signal = match session.role {
            Role::Initiator if session.offer().is_none() => {
                session.set_offer(blob.clone());
                Signal::Offer(blob)
            }
            Role::Responder if session.answer().is_none() => {
                session.set_answer(blob.clone());
                Signal::Answer(blob)
            }
            _ => {
                debug!("extra local signal ignored");
                return;
            }
        };

        let is_answer = matches!(signal, Signal::Answer(_));
        if let Err(e) = self.send_signal(&peer, signal) {
            self.fail(e);
            return;
        }
        if is_answer {
            self.enter_connecting();
        }
    }

    fn on_connected(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        debug!(session = %session.id, "peer channel connected, starting handshake");
        if let Err(e) = session.begin_handshake() {
            self.fail(e);
        }
    }

    fn on_data(&mut self, data: Vec<u8>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.handle_data(data) {
            Ok(DataOutcome::Verified) => self.on_verified(),
            Ok(DataOutcome::Audio(chunk)) => self.deliver_audio(chunk),
            Ok(DataOutcome::Progress | DataOutcome::Ignored) => {}
            Err(e) => {
                self.fail(e);
            }
        }
    }

    fn on_verified(&mut self) {
        let Some(contact) = self.session.as_ref().map(|s| s.contact.clone()) else {
            return;
        };
        let outcome = match self.trust.pin(&contact) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(e.into());
                return;
            }
        };

        if let Some(session) = self.session.as_mut() {
            session.security = SecurityClass::Secure;
        }
        self.deadline = None;
        info!(
            contact = %contact.id,
            fingerprint = %contact.public_key.fingerprint().short(),
            first_contact = outcome == PinOutcome::Pinned,
            "call connected, peer verified"
        );
        self.state.send_modify(|s| {
            s.status = CallStatus::Connected;
            s.security = Some(SecurityClass::Secure);
            s.verification_failed = false;
            s.failure = None;
        });
    }

    /// Only the peer's `disconnect` ends a verified call cleanly. A bare
    /// close gets a short grace period for that signal to arrive and fails
    /// the call otherwise; before verification it fails at once.
    fn on_channel_closed(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_verified() {
            self.fail(CallError::Transport("peer channel closed".into()));
            return;
        }

        info!(contact = %session.contact.id, "peer channel closed, waiting for disconnect");
        session.close();
        self.relay.poll_now(self.identity.id());
        self.arm(DeadlineKind::PeerLeft, self.config.close_grace());
    }

    fn deliver_audio(&self, chunk: Bytes) {
        match self.audio_out.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => debug!("audio sink full, chunk dropped"),
            Err(mpsc::error::TrySendError::Closed(_)) => trace!("audio sink closed"),
        }
    }

    // --- Timers ---

    fn handle_deadline(&mut self, kind: DeadlineKind) {
        self.deadline = None;
        match kind {
            DeadlineKind::Handshake => {
                if self.session.as_ref().is_some_and(|s| !s.is_verified()) {
                    self.fail(CallError::HandshakeTimeout);
                }
            }
            DeadlineKind::PeerLeft => {
                if self.session.is_some() {
                    self.fail(CallError::Transport("peer channel lost".into()));
                }
            }
            DeadlineKind::FailureReset => {
                let failed = self.state.borrow().status == CallStatus::Failed;
                if failed && self.session.is_none() {
                    debug!("failed call cleared");
                    self.state.send_replace(CallState::default());
                }
            }
        }
    }

    fn arm(&mut self, kind: DeadlineKind, after: Duration) {
        self.deadline = Some(Deadline {
            kind,
            sleep: Box::pin(sleep(after)),
        });
    }

    // --- Transitions ---

    fn begin(&mut self, session: Session, direction: CallDirection) {
        self.deadline = None;
        let peer = CallPeer::from(&session.contact);
        self.session = Some(session);
        self.state.send_replace(CallState {
            status: CallStatus::Ringing,
            contact: Some(peer),
            direction: Some(direction),
            ..CallState::default()
        });
    }

    fn enter_connecting(&mut self) {
        self.arm(DeadlineKind::Handshake, self.config.handshake_timeout());
        self.state.send_modify(|s| s.status = CallStatus::Connecting);
    }

    /// Classify the current contact's key before any channel is opened.
    fn check_trust(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        match self.trust.classify(&session.contact) {
            Ok(SecurityClass::Compromised) => {
                Err(self.fail(VerificationFailure::KeyMismatch.into()))
            }
            Ok(class) => {
                session.security = class;
                self.state.send_modify(|s| s.security = Some(class));
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// End the current session as failed. Returns `err` for the caller.
    fn fail(&mut self, err: CallError) -> CallError {
        let verification_failed = err.is_verification();
        let failure = err.failure().unwrap_or(CallFailure::Transport);
        let mut security = None;

        if let Some(mut session) = self.session.take() {
            if verification_failed {
                session.compromise();
                error!(
                    contact = %session.contact.id,
                    session = %session.id,
                    "peer identity not verified, possible impersonation: {}",
                    err
                );
            } else {
                session.revoke();
                warn!(contact = %session.contact.id, session = %session.id, "call failed: {}", err);
            }
            security = Some(session.security);
            // `disconnect` must not trail the channel close.
            if session.peer_aware() {
                self.notify(&session.contact.id, Signal::Disconnect);
            }
            session.close();
        } else {
            warn!("call failed: {}", err);
        }

        self.state.send_modify(|s| {
            s.status = CallStatus::Failed;
            s.verification_failed = verification_failed;
            s.failure = Some(failure);
            if security.is_some() {
                s.security = security;
            }
        });
        self.arm(DeadlineKind::FailureReset, self.config.failure_linger());
        err
    }

    fn end_session(&mut self, reason: &str) {
        if let Some(mut session) = self.session.take() {
            session.close();
            info!(contact = %session.contact.id, session = %session.id, reason, "call ended");
        }
        self.deadline = None;
        self.state.send_replace(CallState::default());
    }

    // --- Helpers ---

    fn new_bootstrap(&self) -> ConnectionBootstrap {
        ConnectionBootstrap::new(
            self.connector.clone(),
            self.media.clone(),
            self.config.signal_timeout(),
        )
    }

    /// The current peer, if it has seen an offer for this session.
    fn aware_peer(&self) -> Option<String> {
        self.session
            .as_ref()
            .filter(|s| s.peer_aware())
            .map(|s| s.contact.id.clone())
    }

    fn send_signal(&self, to: &str, signal: Signal) -> Result<(), CallError> {
        self.relay
            .send(self.identity.id(), to, signal)
            .map_err(CallError::from)
    }

    /// Best-effort signal; failures are only logged.
    fn notify(&self, to: &str, signal: Signal) {
        let kind = signal.kind();
        if let Err(e) = self.send_signal(to, signal) {
            warn!(to, %kind, "failed to signal peer: {}", e);
        }
    }
}

async fn next_channel_event(session: &mut Option<Session>) -> Option<BootstrapEvent> {
    match session {
        Some(session) if session.bootstrap.has_events() => session.bootstrap.next_event().await,
        _ => pending().await,
    }
}

async fn expire(deadline: &mut Option<Deadline>) -> DeadlineKind {
    match deadline {
        Some(deadline) => {
            deadline.sleep.as_mut().await;
            deadline.kind
        }
        None => pending().await,
    }
}
