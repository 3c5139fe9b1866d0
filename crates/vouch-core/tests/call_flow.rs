//! End-to-end call scenarios: two call services signaling through one
//! mailbox store and connected through the loopback network.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use vouch_core::transport::EventSender;
use vouch_core::{
    CallConfig, CallDeps, CallDirection, CallFailure, CallHandle, CallService, CallState,
    CallStatus, ChannelError, ChannelEvent, LoopbackNetwork, MailboxStore, MediaSlot,
    MemoryMailboxStore, NullMedia, PeerChannel, PeerConnector, SignalingRelay,
};
use vouch_crypto::{
    Contact, ContactBook, ContactChange, Identity, KeyStore, MemoryKeyStore, SecurityClass,
    StoreError, TrustStore,
};
use vouch_protocol::codec::encode_signal;
use vouch_protocol::{Role, Signal, SignalingMessage};

struct Net {
    store: Arc<MemoryMailboxStore>,
    relay: Arc<SignalingRelay>,
    network: LoopbackNetwork,
}

impl Net {
    fn new() -> Self {
        let store = Arc::new(MemoryMailboxStore::new());
        Self {
            relay: Arc::new(SignalingRelay::new(
                store.clone(),
                Duration::from_millis(1000),
            )),
            store,
            network: LoopbackNetwork::new(),
        }
    }
}

/// Loopback connector that keeps a copy of every channel's event sender,
/// so a test can inject transport events.
struct TappedNetwork {
    inner: LoopbackNetwork,
    taps: Arc<Mutex<Vec<EventSender>>>,
}

impl PeerConnector for TappedNetwork {
    fn open(&self, role: Role, events: EventSender) -> Result<Box<dyn PeerChannel>, ChannelError> {
        self.taps.lock().unwrap().push(events.clone());
        self.inner.open(role, events)
    }
}

/// Pin store that reads fine but cannot write.
struct ReadOnlyPins;

impl KeyStore for ReadOnlyPins {
    fn get(&self, _contact_id: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn put(&self, _contact_id: &str, _exported_key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    fn entries(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(Vec::new())
    }
}

struct Peer {
    handle: CallHandle,
    audio: mpsc::Receiver<Bytes>,
    pins: Arc<dyn KeyStore>,
}

fn contact(identity: &Identity) -> Contact {
    Contact::new(identity.id(), identity.id(), identity.public_key().clone())
}

fn spawn_peer(net: &Net, identity: Arc<Identity>, contacts: Vec<Contact>) -> Peer {
    spawn_peer_with(
        net,
        identity,
        contacts,
        Arc::new(net.network.clone()),
        Arc::new(MemoryKeyStore::new()),
    )
}

fn spawn_peer_with(
    net: &Net,
    identity: Arc<Identity>,
    contacts: Vec<Contact>,
    connector: Arc<dyn PeerConnector>,
    pins: Arc<dyn KeyStore>,
) -> Peer {
    let deps = CallDeps {
        identity,
        contacts: contacts.into_iter().collect::<ContactBook>(),
        relay: net.relay.clone(),
        connector,
        media: MediaSlot::new(Arc::new(NullMedia)),
        trust: Arc::new(TrustStore::new(pins.clone())),
    };
    let (handle, audio) = CallService::spawn(deps, CallConfig::default());
    Peer {
        handle,
        audio,
        pins,
    }
}

async fn wait_status(peer: &Peer, status: CallStatus) -> CallState {
    tokio::time::timeout(
        Duration::from_secs(60),
        peer.handle.wait_for(|s| s.status == status),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {status:?}, state {:?}", peer.handle.state()))
    .unwrap()
}

struct Pair {
    alice_id: Arc<Identity>,
    bob_id: Arc<Identity>,
    alice: Peer,
    bob: Peer,
}

fn pair(net: &Net, bob_sees_alice_as: Option<&Identity>) -> Pair {
    let alice_id = Arc::new(Identity::generate("alice").unwrap());
    let bob_id = Arc::new(Identity::generate("bob").unwrap());
    let alice_for_bob = match bob_sees_alice_as {
        Some(key) => Contact::new("alice", "alice", key.public_key().clone()),
        None => contact(&alice_id),
    };
    Pair {
        alice: spawn_peer(net, alice_id.clone(), vec![contact(&bob_id)]),
        bob: spawn_peer(net, bob_id.clone(), vec![alice_for_bob]),
        alice_id,
        bob_id,
    }
}

async fn connect(pair: &Pair) {
    establish(&pair.alice, &pair.bob).await;
}

/// `alice` calls `bob`, who accepts; both must verify.
async fn establish(alice: &Peer, bob: &Peer) {
    alice.handle.call("bob").await.unwrap();
    let ringing = wait_status(bob, CallStatus::Ringing).await;
    assert_eq!(ringing.contact.as_ref().unwrap().id, "alice");
    bob.handle.accept().await.unwrap();

    wait_status(alice, CallStatus::Connected).await;
    wait_status(bob, CallStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn verified_call_carries_audio_both_ways() {
    let net = Net::new();
    let mut pair = pair(&net, None);
    connect(&pair).await;

    for peer in [&pair.alice, &pair.bob] {
        let state = peer.handle.state();
        assert_eq!(state.security, Some(SecurityClass::Secure));
        assert!(!state.verification_failed);
        assert!(state.failure.is_none());
    }
    assert!(pair.alice.pins.get("bob").unwrap().is_some());
    assert!(pair.bob.pins.get("alice").unwrap().is_some());

    pair.alice
        .handle
        .send_audio(Bytes::from_static(b"hello bob"))
        .await
        .unwrap();
    pair.bob
        .handle
        .send_audio(Bytes::from_static(b"hi alice"))
        .await
        .unwrap();
    assert_eq!(pair.bob.audio.recv().await.unwrap(), Bytes::from_static(b"hello bob"));
    assert_eq!(pair.alice.audio.recv().await.unwrap(), Bytes::from_static(b"hi alice"));

    pair.alice.handle.hang_up().await.unwrap();
    wait_status(&pair.alice, CallStatus::Idle).await;
    wait_status(&pair.bob, CallStatus::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn swapped_key_after_pin_is_compromised() {
    let net = Net::new();
    let pair = pair(&net, None);
    connect(&pair).await;
    pair.alice.handle.hang_up().await.unwrap();
    wait_status(&pair.bob, CallStatus::Idle).await;

    // Bob's contact entry for alice now carries someone else's key.
    let mallory = Identity::generate("alice").unwrap();
    let change = pair
        .bob
        .handle
        .add_contact(Contact::new("alice", "alice", mallory.public_key().clone()))
        .await
        .unwrap();
    assert!(matches!(change, ContactChange::KeyChanged { .. }));

    pair.alice.handle.call("bob").await.unwrap();
    wait_status(&pair.bob, CallStatus::Ringing).await;
    pair.bob.handle.accept().await.unwrap();

    let failed = wait_status(&pair.bob, CallStatus::Failed).await;
    assert!(failed.verification_failed);
    assert_eq!(failed.security, Some(SecurityClass::Compromised));
    assert_eq!(failed.failure, Some(CallFailure::Verification));

    // Alice is told the call is over and the old pin is untouched.
    wait_status(&pair.alice, CallStatus::Idle).await;
    let pinned = pair.bob.pins.get("alice").unwrap().unwrap();
    assert_eq!(pinned, pair.alice_id.public_key().export());

    // The failure clears after the linger period.
    wait_status(&pair.bob, CallStatus::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn wrong_key_without_pin_fails_the_handshake() {
    let net = Net::new();
    let mallory = Identity::generate("alice").unwrap();
    let mut pair = pair(&net, Some(&mallory));

    pair.alice.handle.call("bob").await.unwrap();
    wait_status(&pair.bob, CallStatus::Ringing).await;
    pair.bob.handle.accept().await.unwrap();

    let failed = wait_status(&pair.bob, CallStatus::Failed).await;
    assert!(failed.verification_failed);
    assert_eq!(failed.security, Some(SecurityClass::Compromised));
    assert!(pair.bob.pins.get("alice").unwrap().is_none());

    // Alice never reaches Connected and nothing was delivered to bob.
    let alice_state = wait_status(&pair.alice, CallStatus::Failed).await;
    assert!(!alice_state.verification_failed);
    assert!(pair.bob.audio.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn rejected_call_returns_both_to_idle() {
    let net = Net::new();
    let pair = pair(&net, None);

    pair.alice.handle.call("bob").await.unwrap();
    wait_status(&pair.bob, CallStatus::Ringing).await;
    pair.bob.handle.reject().await.unwrap();

    assert_eq!(wait_status(&pair.bob, CallStatus::Idle).await, CallState::default());
    wait_status(&pair.alice, CallStatus::Idle).await;
    assert!(pair.alice.pins.get("bob").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn caller_hang_up_while_ringing_clears_callee() {
    let net = Net::new();
    let pair = pair(&net, None);

    pair.alice.handle.call("bob").await.unwrap();
    wait_status(&pair.bob, CallStatus::Ringing).await;
    pair.alice.handle.hang_up().await.unwrap();
    wait_status(&pair.bob, CallStatus::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn busy_callee_rejects_second_caller() {
    let net = Net::new();
    let pair = pair(&net, None);
    let carol_id = Arc::new(Identity::generate("carol").unwrap());
    let carol = spawn_peer(&net, carol_id.clone(), vec![contact(&pair.bob_id)]);
    pair.bob.handle.add_contact(contact(&carol_id)).await.unwrap();

    connect(&pair).await;
    carol.handle.call("bob").await.unwrap();
    assert_eq!(carol.handle.state().status, CallStatus::Ringing);

    wait_status(&carol, CallStatus::Idle).await;
    assert_eq!(pair.bob.handle.state().status, CallStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn offers_from_strangers_are_ignored() {
    let net = Net::new();
    let bob_id = Arc::new(Identity::generate("bob").unwrap());
    let bob = spawn_peer(&net, bob_id, vec![]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _channel = net.network.open(Role::Initiator, tx).unwrap();
    let Some(ChannelEvent::Signal(offer)) = rx.recv().await else {
        panic!("loopback initiator must emit an offer");
    };
    net.relay.send("stranger", "bob", Signal::Offer(offer)).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(bob.handle.state().status, CallStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_without_verification_failure() {
    let net = Net::new();
    let alice_id = Arc::new(Identity::generate("alice").unwrap());
    let bob_id = Identity::generate("bob").unwrap();
    let alice = spawn_peer(&net, alice_id, vec![contact(&bob_id)]);

    // Play bob by hand: answer the offer but never respond to the challenge.
    let mut bob_signals = net.relay.start_listening("bob");
    alice.handle.call("bob").await.unwrap();
    let offer = match bob_signals.recv().await.unwrap().signal {
        Signal::Offer(blob) => blob,
        other => panic!("expected offer, got {other:?}"),
    };
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut bob_channel = net.network.open(Role::Responder, tx).unwrap();
    bob_channel.signal(&offer).unwrap();
    let Some(ChannelEvent::Signal(answer)) = events.recv().await else {
        panic!("loopback responder must emit an answer");
    };
    net.relay.send("bob", "alice", Signal::Answer(answer)).unwrap();

    wait_status(&alice, CallStatus::Connecting).await;
    let failed = wait_status(&alice, CallStatus::Failed).await;
    assert_eq!(failed.failure, Some(CallFailure::Timeout));
    assert!(!failed.verification_failed);

    wait_status(&alice, CallStatus::Idle).await;
    drop(bob_channel);
}

#[tokio::test(start_paused = true)]
async fn channel_drop_without_disconnect_fails_the_call() {
    let net = Net::new();
    let alice_id = Arc::new(Identity::generate("alice").unwrap());
    let bob_id = Arc::new(Identity::generate("bob").unwrap());
    let taps = Arc::new(Mutex::new(Vec::new()));
    let tapped = TappedNetwork {
        inner: net.network.clone(),
        taps: taps.clone(),
    };
    let alice = spawn_peer_with(
        &net,
        alice_id.clone(),
        vec![contact(&bob_id)],
        Arc::new(tapped),
        Arc::new(MemoryKeyStore::new()),
    );
    let bob = spawn_peer(&net, bob_id, vec![contact(&alice_id)]);
    establish(&alice, &bob).await;

    // The transport goes away without the peer ever saying goodbye.
    let tap = taps.lock().unwrap().last().cloned().unwrap();
    tap.send(ChannelEvent::Closed).unwrap();

    let failed = wait_status(&alice, CallStatus::Failed).await;
    assert_eq!(failed.failure, Some(CallFailure::Transport));
    assert!(!failed.verification_failed);

    wait_status(&bob, CallStatus::Idle).await;
    wait_status(&alice, CallStatus::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn crossed_calls_settle_on_one_session() {
    let net = Net::new();
    let mut pair = pair(&net, None);

    pair.alice.handle.call("bob").await.unwrap();
    pair.bob.handle.call("alice").await.unwrap();

    // "alice" sorts first, so her offer wins and bob answers it.
    let alice = wait_status(&pair.alice, CallStatus::Connected).await;
    let bob = wait_status(&pair.bob, CallStatus::Connected).await;
    assert_eq!(alice.direction, Some(CallDirection::Outgoing));
    assert_eq!(bob.direction, Some(CallDirection::Incoming));
    assert_eq!(bob.security, Some(SecurityClass::Secure));

    pair.bob
        .handle
        .send_audio(Bytes::from_static(b"we both called"))
        .await
        .unwrap();
    assert_eq!(
        pair.alice.audio.recv().await.unwrap(),
        Bytes::from_static(b"we both called")
    );
}

#[tokio::test(start_paused = true)]
async fn pin_store_failure_fails_closed_without_blaming_the_peer() {
    let net = Net::new();
    let alice_id = Arc::new(Identity::generate("alice").unwrap());
    let bob_id = Arc::new(Identity::generate("bob").unwrap());
    let alice = spawn_peer(&net, alice_id.clone(), vec![contact(&bob_id)]);
    let mut bob = spawn_peer_with(
        &net,
        bob_id,
        vec![contact(&alice_id)],
        Arc::new(net.network.clone()),
        Arc::new(ReadOnlyPins),
    );

    alice.handle.call("bob").await.unwrap();
    wait_status(&bob, CallStatus::Ringing).await;
    bob.handle.accept().await.unwrap();

    let failed = wait_status(&bob, CallStatus::Failed).await;
    assert_eq!(failed.failure, Some(CallFailure::Storage));
    assert!(!failed.verification_failed);
    assert_ne!(failed.security, Some(SecurityClass::Compromised));
    assert!(bob.audio.try_recv().is_err());

    wait_status(&alice, CallStatus::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn stale_offer_does_not_ring() {
    let net = Net::new();
    let pair = pair(&net, None);

    let mut old = SignalingMessage::new("alice", "bob", Signal::Offer("left-over".into()));
    old.timestamp -= 10 * 60 * 1000;
    net.store.append("bob", encode_signal(&old).unwrap()).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pair.bob.handle.state().status, CallStatus::Idle);

    // A live offer still gets through.
    pair.alice.handle.call("bob").await.unwrap();
    wait_status(&pair.bob, CallStatus::Ringing).await;
}
