//! In-process call between two local users, signaling through the
//! directory mailbox and pinning keys in the configured pin file.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use vouch_core::{
    CallDeps, CallHandle, CallService, CallState, CallStatus, DirMailboxStore, LoopbackNetwork,
    MediaSlot, NullMedia, SignalingRelay,
};
use vouch_crypto::{Contact, ContactBook, FileKeyStore, Identity, KeyStore, TrustStore};

use crate::config::CliConfig;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

struct User {
    name: &'static str,
    identity: Arc<Identity>,
    handle: CallHandle,
    audio: mpsc::Receiver<Bytes>,
    watcher: JoinHandle<()>,
}

pub async fn run(config: &CliConfig, impersonate: bool, chunks: u32) -> Result<()> {
    let mailbox_dir = config.mailbox_dir();
    let relay = Arc::new(SignalingRelay::new(
        Arc::new(DirMailboxStore::new(&mailbox_dir)),
        config.call.poll_interval(),
    ));
    let network = LoopbackNetwork::new();
    let pins: Arc<dyn KeyStore> = Arc::new(FileKeyStore::new(config.pins_file()));

    // Keys are per run but the pin file persists, so ids are per run too.
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let alice_id = Arc::new(Identity::generate(format!("alice-{}", &run_id[..8]))?);
    let bob_id = Arc::new(Identity::generate(format!("bob-{}", &run_id[..8]))?);
    info!(alice = %alice_id.id(), bob = %bob_id.id(), mailbox_dir = %mailbox_dir.display(), "starting simulation");

    let spawn = |name: &'static str, identity: &Arc<Identity>, peer: &Identity| {
        let deps = CallDeps {
            identity: identity.clone(),
            contacts: [contact_for(peer)].into_iter().collect::<ContactBook>(),
            relay: relay.clone(),
            connector: Arc::new(network.clone()),
            media: MediaSlot::new(Arc::new(NullMedia)),
            trust: Arc::new(TrustStore::new(pins.clone())),
        };
        let (handle, audio) = CallService::spawn(deps, config.call.clone());
        User {
            name,
            identity: identity.clone(),
            watcher: watch_transitions(name, &handle),
            handle,
            audio,
        }
    };
    let mut alice = spawn("alice", &alice_id, &bob_id);
    let mut bob = spawn("bob", &bob_id, &alice_id);

    // ── Verified call ──
    establish(&alice, &bob).await?;
    exchange_audio(&mut alice, &mut bob, chunks).await?;
    exchange_audio(&mut bob, &mut alice, chunks).await?;
    alice.handle.hang_up().await?;
    wait_status(&alice, CallStatus::Idle).await?;
    wait_status(&bob, CallStatus::Idle).await?;
    println!("call finished, keys pinned in {}", config.pins_file().display());

    if impersonate {
        impersonation(&alice, &bob).await?;
    }

    for user in [&alice, &bob] {
        user.handle.shutdown().await;
    }
    for user in [alice, bob] {
        user.watcher.abort();
    }
    Ok(())
}

/// Bob's contact entry for alice is replaced with an attacker's key; the
/// next call must fail verification and leave the pin alone.
async fn impersonation(alice: &User, bob: &User) -> Result<()> {
    let mallory = Identity::generate(alice.identity.id())?;
    let forged = Contact::new(alice.identity.id(), "alice", mallory.public_key().clone());
    println!(
        "bob: contact {} now carries key {}",
        forged.id,
        forged.public_key.fingerprint().short()
    );
    bob.handle.add_contact(forged).await?;

    alice.handle.call(bob.identity.id()).await?;
    wait_status(bob, CallStatus::Ringing).await?;
    bob.handle.accept().await?;

    let failed = tokio::time::timeout(
        STEP_TIMEOUT,
        bob.handle
            .wait_for(|s| matches!(s.status, CallStatus::Failed | CallStatus::Connected)),
    )
    .await
    .context("bob never finished the handshake")??;
    if failed.status == CallStatus::Connected || !failed.verification_failed {
        bail!("impersonated call was not rejected: {failed:?}");
    }
    println!("bob: impersonation detected, call refused");

    wait_status(alice, CallStatus::Idle).await?;
    wait_status(bob, CallStatus::Idle).await?;
    Ok(())
}

async fn establish(caller: &User, callee: &User) -> Result<()> {
    caller.handle.call(callee.identity.id()).await?;
    wait_status(callee, CallStatus::Ringing).await?;
    callee.handle.accept().await?;
    wait_status(caller, CallStatus::Connected).await?;
    wait_status(callee, CallStatus::Connected).await?;
    Ok(())
}

async fn exchange_audio(from: &mut User, to: &mut User, chunks: u32) -> Result<()> {
    for n in 0..chunks {
        let chunk = Bytes::from(format!("{} chunk {n}", from.name));
        from.handle.send_audio(chunk).await?;
    }
    for _ in 0..chunks {
        let chunk = tokio::time::timeout(STEP_TIMEOUT, to.audio.recv())
            .await
            .with_context(|| format!("{} received no audio", to.name))?
            .with_context(|| format!("{} audio stream ended", to.name))?;
        println!("{}: heard {:?}", to.name, String::from_utf8_lossy(&chunk));
    }
    Ok(())
}

async fn wait_status(user: &User, status: CallStatus) -> Result<CallState> {
    let state = tokio::time::timeout(STEP_TIMEOUT, user.handle.wait_for(|s| s.status == status))
        .await
        .with_context(|| format!("{} did not reach {status:?}", user.name))??;
    Ok(state)
}

fn watch_transitions(name: &'static str, handle: &CallHandle) -> JoinHandle<()> {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            println!("{name}: {}", describe(&state));
        }
    })
}

fn describe(state: &CallState) -> String {
    let mut line = format!("{:?}", state.status).to_lowercase();
    if let Some(peer) = &state.contact {
        line.push_str(&format!(" with {}", peer.id));
    }
    if let Some(security) = state.security {
        line.push_str(&format!(" [{security:?}]").to_lowercase());
    }
    if let Some(failure) = state.failure {
        line.push_str(&format!(" failure={failure:?}"));
    }
    if state.verification_failed {
        line.push_str(" (verification failed)");
    }
    line
}

fn contact_for(identity: &Identity) -> Contact {
    Contact::new(identity.id(), identity.id(), identity.public_key().clone())
}
