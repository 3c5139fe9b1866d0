//! Mailbox-backed signaling relay.
//!
//! Senders append to the recipient's mailbox. Each listening user gets a
//! polling task that drains the mailbox on a fixed period and fans the
//! parsed messages out to its subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use vouch_protocol::codec::{decode_signal, encode_signal};
use vouch_protocol::{Signal, SignalingMessage, UserId};

use crate::error::RelayError;
use crate::mailbox::MailboxStore;

type Subscribers = DashMap<UserId, Vec<mpsc::UnboundedSender<SignalingMessage>>>;

pub struct SignalingRelay {
    store: Arc<dyn MailboxStore>,
    poll_interval: Duration,
    subscribers: Arc<Subscribers>,
    pollers: Mutex<HashMap<UserId, JoinHandle<()>>>,
}

impl SignalingRelay {
    pub fn new(store: Arc<dyn MailboxStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            subscribers: Arc::new(DashMap::new()),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `signal` for `to`. Delivery happens on the recipient's next poll.
    pub fn send(&self, from: &str, to: &str, signal: Signal) -> Result<(), RelayError> {
        let msg = SignalingMessage::new(from, to, signal);
        let raw = encode_signal(&msg)?;
        self.store.append(to, raw)?;
        debug!(from, to, kind = %msg.kind(), "signal queued");
        Ok(())
    }

    /// Subscribe to messages addressed to `user_id` and start polling its
    /// mailbox if nobody is polling it yet. Must be called inside a tokio
    /// runtime.
    pub fn start_listening(&self, user_id: &str) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(user_id.to_string())
            .or_default()
            .push(tx);

        let mut pollers = self.pollers.lock().unwrap_or_else(|p| p.into_inner());
        let running = pollers
            .get(user_id)
            .is_some_and(|task| !task.is_finished());
        if !running {
            let task = tokio::spawn(poll_loop(
                self.store.clone(),
                self.subscribers.clone(),
                user_id.to_string(),
                self.poll_interval,
            ));
            pollers.insert(user_id.to_string(), task);
            info!(user = %user_id, interval_ms = self.poll_interval.as_millis() as u64, "listening for signals");
        }
        rx
    }

    /// Stop polling for `user_id` and drop its subscribers. Calling it for a
    /// user that is not listening is a no-op.
    pub fn stop_listening(&self, user_id: &str) {
        let task = self
            .pollers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(user_id);
        self.subscribers.remove(user_id);
        if let Some(task) = task {
            task.abort();
            info!(user = %user_id, "stopped listening for signals");
        }
    }

    pub fn is_listening(&self, user_id: &str) -> bool {
        self.pollers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(user_id)
            .is_some_and(|task| !task.is_finished())
    }

    /// Drain `user_id`'s mailbox immediately. Returns the number of
    /// messages delivered.
    pub fn poll_now(&self, user_id: &str) -> usize {
        pump(self.store.as_ref(), &self.subscribers, user_id)
    }
}

impl Drop for SignalingRelay {
    fn drop(&mut self) {
        let pollers = self.pollers.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, task) in pollers.drain() {
            task.abort();
        }
    }
}

async fn poll_loop(
    store: Arc<dyn MailboxStore>,
    subscribers: Arc<Subscribers>,
    user_id: UserId,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        pump(store.as_ref(), &subscribers, &user_id);
    }
}

/// One poll cycle. Leaves the mailbox alone while nobody is subscribed so
/// messages wait for the next listener instead of being lost.
fn pump(store: &dyn MailboxStore, subscribers: &Subscribers, user_id: &str) -> usize {
    let has_subscribers = subscribers
        .get_mut(user_id)
        .map(|mut subs| {
            subs.retain(|tx| !tx.is_closed());
            !subs.is_empty()
        })
        .unwrap_or(false);
    if !has_subscribers {
        return 0;
    }

    let entries = match store.drain(user_id) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(user = %user_id, "mailbox poll failed: {}", e);
            return 0;
        }
    };

    let mut delivered = 0;
    for raw in entries {
        let msg = match decode_signal(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(user = %user_id, "dropping malformed signaling message: {}", e);
                continue;
            }
        };
        if msg.to != user_id {
            warn!(user = %user_id, to = %msg.to, "dropping misrouted signaling message");
            continue;
        }
        trace!(user = %user_id, from = %msg.from, kind = %msg.kind(), "signal delivered");
        if let Some(mut subs) = subscribers.get_mut(user_id) {
            subs.retain(|tx| tx.send(msg.clone()).is_ok());
        }
        delivered += 1;
    }
    delivered
}
