use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Call runtime tuning, usually loaded as the `[call]` table of the CLI
/// config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How often the signaling mailbox is drained.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time allowed from `Connecting` to a verified handshake.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// How long `Failed` stays visible before reverting to `Idle`.
    #[serde(default = "default_failure_linger_ms")]
    pub failure_linger_ms: u64,

    /// Time allowed for the peer channel to produce its local signal.
    #[serde(default = "default_signal_timeout_secs")]
    pub signal_timeout_secs: u64,

    /// How long a verified call waits for the peer's `disconnect` after the
    /// peer channel closes before treating the close as a failure.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// Offers older than this are stale and never ring.
    #[serde(default = "default_offer_max_age_secs")]
    pub offer_max_age_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

fn default_failure_linger_ms() -> u64 {
    3000
}

fn default_signal_timeout_secs() -> u64 {
    10
}

fn default_close_grace_ms() -> u64 {
    2000
}

fn default_offer_max_age_secs() -> u64 {
    30
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            failure_linger_ms: default_failure_linger_ms(),
            signal_timeout_secs: default_signal_timeout_secs(),
            close_grace_ms: default_close_grace_ms(),
            offer_max_age_secs: default_offer_max_age_secs(),
        }
    }
}

impl CallConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn failure_linger(&self) -> Duration {
        Duration::from_millis(self.failure_linger_ms)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_secs(self.signal_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn offer_max_age(&self) -> Duration {
        Duration::from_secs(self.offer_max_age_secs)
    }
}
