//! Vouch call runtime: signaling, connection bootstrap, identity
//! handshake and the call state machine.

pub mod audio;
pub mod bootstrap;
pub mod call;
pub mod config;
pub mod error;
pub mod handshake;
pub mod loopback;
pub mod mailbox;
pub mod media;
pub mod relay;
pub mod session;
pub mod transport;

pub use bootstrap::{BootstrapEvent, ConnectionBootstrap};
pub use call::{CallDeps, CallDirection, CallHandle, CallPeer, CallService, CallState, CallStatus};
pub use config::CallConfig;
pub use error::{CallError, CallFailure, ChannelError, RelayError, VerificationFailure};
pub use loopback::LoopbackNetwork;
pub use mailbox::{DirMailboxStore, MailboxStore, MemoryMailboxStore};
pub use media::{MediaDevice, MediaLease, MediaSlot, NullMedia};
pub use relay::SignalingRelay;
pub use transport::{ChannelEvent, PeerChannel, PeerConnector};
