use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ChannelError;

/// The local capture device (microphone) backing a call.
pub trait MediaDevice: Send + Sync {
    fn start(&self) -> Result<(), String>;
    fn stop(&self);
}

/// A device that does nothing, for headless runs.
#[derive(Debug, Default)]
pub struct NullMedia;

impl MediaDevice for NullMedia {
    fn start(&self) -> Result<(), String> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Exclusive access to one media device. At most one lease is live at a
/// time; the device is stopped when the lease is released or dropped.
#[derive(Clone)]
pub struct MediaSlot {
    device: Arc<dyn MediaDevice>,
    in_use: Arc<AtomicBool>,
}

impl MediaSlot {
    pub fn new(device: Arc<dyn MediaDevice>) -> Self {
        Self {
            device,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn acquire(&self) -> Result<MediaLease, ChannelError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChannelError::Init("media device already in use".into()));
        }
        if let Err(e) = self.device.start() {
            self.in_use.store(false, Ordering::Release);
            warn!("media device failed to start: {}", e);
            return Err(ChannelError::Init(format!("media device unavailable: {e}")));
        }
        debug!("media device started");
        Ok(MediaLease {
            device: self.device.clone(),
            in_use: self.in_use.clone(),
            released: false,
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

pub struct MediaLease {
    device: Arc<dyn MediaDevice>,
    in_use: Arc<AtomicBool>,
    released: bool,
}

impl MediaLease {
    /// Stop the device. Only the first call has an effect.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.device.stop();
        self.in_use.store(false, Ordering::Release);
        debug!("media device stopped");
    }
}

impl Drop for MediaLease {
    fn drop(&mut self) {
        self.release();
    }
}
