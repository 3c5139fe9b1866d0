//! Trust-on-first-use pinning of contact keys.
//!
//! The first verified session with a contact pins the key it presented.
//! Later sessions compare against that record; a different key is a
//! security event and the record is never overwritten here. Replacing a
//! pin needs an explicit out-of-band decision by the user.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contact::Contact;
use crate::error::{StoreError, TrustError};
use crate::identity::{Fingerprint, PublicKey};
use crate::stores::KeyStore;

/// How far a contact's current key can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityClass {
    /// No pin yet; the first verified session will create one.
    Unknown,
    /// Pinned and matching.
    Secure,
    /// Pinned to a different key (possible impersonation).
    Compromised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    Pinned,
    AlreadyPinned,
}

pub struct TrustStore {
    store: Arc<dyn KeyStore>,
    /// Serializes classify-then-write in `pin`.
    pin_lock: Mutex<()>,
}

impl TrustStore {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            pin_lock: Mutex::new(()),
        }
    }

    pub fn classify(&self, contact: &Contact) -> Result<SecurityClass, StoreError> {
        let class = match self.store.get(&contact.id)? {
            None => SecurityClass::Unknown,
            Some(record) => compare(&contact.id, &record, &contact.public_key),
        };
        if class == SecurityClass::Compromised {
            warn!(contact = %contact.id, "pinned key does not match the contact's key");
        }
        Ok(class)
    }

    /// Pin the contact's key. Call only after the handshake verified.
    ///
    /// Writes when no record exists, does nothing when the record already
    /// matches, and fails with [`TrustError::Mismatch`] otherwise.
    pub fn pin(&self, contact: &Contact) -> Result<PinOutcome, TrustError> {
        let _guard = self.pin_lock.lock().unwrap_or_else(|p| {
            warn!("pin lock poisoned, recovering");
            p.into_inner()
        });

        match self.classify(contact)? {
            SecurityClass::Unknown => {
                self.store.put(&contact.id, &contact.public_key.export())?;
                info!(
                    contact = %contact.id,
                    fingerprint = %contact.public_key.fingerprint().short(),
                    "pinned key on first verified session"
                );
                Ok(PinOutcome::Pinned)
            }
            SecurityClass::Secure => Ok(PinOutcome::AlreadyPinned),
            SecurityClass::Compromised => Err(TrustError::Mismatch {
                contact_id: contact.id.clone(),
            }),
        }
    }

    /// All pin records with their fingerprints (`None` for unreadable records).
    pub fn pins(&self) -> Result<Vec<(String, Option<Fingerprint>)>, StoreError> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .map(|(id, record)| {
                let fingerprint = PublicKey::import(&record).ok().map(|k| k.fingerprint());
                (id, fingerprint)
            })
            .collect())
    }
}

/// An unreadable record is treated as a mismatch.
fn compare(contact_id: &str, record: &str, current: &PublicKey) -> SecurityClass {
    match PublicKey::import(record) {
        Ok(pinned) if pinned.fingerprint() == current.fingerprint() => SecurityClass::Secure,
        Ok(_) => SecurityClass::Compromised,
        Err(e) => {
            warn!(contact = %contact_id, "unreadable pin record: {}", e);
            SecurityClass::Compromised
        }
    }
}
