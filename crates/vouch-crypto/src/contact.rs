//! Contacts and the out-of-band contact-exchange payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CryptoError;
use crate::identity::{Fingerprint, Identity, PublicKey};

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub public_key: PublicKey,
}

impl Contact {
    pub fn new(id: impl Into<String>, name: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            public_key,
        }
    }

    /// Build a contact from a scanned or pasted payload.
    ///
    /// Accepts a full [`ContactCard`] or a bare exported key; a payload
    /// without an id gets a generated one.
    pub fn from_card(name: impl Into<String>, payload: &str) -> Result<Self, CryptoError> {
        let payload = payload.trim();
        let (id, key) = match serde_json::from_str::<ContactCard>(payload) {
            Ok(card) => (card.id, card.public_key),
            Err(_) => (None, payload.to_string()),
        };

        let public_key = PublicKey::import(&key)?;
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        Ok(Self::new(id, name, public_key))
    }
}

/// Contact-exchange payload, shown as a QR code or copied by hand:
/// `{"id": ..., "publicKey": "<exported key>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactCard {
    #[serde(default)]
    pub id: Option<String>,
    pub public_key: String,
}

impl ContactCard {
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            id: Some(identity.id().to_string()),
            public_key: identity.public_key().export(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Result of adding a contact to the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactChange {
    Added,
    Unchanged,
    /// The id was known with another key. The pin for the old key is left
    /// alone, so the next call with this contact classifies as compromised.
    KeyChanged { previous: Fingerprint },
}

/// The local contact list, keyed by contact id.
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    contacts: HashMap<String, Contact>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, contact: Contact) -> ContactChange {
        let change = match self.contacts.get(&contact.id) {
            None => ContactChange::Added,
            Some(existing) if existing.public_key == contact.public_key => {
                ContactChange::Unchanged
            }
            Some(existing) => ContactChange::KeyChanged {
                previous: existing.public_key.fingerprint(),
            },
        };

        match &change {
            ContactChange::Added => {
                info!(contact = %contact.id, name = %contact.name, "contact added");
            }
            ContactChange::KeyChanged { previous } => {
                warn!(
                    contact = %contact.id,
                    previous = %previous.short(),
                    current = %contact.public_key.fingerprint().short(),
                    "contact re-added with a different key"
                );
            }
            ContactChange::Unchanged => {}
        }

        self.contacts.insert(contact.id.clone(), contact);
        change
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Contact> {
        self.contacts.remove(id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }
}

impl FromIterator<Contact> for ContactBook {
    fn from_iter<I: IntoIterator<Item = Contact>>(iter: I) -> Self {
        let mut book = ContactBook::new();
        for contact in iter {
            book.insert(contact);
        }
        book
    }
}
