//! Per-recipient mailboxes backing the signaling relay.
//!
//! A mailbox is an append-only queue of encoded signaling messages.
//! `drain` hands back everything queued so far and empties the box, so a
//! message is delivered at most once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::RelayError;

pub trait MailboxStore: Send + Sync {
    fn append(&self, recipient: &str, entry: String) -> Result<(), RelayError>;

    /// Remove and return all queued entries in append order.
    fn drain(&self, recipient: &str) -> Result<Vec<String>, RelayError>;
}

#[derive(Default)]
pub struct MemoryMailboxStore {
    boxes: DashMap<String, Vec<String>>,
}

impl MemoryMailboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, recipient: &str) -> usize {
        self.boxes.get(recipient).map_or(0, |b| b.len())
    }
}

impl MailboxStore for MemoryMailboxStore {
    fn append(&self, recipient: &str, entry: String) -> Result<(), RelayError> {
        self.boxes
            .entry(recipient.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    fn drain(&self, recipient: &str) -> Result<Vec<String>, RelayError> {
        Ok(self
            .boxes
            .remove(recipient)
            .map(|(_, entries)| entries)
            .unwrap_or_default())
    }
}

/// Mailboxes as directories, one file per message.
///
/// Lets two `vouch` processes on one machine signal each other through a
/// shared directory. File names sort in append order; drained files are
/// claimed by renaming before they are read, so concurrent drainers never
/// deliver the same message twice.
pub struct DirMailboxStore {
    root: PathBuf,
    /// Last name prefix handed out; prefixes only move forward.
    last_stamp: AtomicU64,
}

const ENTRY_EXT: &str = "json";

impl DirMailboxStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_stamp: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// User ids are opaque, so directory names are hex-encoded.
    fn mailbox_dir(&self, recipient: &str) -> PathBuf {
        let name: String = recipient.bytes().map(|b| format!("{b:02x}")).collect();
        self.root.join(format!("u-{name}"))
    }

    /// Wall-clock nanoseconds, bumped past the previous stamp so a clock
    /// step backwards cannot reorder this sender's entries.
    fn next_stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let prev = self
            .last_stamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }

    fn entry_name(&self) -> String {
        format!(
            "{:020}-{}.{ENTRY_EXT}",
            self.next_stamp(),
            uuid::Uuid::new_v4().simple()
        )
    }
}

fn unavailable(what: &str, path: &Path, e: std::io::Error) -> RelayError {
    RelayError::StorageUnavailable(format!("failed to {what} {}: {e}", path.display()))
}

impl MailboxStore for DirMailboxStore {
    fn append(&self, recipient: &str, entry: String) -> Result<(), RelayError> {
        let dir = self.mailbox_dir(recipient);
        std::fs::create_dir_all(&dir).map_err(|e| unavailable("create", &dir, e))?;

        let name = self.entry_name();
        let tmp_path = dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp_path, entry).map_err(|e| unavailable("write", &tmp_path, e))?;
        let path = dir.join(&name);
        std::fs::rename(&tmp_path, &path).map_err(|e| unavailable("rename", &tmp_path, e))?;
        debug!(recipient, entry = %name, "mailbox entry written");
        Ok(())
    }

    fn drain(&self, recipient: &str) -> Result<Vec<String>, RelayError> {
        let dir = self.mailbox_dir(recipient);
        let listing = match std::fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable("list", &dir, e)),
        };

        let mut names: Vec<String> = listing
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.') && name.ends_with(ENTRY_EXT))
            .collect();
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(&name);
            let claimed = dir.join(format!(".{name}.claimed"));
            if std::fs::rename(&path, &claimed).is_err() {
                // Claimed by another drainer.
                continue;
            }
            match std::fs::read_to_string(&claimed) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(recipient, entry = %name, "unreadable mailbox entry dropped: {}", e),
            }
            if let Err(e) = std::fs::remove_file(&claimed) {
                warn!(path = %claimed.display(), "failed to remove drained entry: {}", e);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_drain_returns_fifo_and_empties() {
        let store = MemoryMailboxStore::new();
        store.append("bob", "1".into()).unwrap();
        store.append("bob", "2".into()).unwrap();
        store.append("carol", "x".into()).unwrap();
        assert_eq!(store.pending("bob"), 2);

        assert_eq!(store.drain("bob").unwrap(), vec!["1", "2"]);
        assert!(store.drain("bob").unwrap().is_empty());
        assert_eq!(store.pending("carol"), 1);
    }

    #[test]
    fn dir_drain_returns_fifo_and_empties() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirMailboxStore::new(dir.path());
        for i in 0..5 {
            store.append("bob", format!("msg-{i}")).unwrap();
        }
        store.append("carol", "other".into()).unwrap();

        let drained = store.drain("bob").unwrap();
        assert_eq!(drained, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
        assert!(store.drain("bob").unwrap().is_empty());
        assert_eq!(store.drain("carol").unwrap(), vec!["other"]);
    }

    #[test]
    fn dir_order_survives_clock_going_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirMailboxStore::new(dir.path());
        store.append("bob", "before".into()).unwrap();

        // Pretend the last entry was stamped far in the future.
        let ahead = store.last_stamp.load(Ordering::Acquire) + 3_600_000_000_000;
        store.last_stamp.store(ahead, Ordering::Release);
        store.append("bob", "first".into()).unwrap();
        store.append("bob", "second".into()).unwrap();

        assert_eq!(store.drain("bob").unwrap(), vec!["before", "first", "second"]);
        assert!(store.last_stamp.load(Ordering::Acquire) > ahead);
    }

    #[test]
    fn dir_missing_mailbox_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirMailboxStore::new(dir.path().join("not-created"));
        assert!(store.drain("bob").unwrap().is_empty());
    }

    #[test]
    fn dir_store_is_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        DirMailboxStore::new(dir.path())
            .append("bob", "hello".into())
            .unwrap();
        let other = DirMailboxStore::new(dir.path());
        assert_eq!(other.drain("bob").unwrap(), vec!["hello"]);
    }

    #[test]
    fn dir_names_are_safe_for_odd_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirMailboxStore::new(dir.path());
        store.append("../escape", "x".into()).unwrap();
        let mailbox = store.mailbox_dir("../escape");
        assert!(mailbox.starts_with(dir.path()));
        assert_eq!(store.drain("../escape").unwrap(), vec!["x"]);
    }

    #[test]
    fn dir_ignores_leftover_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirMailboxStore::new(dir.path());
        store.append("bob", "real".into()).unwrap();
        std::fs::write(store.mailbox_dir("bob").join(".partial.json.tmp"), "half").unwrap();
        assert_eq!(store.drain("bob").unwrap(), vec!["real"]);
    }
}
