//! Durable purge queue
//!
//! Scheduled key deletions are queue entries rather than in-process timers,
//! so a restart does not lose them. Each entry carries the retired key's
//! public half, which lets a restarted [`super::KeyManager`] keep verifying
//! during the grace window and still purge on time. The sweep consumes
//! entries whose deadline has passed.

use crate::error::KeyError;
use crate::types::{KeyId, SignatureBlockId, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// A scheduled purge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeEntry {
    /// Key to purge
    pub key: KeyId,
    /// Owning signature block
    pub signature_block: SignatureBlockId,
    /// Owner of the block
    pub user: UserId,
    /// Hex-encoded ed25519 public key of the retired key
    pub public_key: String,
    /// When the key stopped signing
    pub retired_at: DateTime<Utc>,
    /// Earliest purge time
    pub purge_at: DateTime<Utc>,
}

/// Storage for scheduled purges
pub trait PurgeQueue: Send + Sync + Debug {
    /// Add or replace the entry for `entry.key`
    fn enqueue(&self, entry: PurgeEntry) -> Result<(), KeyError>;

    /// Drop the entry for a key, if any
    fn remove(&self, key: KeyId) -> Result<(), KeyError>;

    /// Entries due at `now`, earliest first
    fn due(&self, now: DateTime<Utc>) -> Vec<PurgeEntry>;

    /// Every pending entry
    fn pending(&self) -> Vec<PurgeEntry>;
}

fn due_from(entries: &BTreeMap<KeyId, PurgeEntry>, now: DateTime<Utc>) -> Vec<PurgeEntry> {
    let mut due: Vec<PurgeEntry> = entries
        .values()
        .filter(|e| e.purge_at <= now)
        .cloned()
        .collect();
    due.sort_by_key(|e| e.purge_at);
    due
}

/// Volatile queue
#[derive(Debug, Default)]
pub struct InMemoryPurgeQueue {
    entries: Mutex<BTreeMap<KeyId, PurgeEntry>>,
}

impl InMemoryPurgeQueue {
    /// Create empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PurgeQueue for InMemoryPurgeQueue {
    fn enqueue(&self, entry: PurgeEntry) -> Result<(), KeyError> {
        self.entries.lock().insert(entry.key, entry);
        Ok(())
    }

    fn remove(&self, key: KeyId) -> Result<(), KeyError> {
        self.entries.lock().remove(&key);
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<PurgeEntry> {
        due_from(&self.entries.lock(), now)
    }

    fn pending(&self) -> Vec<PurgeEntry> {
        self.entries.lock().values().cloned().collect()
    }
}

/// Queue persisted as a JSON file, rewritten atomically on every change
///
/// The file is the source of truth: every change re-reads it first, so an
/// engine and a `signflow sweep` process may share one path. Writers within a
/// process are serialized; across processes the last rename wins.
#[derive(Debug)]
pub struct FilePurgeQueue {
    path: PathBuf,
    entries: Mutex<BTreeMap<KeyId, PurgeEntry>>,
}

impl FilePurgeQueue {
    /// Open (or create) the queue at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let path = path.into();
        let entries = load(&path)?;
        tracing::debug!(path = %path.display(), pending = entries.len(), "purge queue opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<KeyId, PurgeEntry>) -> Result<(), KeyError> {
        let list: Vec<&PurgeEntry> = entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&list).map_err(|e| KeyError::Queue(e.to_string()))?;
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, bytes)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| KeyError::Queue(format!("{}: {e}", self.path.display())))
    }

    /// Apply `change` to the current file contents and persist them
    ///
    /// `change` returns whether it modified anything; memory is updated only
    /// once the write succeeds.
    fn update(
        &self,
        change: impl FnOnce(&mut BTreeMap<KeyId, PurgeEntry>) -> bool,
    ) -> Result<(), KeyError> {
        let mut guard = self.entries.lock();
        let mut next = load(&self.path)?;
        if change(&mut next) {
            self.persist(&next)?;
        }
        *guard = next;
        Ok(())
    }

    /// Current file contents, falling back to the last known state
    fn current(&self) -> BTreeMap<KeyId, PurgeEntry> {
        let mut guard = self.entries.lock();
        match load(&self.path) {
            Ok(entries) => {
                *guard = entries.clone();
                entries
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "purge queue unreadable, using cached entries: {}", e);
                guard.clone()
            }
        }
    }
}

fn load(path: &Path) -> Result<BTreeMap<KeyId, PurgeEntry>, KeyError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
        Ok(bytes) => {
            let list: Vec<PurgeEntry> = serde_json::from_slice(&bytes)
                .map_err(|e| KeyError::Queue(format!("{}: {e}", path.display())))?;
            Ok(list.into_iter().map(|e| (e.key, e)).collect())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(KeyError::Queue(format!("{}: {e}", path.display()))),
    }
}

impl PurgeQueue for FilePurgeQueue {
    fn enqueue(&self, entry: PurgeEntry) -> Result<(), KeyError> {
        self.update(|entries| {
            entries.insert(entry.key, entry);
            true
        })
    }

    fn remove(&self, key: KeyId) -> Result<(), KeyError> {
        self.update(|entries| entries.remove(&key).is_some())
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<PurgeEntry> {
        due_from(&self.current(), now)
    }

    fn pending(&self) -> Vec<PurgeEntry> {
        self.current().into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(purge_at: DateTime<Utc>) -> PurgeEntry {
        PurgeEntry {
            key: KeyId::new(),
            signature_block: SignatureBlockId::new(),
            user: UserId::new(),
            public_key: "00".repeat(32),
            retired_at: purge_at - Duration::seconds(30),
            purge_at,
        }
    }

    #[test]
    fn due_returns_only_expired_entries_in_order() {
        let queue = InMemoryPurgeQueue::new();
        let now = Utc::now();
        let late = entry(now - Duration::seconds(5));
        let early = entry(now - Duration::seconds(60));
        let future = entry(now + Duration::seconds(30));
        queue.enqueue(late.clone()).unwrap();
        queue.enqueue(early.clone()).unwrap();
        queue.enqueue(future).unwrap();

        assert_eq!(queue.due(now), vec![early, late]);
        assert_eq!(queue.pending().len(), 3);
    }

    #[test]
    fn file_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("purge.json");
        let scheduled = entry(Utc::now() + Duration::seconds(30));

        {
            let queue = FilePurgeQueue::open(&path).unwrap();
            queue.enqueue(scheduled.clone()).unwrap();
        }

        let reopened = FilePurgeQueue::open(&path).unwrap();
        assert_eq!(reopened.pending(), vec![scheduled.clone()]);

        reopened.remove(scheduled.key).unwrap();
        let again = FilePurgeQueue::open(&path).unwrap();
        assert!(again.pending().is_empty());
    }

    #[test]
    fn file_queue_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("purge.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(FilePurgeQueue::open(&path), Err(KeyError::Queue(_))));
    }

    #[test]
    fn two_handles_on_one_file_do_not_resurrect_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("purge.json");
        let engine_side = FilePurgeQueue::open(&path).unwrap();
        let sweep_side = FilePurgeQueue::open(&path).unwrap();
        let now = Utc::now();
        let first = entry(now - Duration::seconds(1));
        let second = entry(now + Duration::seconds(60));

        engine_side.enqueue(first.clone()).unwrap();
        assert_eq!(sweep_side.due(now), vec![first.clone()]);
        sweep_side.remove(first.key).unwrap();

        engine_side.enqueue(second.clone()).unwrap();
        assert_eq!(engine_side.pending(), vec![second.clone()]);
        assert_eq!(FilePurgeQueue::open(&path).unwrap().pending(), vec![second]);
    }
}
