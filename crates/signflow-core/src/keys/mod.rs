//! Signing key lifecycle
//!
//! Each user owns at most one [`SignatureBlock`]; each block has at most one
//! active ed25519 key. Rotation retires the active key (still valid for
//! verification, no longer usable for signing) and installs a fresh one.
//! Retired keys are purged by a sweep once their scheduled deadline passes.
//!
//! Every block has its own lock; key operations never touch document locks.
//!
//! A purged key leaves only a tombstone behind, and only the most recent
//! [`TOMBSTONE_LIMIT`] tombstones are kept. Older purged keys report
//! `UnknownKey` instead of `KeyPurged`.

mod queue;
mod sweeper;

pub use queue::{FilePurgeQueue, InMemoryPurgeQueue, PurgeEntry, PurgeQueue};
pub use sweeper::{KeySweeper, SweeperHandle};

use crate::clock::{Clock, SystemClock};
use crate::error::{KeyError, ValidationError};
use crate::types::{KeyId, SignatureBlockId, SignatureStyle, UserId};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Upper bound on a purge delay (100 years)
const MAX_DELAY_SECS: i64 = 100 * 365 * 24 * 3600;

/// Purged key ids remembered for `KeyPurged` reporting
pub const TOMBSTONE_LIMIT: usize = 10_000;

fn purge_deadline(now: DateTime<Utc>, delay_secs: u64) -> DateTime<Utc> {
    let delay_secs = i64::try_from(delay_secs).unwrap_or(i64::MAX).min(MAX_DELAY_SECS);
    now.checked_add_signed(Duration::seconds(delay_secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn decode_public(raw: &str) -> Option<VerifyingKey> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(raw, &mut bytes).ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Lifecycle of a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyState {
    /// Usable for signing and verification
    Active,
    /// Verification only
    Retiring {
        /// When rotation happened
        retired_at: DateTime<Utc>,
    },
    /// Verification only, purge queued
    PurgeScheduled {
        /// When rotation happened
        retired_at: DateTime<Utc>,
        /// Earliest purge
        purge_at: DateTime<Utc>,
    },
    /// Gone; nothing verifies
    Purged {
        /// When the sweep removed it
        purged_at: DateTime<Utc>,
    },
}

impl KeyState {
    /// Short state name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Retiring { .. } => "retiring",
            KeyState::PurgeScheduled { .. } => "purge_scheduled",
            KeyState::Purged { .. } => "purged",
        }
    }

    /// Whether signatures under the key still verify
    #[must_use]
    pub fn verifies(&self) -> bool {
        !matches!(self, KeyState::Purged { .. })
    }
}

/// Public view of an issued key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    /// Key id
    pub key_id: KeyId,
    /// Owning block
    pub signature_block: SignatureBlockId,
    /// Hex-encoded ed25519 public key
    pub public_key: String,
    /// Issue time
    pub created_at: DateTime<Utc>,
}

/// A user's reusable signing identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Block id
    pub id: SignatureBlockId,
    /// Owning user
    pub user: UserId,
    /// Font and ink
    pub style: SignatureStyle,
    /// Rendered text, usually the full name
    pub body: String,
    /// Public key of the active key, hex encoded
    pub pub_key: Option<String>,
    /// Active key id
    pub active_key: Option<KeyId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Signature produced by the active key of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySignature {
    /// Signing key
    pub key_id: KeyId,
    /// ed25519 signature
    pub signature: Signature,
}

/// Result of one purge sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys purged by this sweep
    pub purged: Vec<KeyId>,
    /// Queue entries whose key no longer exists
    pub orphaned: Vec<KeyId>,
    /// Queue entries left in place because the queue could not be updated
    pub deferred: Vec<KeyId>,
}

#[derive(Debug)]
struct KeyRecord {
    id: KeyId,
    verifying_key: Option<VerifyingKey>,
    signing_key: Option<SigningKey>,
    state: KeyState,
    created_at: DateTime<Utc>,
}

impl KeyRecord {
    fn generate(now: DateTime<Utc>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            id: KeyId::new(),
            verifying_key: Some(signing_key.verifying_key()),
            signing_key: Some(signing_key),
            state: KeyState::Active,
            created_at: now,
        }
    }

    fn recovered(entry: &PurgeEntry, verifying_key: VerifyingKey) -> Self {
        Self {
            id: entry.key,
            verifying_key: Some(verifying_key),
            signing_key: None,
            state: KeyState::PurgeScheduled {
                retired_at: entry.retired_at,
                purge_at: entry.purge_at,
            },
            created_at: entry.retired_at,
        }
    }

    fn public_hex(&self) -> Option<String> {
        self.verifying_key.map(|k| hex::encode(k.as_bytes()))
    }

    fn purge_entry(
        &self,
        block: &SignatureBlock,
        retired_at: DateTime<Utc>,
        purge_at: DateTime<Utc>,
    ) -> PurgeEntry {
        PurgeEntry {
            key: self.id,
            signature_block: block.id,
            user: block.user,
            public_key: self.public_hex().unwrap_or_default(),
            retired_at,
            purge_at,
        }
    }
}

#[derive(Debug)]
struct BlockEntry {
    block: SignatureBlock,
    keys: Vec<KeyRecord>,
}

impl BlockEntry {
    fn active(&self) -> Option<&KeyRecord> {
        self.keys.iter().find(|k| k.state == KeyState::Active)
    }

    fn key(&self, key: KeyId) -> Option<&KeyRecord> {
        self.keys.iter().find(|k| k.id == key)
    }

    fn key_mut(&mut self, key: KeyId) -> Option<&mut KeyRecord> {
        self.keys.iter_mut().find(|k| k.id == key)
    }

    fn handle(&self, record: &KeyRecord) -> KeyHandle {
        KeyHandle {
            key_id: record.id,
            signature_block: self.block.id,
            public_key: record.public_hex().unwrap_or_default(),
            created_at: record.created_at,
        }
    }

    fn install(&mut self, record: KeyRecord) -> KeyHandle {
        self.block.active_key = Some(record.id);
        self.block.pub_key = record.public_hex();
        let handle = self.handle(&record);
        self.keys.push(record);
        handle
    }
}

/// Key manager
#[derive(Debug)]
pub struct KeyManager {
    blocks: DashMap<SignatureBlockId, Arc<Mutex<BlockEntry>>>,
    by_user: DashMap<UserId, SignatureBlockId>,
    key_index: DashMap<KeyId, SignatureBlockId>,
    tombstones: Mutex<Tombstones>,
    queue: Arc<dyn PurgeQueue>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Tombstones {
    purged_at: HashMap<KeyId, DateTime<Utc>>,
    order: VecDeque<KeyId>,
}

impl Tombstones {
    fn insert(&mut self, key: KeyId, at: DateTime<Utc>) {
        if self.purged_at.insert(key, at).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > TOMBSTONE_LIMIT {
            if let Some(old) = self.order.pop_front() {
                self.purged_at.remove(&old);
            }
        }
    }
}

impl KeyManager {
    /// Create a manager with a volatile queue and the wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(Arc::new(InMemoryPurgeQueue::new()), Arc::new(SystemClock))
    }

    /// Create a manager over an explicit queue and clock
    ///
    /// Keys already waiting in the queue are restored as retired keys, so
    /// they keep verifying until their purge deadline.
    #[must_use]
    pub fn with_parts(queue: Arc<dyn PurgeQueue>, clock: Arc<dyn Clock>) -> Self {
        let keys = Self {
            blocks: DashMap::new(),
            by_user: DashMap::new(),
            key_index: DashMap::new(),
            tombstones: Mutex::new(Tombstones::default()),
            queue,
            clock,
        };
        keys.recover();
        keys
    }

    fn recover(&self) {
        let mut recovered = 0usize;
        for pending in self.queue.pending() {
            let Some(verifying_key) = decode_public(&pending.public_key) else {
                tracing::warn!(key = %pending.key, "queued key has no usable public key; left for the sweep");
                continue;
            };
            // Recovered blocks carry only retired keys and are not bound to
            // their user; the user signs up for a fresh block.
            let entry = Arc::clone(
                self.blocks
                    .entry(pending.signature_block)
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(BlockEntry {
                            block: SignatureBlock {
                                id: pending.signature_block,
                                user: pending.user,
                                style: SignatureStyle::default(),
                                body: String::new(),
                                pub_key: None,
                                active_key: None,
                                created_at: pending.retired_at,
                            },
                            keys: Vec::new(),
                        }))
                    })
                    .value(),
            );
            entry
                .lock()
                .keys
                .push(KeyRecord::recovered(&pending, verifying_key));
            self.key_index.insert(pending.key, pending.signature_block);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "retired keys restored from purge queue");
        }
    }

    /// Purge queue backing scheduled deletions
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn PurgeQueue> {
        &self.queue
    }

    fn entry(&self, id: SignatureBlockId) -> Result<Arc<Mutex<BlockEntry>>, KeyError> {
        self.blocks
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(KeyError::UnknownSignatureBlock(id))
    }

    fn entry_for_key(&self, key: KeyId) -> Result<Arc<Mutex<BlockEntry>>, KeyError> {
        let Some(block) = self.key_index.get(&key).map(|b| *b) else {
            return Err(if self.tombstones.lock().purged_at.contains_key(&key) {
                KeyError::KeyPurged(key)
            } else {
                KeyError::UnknownKey(key)
            });
        };
        self.entry(block)
    }

    /// Drop a key's material and record, leaving a tombstone
    fn purge_record(&self, entry: &mut BlockEntry, key: KeyId, now: DateTime<Utc>) {
        entry.keys.retain(|k| k.id != key);
        self.key_index.remove(&key);
        self.tombstones.lock().insert(key, now);
    }

    /// Create the user's signature block; a user owns at most one
    pub fn create_signature_block(
        &self,
        user: UserId,
        style: SignatureStyle,
        body: impl Into<String>,
    ) -> Result<SignatureBlock, ValidationError> {
        match self.by_user.entry(user) {
            Entry::Occupied(_) => Err(ValidationError::SignatureBlockExists(user)),
            Entry::Vacant(slot) => {
                let block = SignatureBlock {
                    id: SignatureBlockId::new(),
                    user,
                    style,
                    body: body.into(),
                    pub_key: None,
                    active_key: None,
                    created_at: self.clock.now(),
                };
                self.blocks.insert(
                    block.id,
                    Arc::new(Mutex::new(BlockEntry {
                        block: block.clone(),
                        keys: Vec::new(),
                    })),
                );
                slot.insert(block.id);
                tracing::info!(%user, block = %block.id, "signature block created");
                Ok(block)
            }
        }
    }

    /// Snapshot of a block
    #[must_use]
    pub fn signature_block(&self, id: SignatureBlockId) -> Option<SignatureBlock> {
        self.blocks.get(&id).map(|e| e.value().lock().block.clone())
    }

    /// Snapshot of a user's block
    #[must_use]
    pub fn signature_block_for(&self, user: UserId) -> Option<SignatureBlock> {
        let id = *self.by_user.get(&user)?;
        self.signature_block(id)
    }

    /// Current state of a key
    #[must_use]
    pub fn key_state(&self, key: KeyId) -> Option<KeyState> {
        if let Some(purged_at) = self.tombstones.lock().purged_at.get(&key) {
            return Some(KeyState::Purged {
                purged_at: *purged_at,
            });
        }
        let entry = self.entry_for_key(key).ok()?;
        let guard = entry.lock();
        guard.key(key).map(|k| k.state)
    }

    /// Issue the first key for a block
    ///
    /// # Errors
    /// - `KeyError::KeyConflict` if an active key exists (use [`Self::rotate_key`])
    pub fn issue_key(&self, block: SignatureBlockId) -> Result<KeyHandle, KeyError> {
        let entry = self.entry(block)?;
        let mut guard = entry.lock();
        if guard.active().is_some() {
            return Err(KeyError::KeyConflict(block));
        }
        let record = KeyRecord::generate(self.clock.now());
        self.key_index.insert(record.id, block);
        let handle = guard.install(record);
        tracing::info!(%block, key = %handle.key_id, "key issued");
        Ok(handle)
    }

    /// Retire the active key and install a new one
    pub fn rotate_key(&self, block: SignatureBlockId) -> Result<KeyHandle, KeyError> {
        let entry = self.entry(block)?;
        let mut guard = entry.lock();
        let now = self.clock.now();

        let retired = guard
            .keys
            .iter_mut()
            .find(|k| k.state == KeyState::Active)
            .map(|old| {
                old.state = KeyState::Retiring { retired_at: now };
                old.signing_key = None;
                old.id
            });

        let record = KeyRecord::generate(now);
        self.key_index.insert(record.id, block);
        let handle = guard.install(record);
        tracing::info!(%block, key = %handle.key_id, retired = ?retired, "key rotated");
        Ok(handle)
    }

    /// Retire the active key, queue its purge after `delay_secs` and install
    /// a new key, all under the block lock
    ///
    /// If the queue write fails nothing changes: the old key stays active.
    /// With no active key this only issues one.
    ///
    /// # Errors
    /// - `KeyError::Queue` when the purge entry cannot be persisted
    pub fn rotate_and_schedule(
        &self,
        block: SignatureBlockId,
        delay_secs: u64,
    ) -> Result<(KeyHandle, Option<PurgeEntry>), KeyError> {
        let entry = self.entry(block)?;
        let mut guard = entry.lock();
        let now = self.clock.now();

        let scheduled = match guard.active() {
            Some(old) => {
                let purge = old.purge_entry(&guard.block, now, purge_deadline(now, delay_secs));
                self.queue.enqueue(purge.clone())?;
                Some(purge)
            }
            None => None,
        };
        if let Some(purge) = &scheduled {
            if let Some(old) = guard.key_mut(purge.key) {
                old.signing_key = None;
                old.state = KeyState::PurgeScheduled {
                    retired_at: now,
                    purge_at: purge.purge_at,
                };
            }
        }

        let record = KeyRecord::generate(now);
        self.key_index.insert(record.id, block);
        let handle = guard.install(record);
        tracing::info!(
            %block,
            key = %handle.key_id,
            retired = ?scheduled.as_ref().map(|p| p.key),
            purge_at = ?scheduled.as_ref().map(|p| p.purge_at),
            "key rotated"
        );
        Ok((handle, scheduled))
    }

    /// Queue a retired key for purge after `delay_secs`
    ///
    /// # Errors
    /// - `KeyError::InvalidKeyState` for the active key
    /// - `KeyError::KeyPurged` if already purged
    pub fn schedule_deletion(&self, key: KeyId, delay_secs: u64) -> Result<DateTime<Utc>, KeyError> {
        let entry = self.entry_for_key(key)?;
        let mut guard = entry.lock();
        let now = self.clock.now();
        let record = guard.key(key).ok_or(KeyError::UnknownKey(key))?;

        let retired_at = match record.state {
            KeyState::Active => {
                return Err(KeyError::InvalidKeyState {
                    key,
                    state: record.state.name(),
                })
            }
            KeyState::Purged { .. } => return Err(KeyError::KeyPurged(key)),
            KeyState::Retiring { retired_at } | KeyState::PurgeScheduled { retired_at, .. } => {
                retired_at
            }
        };

        let purge_at = purge_deadline(now, delay_secs);
        self.queue
            .enqueue(record.purge_entry(&guard.block, retired_at, purge_at))?;
        if let Some(record) = guard.key_mut(key) {
            record.state = KeyState::PurgeScheduled {
                retired_at,
                purge_at,
            };
        }
        tracing::info!(%key, %purge_at, "key deletion scheduled");
        Ok(purge_at)
    }

    /// Purge a retired key immediately
    ///
    /// # Errors
    /// - `KeyError::InvalidKeyState` for the active key
    pub fn delete_key(&self, key: KeyId) -> Result<(), KeyError> {
        let entry = self.entry_for_key(key)?;
        let mut guard = entry.lock();
        let now = self.clock.now();
        let state = guard.key(key).ok_or(KeyError::UnknownKey(key))?.state;
        match state {
            KeyState::Active => Err(KeyError::InvalidKeyState {
                key,
                state: state.name(),
            }),
            KeyState::Purged { .. } => Err(KeyError::KeyPurged(key)),
            KeyState::Retiring { .. } | KeyState::PurgeScheduled { .. } => {
                self.queue.remove(key)?;
                self.purge_record(&mut guard, key, now);
                tracing::info!(%key, "key deleted");
                Ok(())
            }
        }
    }

    /// Purge every retired key whose deadline has passed
    ///
    /// Due queue entries are consumed first. Keys whose deadline passed but
    /// whose entry is already gone (another process swept the shared queue)
    /// are purged from memory as well.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for due in self.queue.due(now) {
            let key = due.key;
            let expired = match self.entry_for_key(key) {
                Ok(entry) => match entry.lock().key(key).map(|k| k.state) {
                    Some(KeyState::PurgeScheduled { purge_at, .. }) => purge_at <= now,
                    // Stale entry, e.g. the key was deleted directly
                    _ => true,
                },
                Err(KeyError::KeyPurged(_)) => true,
                Err(_) => {
                    report.orphaned.push(key);
                    true
                }
            };
            if !expired {
                continue;
            }
            if let Err(e) = self.queue.remove(key) {
                tracing::warn!(%key, "purge deferred: {}", e);
                report.orphaned.retain(|k| *k != key);
                report.deferred.push(key);
            }
        }

        let queued: HashSet<KeyId> = self.queue.pending().into_iter().map(|e| e.key).collect();
        let blocks: Vec<_> = self.blocks.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in blocks {
            let mut guard = entry.lock();
            let expired: Vec<KeyId> = guard
                .keys
                .iter()
                .filter(|k| {
                    matches!(k.state, KeyState::PurgeScheduled { purge_at, .. } if purge_at <= now)
                        && !queued.contains(&k.id)
                })
                .map(|k| k.id)
                .collect();
            for key in expired {
                self.purge_record(&mut guard, key, now);
                report.purged.push(key);
            }
        }

        if !report.purged.is_empty() || !report.deferred.is_empty() {
            tracing::info!(
                purged = report.purged.len(),
                deferred = report.deferred.len(),
                "purge sweep finished"
            );
        }
        report
    }

    /// Sign with the user's active key
    ///
    /// # Errors
    /// - `KeyError::NoActiveKey` when the user has no block or no active key
    pub fn sign_for_user(&self, user: UserId, message: &[u8]) -> Result<KeySignature, KeyError> {
        let block = *self.by_user.get(&user).ok_or(KeyError::NoActiveKey(user))?;
        self.sign(block, message)
    }

    /// Sign with the block's active key
    ///
    /// # Errors
    /// - `KeyError::NoActiveKey` when the block has no active key
    pub fn sign(&self, block: SignatureBlockId, message: &[u8]) -> Result<KeySignature, KeyError> {
        let entry = self.entry(block)?;
        let guard = entry.lock();
        let user = guard.block.user;
        let record = guard.active().ok_or(KeyError::NoActiveKey(user))?;
        let signing_key = record
            .signing_key
            .as_ref()
            .ok_or(KeyError::NoActiveKey(user))?;
        Ok(KeySignature {
            key_id: record.id,
            signature: signing_key.sign(message),
        })
    }

    /// Verify a signature; succeeds for active and retired keys until purge
    pub fn verify(&self, signature: &KeySignature, message: &[u8]) -> Result<(), KeyError> {
        let key = signature.key_id;
        let entry = self.entry_for_key(key)?;
        let guard = entry.lock();
        let record = guard.key(key).ok_or(KeyError::UnknownKey(key))?;
        if !record.state.verifies() {
            return Err(KeyError::KeyPurged(key));
        }
        let verifying_key = record.verifying_key.ok_or(KeyError::KeyPurged(key))?;
        verifying_key
            .verify(message, &signature.signature)
            .map_err(|_| KeyError::SignatureMismatch(key))
    }

    /// Remove a block and purge all of its keys
    pub fn destroy_signature_block(&self, id: SignatureBlockId) -> Result<(), KeyError> {
        let (_, entry) = self
            .blocks
            .remove(&id)
            .ok_or(KeyError::UnknownSignatureBlock(id))?;
        let guard = entry.lock();
        if self.by_user.get(&guard.block.user).is_some_and(|b| *b == id) {
            self.by_user.remove(&guard.block.user);
        }
        for record in &guard.keys {
            if let Err(e) = self.queue.remove(record.id) {
                tracing::warn!(key = %record.id, "stale purge entry left behind: {}", e);
            }
            self.key_index.remove(&record.id);
        }
        tracing::info!(block = %id, "signature block destroyed");
        Ok(())
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> (KeyManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let keys = KeyManager::with_parts(Arc::new(InMemoryPurgeQueue::new()), clock.clone());
        (keys, clock)
    }

    fn block(keys: &KeyManager) -> SignatureBlock {
        keys.create_signature_block(UserId::new(), SignatureStyle::default(), "Bob Zhurunkel")
            .unwrap()
    }

    #[test]
    fn one_block_per_user() {
        let (keys, _) = manager();
        let user = UserId::new();
        keys.create_signature_block(user, SignatureStyle::default(), "A")
            .unwrap();
        let err = keys
            .create_signature_block(user, SignatureStyle::default(), "B")
            .unwrap_err();
        assert_eq!(err, ValidationError::SignatureBlockExists(user));
    }

    #[test]
    fn issue_twice_conflicts() {
        let (keys, _) = manager();
        let b = block(&keys);
        let handle = keys.issue_key(b.id).unwrap();
        assert_eq!(handle.public_key.len(), 64);
        assert_eq!(keys.issue_key(b.id), Err(KeyError::KeyConflict(b.id)));
    }

    #[test]
    fn rotation_leaves_exactly_one_active_key() {
        let (keys, _) = manager();
        let b = block(&keys);
        let first = keys.issue_key(b.id).unwrap();
        let second = keys.rotate_key(b.id).unwrap();

        assert_ne!(first.key_id, second.key_id);
        assert_eq!(keys.key_state(second.key_id), Some(KeyState::Active));
        assert_eq!(keys.key_state(first.key_id).unwrap().name(), "retiring");

        let snapshot = keys.signature_block(b.id).unwrap();
        assert_eq!(snapshot.active_key, Some(second.key_id));
        assert_eq!(snapshot.pub_key, Some(second.public_key));
    }

    #[test]
    fn retired_key_verifies_until_sweep_passes_deadline() {
        let (keys, clock) = manager();
        let b = block(&keys);
        keys.issue_key(b.id).unwrap();
        let sig = keys.sign_for_user(b.user, b"payload").unwrap();

        keys.rotate_key(b.id).unwrap();
        keys.schedule_deletion(sig.key_id, 30).unwrap();

        clock.advance(Duration::seconds(29));
        assert!(keys.sweep().purged.is_empty());
        assert!(keys.verify(&sig, b"payload").is_ok());

        clock.advance(Duration::seconds(2));
        assert_eq!(keys.sweep().purged, vec![sig.key_id]);
        assert_eq!(keys.verify(&sig, b"payload"), Err(KeyError::KeyPurged(sig.key_id)));
    }

    #[test]
    fn active_key_cannot_be_deleted_or_scheduled() {
        let (keys, _) = manager();
        let b = block(&keys);
        let handle = keys.issue_key(b.id).unwrap();
        assert!(matches!(
            keys.delete_key(handle.key_id),
            Err(KeyError::InvalidKeyState { state: "active", .. })
        ));
        assert!(matches!(
            keys.schedule_deletion(handle.key_id, 30),
            Err(KeyError::InvalidKeyState { .. })
        ));
        assert!(keys.queue().pending().is_empty());
    }

    #[test]
    fn retired_keys_cannot_sign() {
        let (keys, _) = manager();
        let b = block(&keys);
        keys.issue_key(b.id).unwrap();
        keys.rotate_key(b.id).unwrap();
        let sig = keys.sign_for_user(b.user, b"x").unwrap();
        assert_eq!(keys.key_state(sig.key_id), Some(KeyState::Active));
    }

    #[test]
    fn signing_without_key_fails() {
        let (keys, _) = manager();
        let b = block(&keys);
        assert_eq!(
            keys.sign_for_user(b.user, b"x"),
            Err(KeyError::NoActiveKey(b.user))
        );
        let stranger = UserId::new();
        assert_eq!(
            keys.sign_for_user(stranger, b"x"),
            Err(KeyError::NoActiveKey(stranger))
        );
    }

    #[test]
    fn rotate_without_active_key_issues() {
        let (keys, _) = manager();
        let b = block(&keys);
        let handle = keys.rotate_key(b.id).unwrap();
        let sig = keys.sign(b.id, b"x").unwrap();
        assert_eq!(sig.key_id, handle.key_id);
        keys.verify(&sig, b"x").unwrap();
    }

    #[test]
    fn tampered_message_fails_verification() {
        let (keys, _) = manager();
        let b = block(&keys);
        keys.issue_key(b.id).unwrap();
        let sig = keys.sign_for_user(b.user, b"original").unwrap();
        assert_eq!(
            keys.verify(&sig, b"tampered"),
            Err(KeyError::SignatureMismatch(sig.key_id))
        );
    }

    #[test]
    fn destroy_purges_keys_and_frees_user() {
        let (keys, _) = manager();
        let b = block(&keys);
        keys.issue_key(b.id).unwrap();
        let sig = keys.sign_for_user(b.user, b"x").unwrap();
        keys.destroy_signature_block(b.id).unwrap();

        assert_eq!(keys.verify(&sig, b"x"), Err(KeyError::UnknownKey(sig.key_id)));
        assert!(keys.signature_block_for(b.user).is_none());
        assert!(keys
            .create_signature_block(b.user, SignatureStyle::default(), "again")
            .is_ok());
    }

    #[test]
    fn sweep_drops_orphaned_entries() {
        let (keys, clock) = manager();
        let orphan = KeyId::new();
        keys.queue()
            .enqueue(PurgeEntry {
                key: orphan,
                signature_block: SignatureBlockId::new(),
                user: UserId::new(),
                public_key: String::new(),
                retired_at: clock.now(),
                purge_at: clock.now(),
            })
            .unwrap();
        let report = keys.sweep();
        assert_eq!(report.orphaned, vec![orphan]);
        assert!(keys.queue().pending().is_empty());
    }

    #[derive(Debug)]
    struct FullDisk;

    impl PurgeQueue for FullDisk {
        fn enqueue(&self, _entry: PurgeEntry) -> Result<(), KeyError> {
            Err(KeyError::Queue("disk full".into()))
        }

        fn remove(&self, _key: KeyId) -> Result<(), KeyError> {
            Err(KeyError::Queue("disk full".into()))
        }

        fn due(&self, _now: DateTime<Utc>) -> Vec<PurgeEntry> {
            Vec::new()
        }

        fn pending(&self) -> Vec<PurgeEntry> {
            Vec::new()
        }
    }

    #[test]
    fn failed_enqueue_leaves_rotation_undone() {
        let keys = KeyManager::with_parts(Arc::new(FullDisk), Arc::new(ManualClock::default()));
        let b = block(&keys);
        let first = keys.issue_key(b.id).unwrap();

        assert_eq!(
            keys.rotate_and_schedule(b.id, 30),
            Err(KeyError::Queue("disk full".into()))
        );
        assert_eq!(keys.key_state(first.key_id), Some(KeyState::Active));
        assert_eq!(keys.signature_block(b.id).unwrap().active_key, Some(first.key_id));
        assert_eq!(keys.sign(b.id, b"x").unwrap().key_id, first.key_id);
    }

    #[test]
    fn rotate_and_schedule_queues_the_key_it_retires() {
        let (keys, clock) = manager();
        let b = block(&keys);
        let first = keys.issue_key(b.id).unwrap();

        let (second, purge) = keys.rotate_and_schedule(b.id, 30).unwrap();
        let purge = purge.unwrap();
        assert_eq!(purge.key, first.key_id);
        assert_eq!(purge.public_key, first.public_key);
        assert_eq!(purge.purge_at, clock.now() + Duration::seconds(30));
        assert_eq!(keys.key_state(second.key_id), Some(KeyState::Active));
        assert_eq!(keys.key_state(first.key_id).unwrap().name(), "purge_scheduled");
        assert_eq!(keys.queue().pending(), vec![purge]);
    }

    #[test]
    fn concurrent_rotations_schedule_every_retired_key() {
        let (keys, _) = manager();
        let b = block(&keys);
        keys.issue_key(b.id).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        keys.rotate_and_schedule(b.id, 60).unwrap();
                    }
                });
            }
        });

        let pending = keys.queue().pending();
        assert_eq!(pending.len(), 100);
        for entry in pending {
            assert_eq!(keys.key_state(entry.key).unwrap().name(), "purge_scheduled");
        }
    }

    #[test]
    fn scheduled_purge_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("purge.json");
        let clock = Arc::new(ManualClock::default());
        let open = || {
            KeyManager::with_parts(
                Arc::new(FilePurgeQueue::open(&path).unwrap()),
                clock.clone(),
            )
        };

        let sig = {
            let keys = open();
            let b = block(&keys);
            keys.issue_key(b.id).unwrap();
            let sig = keys.sign(b.id, b"lease").unwrap();
            keys.rotate_and_schedule(b.id, 30).unwrap();
            sig
        };

        let keys = open();
        keys.verify(&sig, b"lease").unwrap();
        assert_eq!(keys.key_state(sig.key_id).unwrap().name(), "purge_scheduled");

        clock.advance(Duration::seconds(31));
        assert_eq!(keys.sweep().purged, vec![sig.key_id]);
        assert_eq!(keys.verify(&sig, b"lease"), Err(KeyError::KeyPurged(sig.key_id)));
        assert!(FilePurgeQueue::open(&path).unwrap().pending().is_empty());
    }

    #[test]
    fn sweep_by_another_process_still_purges_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("purge.json");
        let clock = Arc::new(ManualClock::default());
        let engine_keys =
            KeyManager::with_parts(Arc::new(FilePurgeQueue::open(&path).unwrap()), clock.clone());
        let b = block(&engine_keys);
        engine_keys.issue_key(b.id).unwrap();
        let sig = engine_keys.sign(b.id, b"x").unwrap();
        engine_keys.rotate_and_schedule(b.id, 5).unwrap();

        clock.advance(Duration::seconds(6));
        let sweeper_keys =
            KeyManager::with_parts(Arc::new(FilePurgeQueue::open(&path).unwrap()), clock.clone());
        assert_eq!(sweeper_keys.sweep().purged, vec![sig.key_id]);

        let report = engine_keys.sweep();
        assert_eq!(report.purged, vec![sig.key_id]);
        assert!(report.orphaned.is_empty());
        assert_eq!(engine_keys.verify(&sig, b"x"), Err(KeyError::KeyPurged(sig.key_id)));
    }

    #[test]
    fn purged_records_are_dropped() {
        let (keys, _) = manager();
        let b = block(&keys);
        let first = keys.issue_key(b.id).unwrap();
        keys.rotate_key(b.id).unwrap();
        keys.delete_key(first.key_id).unwrap();

        let entry = keys.entry(b.id).unwrap();
        assert_eq!(entry.lock().keys.len(), 1);
        assert!(keys.key_index.get(&first.key_id).is_none());
        assert_eq!(keys.key_state(first.key_id).unwrap().name(), "purged");
        assert_eq!(keys.delete_key(first.key_id), Err(KeyError::KeyPurged(first.key_id)));
    }

    #[test]
    fn tombstones_are_bounded() {
        let mut tombstones = Tombstones::default();
        let now = Utc::now();
        let first = KeyId::new();
        tombstones.insert(first, now);
        for _ in 0..TOMBSTONE_LIMIT {
            tombstones.insert(KeyId::new(), now);
        }
        assert_eq!(tombstones.order.len(), TOMBSTONE_LIMIT);
        assert!(!tombstones.purged_at.contains_key(&first));
    }

    #[derive(Debug, Default)]
    struct StuckQueue(InMemoryPurgeQueue);

    impl PurgeQueue for StuckQueue {
        fn enqueue(&self, entry: PurgeEntry) -> Result<(), KeyError> {
            self.0.enqueue(entry)
        }

        fn remove(&self, _key: KeyId) -> Result<(), KeyError> {
            Err(KeyError::Queue("locked by another writer".into()))
        }

        fn due(&self, now: DateTime<Utc>) -> Vec<PurgeEntry> {
            self.0.due(now)
        }

        fn pending(&self) -> Vec<PurgeEntry> {
            self.0.pending()
        }
    }

    #[test]
    fn unremovable_entry_defers_the_purge() {
        let keys = KeyManager::with_parts(
            Arc::new(StuckQueue::default()),
            Arc::new(ManualClock::default()),
        );
        let b = block(&keys);
        keys.issue_key(b.id).unwrap();
        let sig = keys.sign(b.id, b"x").unwrap();
        keys.rotate_and_schedule(b.id, 0).unwrap();

        let report = keys.sweep();
        assert_eq!(report.deferred, vec![sig.key_id]);
        assert!(report.purged.is_empty());
        keys.verify(&sig, b"x").unwrap();
    }
}
