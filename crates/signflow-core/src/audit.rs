//! Hash-chained audit trail
//!
//! Every committed workflow transition appends one entry. Each entry hashes
//! its own fields together with the previous entry's hash, so any edit or
//! reordering breaks the chain.
//!
//! The trail lives in memory. A bounded trail drops its oldest entries and
//! keeps the last dropped hash as the anchor for verification; export with
//! [`AuditTrail::entries`] before that if the full history matters.

use crate::types::{DocumentId, UserId};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Audit chain broken at `index`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit chain broken at entry {index}")]
pub struct AuditIntegrityError {
    /// Position of the first bad entry
    pub index: usize,
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain
    pub seq: u64,
    /// Commit time
    pub at: DateTime<Utc>,
    /// Affected document
    pub document: DocumentId,
    /// Acting user
    pub actor: UserId,
    /// Operation name
    pub action: String,
    /// Free-form detail
    pub detail: String,
    /// Hash of the previous entry
    #[serde(with = "hex_bytes")]
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    #[serde(with = "hex_bytes")]
    pub hash: [u8; 32],
}

/// Append-only audit log
#[derive(Debug, Default)]
pub struct AuditTrail {
    inner: Mutex<Chain>,
}

#[derive(Debug, Default)]
struct Chain {
    entries: VecDeque<AuditEntry>,
    limit: Option<usize>,
    dropped: u64,
    anchor: [u8; 32],
}

impl AuditTrail {
    /// Create an unbounded trail
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a trail that retains at most `max_entries` (at least one)
    #[must_use]
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Chain {
                limit: Some(max_entries.max(1)),
                ..Chain::default()
            }),
        }
    }

    /// Append an entry and return its sequence number
    pub fn record(
        &self,
        at: DateTime<Utc>,
        document: DocumentId,
        actor: UserId,
        action: &str,
        detail: impl Into<String>,
    ) -> u64 {
        let mut chain = self.inner.lock();
        let prev_hash = chain.entries.back().map_or(chain.anchor, |e| e.hash);
        let mut entry = AuditEntry {
            seq: chain.dropped + chain.entries.len() as u64,
            at,
            document,
            actor,
            action: action.to_owned(),
            detail: detail.into(),
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        let seq = entry.seq;
        chain.entries.push_back(entry);
        if chain.limit.is_some_and(|limit| chain.entries.len() > limit) {
            if let Some(oldest) = chain.entries.pop_front() {
                chain.anchor = oldest.hash;
                chain.dropped += 1;
            }
        }
        seq
    }

    /// Retained entries in order
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    /// Retained entries touching one document
    #[must_use]
    pub fn entries_for(&self, document: DocumentId) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.document == document)
            .cloned()
            .collect()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Entries dropped from the front of a bounded trail
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Re-walk the retained chain from its anchor
    pub fn verify_integrity(&self) -> Result<(), AuditIntegrityError> {
        let chain = self.inner.lock();
        verify_from(chain.entries.iter(), chain.dropped, chain.anchor)
    }
}

/// Check a standalone slice of entries, e.g. one loaded from disk
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), AuditIntegrityError> {
    verify_from(entries.iter(), 0, [0u8; 32])
}

fn verify_from<'a>(
    entries: impl Iterator<Item = &'a AuditEntry>,
    first_seq: u64,
    mut prev: [u8; 32],
) -> Result<(), AuditIntegrityError> {
    for (index, e) in entries.enumerate() {
        if e.seq != first_seq + index as u64 || e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(AuditIntegrityError { index });
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.at.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
    hasher.update(entry.document.0.as_bytes());
    hasher.update(entry.actor.0.as_bytes());
    hasher.update(entry.action.as_bytes());
    hasher.update([0]);
    hasher.update(entry.detail.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&raw, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}
