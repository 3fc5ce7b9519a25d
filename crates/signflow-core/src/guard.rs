//! Per-document consistency guard
//!
//! Each document lives in its own cell with an exclusive async lock and a
//! published snapshot. A transition:
//! 1. waits for the lock (bounded by the configured timeout)
//! 2. runs against a private copy of the record
//! 3. commits the copy and republishes the snapshot only on success
//!
//! The transition closure is synchronous, so nothing can await an external
//! service while the lock is held, and dropping a caller mid-wait leaves no
//! trace. Reads go to the snapshot and never touch the lock.

use crate::clock::Clock;
use crate::document::DocumentRecord;
use crate::error::{Result, SignflowError, ValidationError};
use crate::types::DocumentId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug)]
struct DocumentCell {
    record: Mutex<DocumentRecord>,
    snapshot: RwLock<Arc<DocumentRecord>>,
    destroyed: AtomicBool,
}

/// Lock table for documents
#[derive(Debug)]
pub struct DocumentGuard {
    cells: DashMap<DocumentId, Arc<DocumentCell>>,
    lock_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl DocumentGuard {
    /// Create an empty guard
    #[must_use]
    pub fn new(lock_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cells: DashMap::new(),
            lock_timeout,
            clock,
        }
    }

    /// Number of tracked documents
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no documents are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Start tracking a new document
    pub fn insert(&self, record: DocumentRecord) -> Result<()> {
        record.check_invariants()?;
        match self.cells.entry(record.id) {
            Entry::Occupied(_) => Err(ValidationError::InvalidDocument(format!(
                "document {} already exists",
                record.id
            ))
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(DocumentCell {
                    snapshot: RwLock::new(Arc::new(record.clone())),
                    record: Mutex::new(record),
                    destroyed: AtomicBool::new(false),
                }));
                Ok(())
            }
        }
    }

    /// Latest committed state; lock-free, may trail an in-flight transition
    #[must_use]
    pub fn snapshot(&self, id: DocumentId) -> Option<Arc<DocumentRecord>> {
        let cell = self.cells.get(&id).map(|c| Arc::clone(c.value()))?;
        let snapshot = cell.snapshot.read();
        Some(Arc::clone(&snapshot))
    }

    fn cell(&self, id: DocumentId) -> Result<Arc<DocumentCell>> {
        self.cells
            .get(&id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(SignflowError::DocumentNotFound(id))
    }

    async fn acquire<'a>(
        &self,
        id: DocumentId,
        cell: &'a DocumentCell,
    ) -> Result<tokio::sync::MutexGuard<'a, DocumentRecord>> {
        let started = Instant::now();
        let guard = tokio::time::timeout(self.lock_timeout, cell.record.lock())
            .await
            .map_err(|_| {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(document = %id, waited_ms, "document lock timed out");
                SignflowError::LockTimeout {
                    document: id,
                    waited_ms,
                }
            })?;
        if cell.destroyed.load(Ordering::Acquire) {
            return Err(SignflowError::DocumentNotFound(id));
        }
        tracing::trace!(document = %id, "document lock acquired");
        Ok(guard)
    }

    /// Run a state transition under the document lock
    ///
    /// `f` sees a private copy; it is committed only if `f` succeeds and the
    /// result still satisfies every document invariant.
    pub async fn transact<T>(
        &self,
        id: DocumentId,
        f: impl FnOnce(&mut DocumentRecord) -> Result<T>,
    ) -> Result<T> {
        let cell = self.cell(id)?;
        let mut guard = self.acquire(id, &cell).await?;

        let mut working = (*guard).clone();
        let out = f(&mut working)?;
        working.check_invariants()?;
        working.version += 1;
        working.updated_at = self.clock.now();

        *cell.snapshot.write() = Arc::new(working.clone());
        *guard = working;
        Ok(out)
    }

    /// Drop a document after `check` approves it, under the document lock
    pub async fn remove(
        &self,
        id: DocumentId,
        check: impl FnOnce(&DocumentRecord) -> Result<()>,
    ) -> Result<DocumentRecord> {
        let cell = self.cell(id)?;
        let guard = self.acquire(id, &cell).await?;
        check(&guard)?;
        cell.destroyed.store(true, Ordering::Release);
        self.cells.remove(&id);
        Ok((*guard).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::StateConflict;
    use crate::types::{BlobRef, DocumentStatus, PageBounds, UserId};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn record() -> DocumentRecord {
        let owner = UserId::new();
        DocumentRecord {
            id: DocumentId::new(),
            title: "Lease".into(),
            description: String::new(),
            owner,
            editors: BTreeSet::from([owner]),
            original: BlobRef("00".into()),
            pages: vec![PageBounds::LETTER],
            status: DocumentStatus::Draft,
            fields: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 0,
        }
    }

    fn guard(timeout_ms: u64) -> DocumentGuard {
        DocumentGuard::new(Duration::from_millis(timeout_ms), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn failed_transition_leaves_no_trace() {
        let guard = guard(100);
        let doc = record();
        let id = doc.id;
        guard.insert(doc).unwrap();

        let result: Result<()> = guard
            .transact(id, |r| {
                r.title = "changed".into();
                Err(StateConflict::NoFields.into())
            })
            .await;
        assert!(result.is_err());

        let snap = guard.snapshot(id).unwrap();
        assert_eq!(snap.title, "Lease");
        assert_eq!(snap.version, 0);
    }

    #[tokio::test]
    async fn invariant_violation_rolls_back() {
        let guard = guard(100);
        let doc = record();
        let id = doc.id;
        guard.insert(doc).unwrap();

        let result = guard
            .transact(id, |r| {
                r.editors.clear();
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SignflowError::Validation(_))));
        assert_eq!(guard.snapshot(id).unwrap().editors.len(), 1);
    }

    #[tokio::test]
    async fn commit_bumps_version_and_publishes() {
        let guard = guard(100);
        let doc = record();
        let id = doc.id;
        guard.insert(doc).unwrap();

        guard
            .transact(id, |r| {
                r.title = "Lease v2".into();
                Ok(())
            })
            .await
            .unwrap();
        let snap = guard.snapshot(id).unwrap();
        assert_eq!(snap.title, "Lease v2");
        assert_eq!(snap.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn contended_lock_times_out() {
        let guard = Arc::new(guard(50));
        let doc = record();
        let id = doc.id;
        guard.insert(doc).unwrap();

        let holder = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                guard
                    .transact(id, |_| {
                        std::thread::sleep(Duration::from_millis(400));
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = guard.transact(id, |_| Ok(())).await;
        assert!(matches!(result, Err(SignflowError::LockTimeout { .. })));
        holder.await.unwrap().unwrap();
        assert_eq!(guard.snapshot(id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn removed_document_is_gone() {
        let guard = guard(100);
        let doc = record();
        let id = doc.id;
        guard.insert(doc).unwrap();

        guard.remove(id, |_| Ok(())).await.unwrap();
        assert!(guard.snapshot(id).is_none());
        assert!(matches!(
            guard.transact(id, |_| Ok(())).await,
            Err(SignflowError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let guard = guard(100);
        let doc = record();
        guard.insert(doc.clone()).unwrap();
        assert!(guard.insert(doc).is_err());
    }
}
