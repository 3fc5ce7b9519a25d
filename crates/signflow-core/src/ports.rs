//! External collaborators
//!
//! The engine consumes, but does not implement, a user directory, a blob
//! store, and a notification sink. In-memory implementations ship here for
//! embedding and tests.

use crate::error::SignflowError;
use crate::types::{BlobRef, BlockType, DocumentId, FieldId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Transient failure of an external service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service}: {reason}")]
pub struct ServiceError {
    /// Which collaborator failed
    pub service: &'static str,
    /// Failure description
    pub reason: String,
}

impl ServiceError {
    /// Create a service error
    #[must_use]
    pub fn new(service: &'static str, reason: impl Into<String>) -> Self {
        Self {
            service,
            reason: reason.into(),
        }
    }
}

impl From<ServiceError> for SignflowError {
    fn from(value: ServiceError) -> Self {
        SignflowError::StorageUnavailable(value.to_string())
    }
}

/// Resolved user identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id
    pub id: UserId,
    /// Name shown on signatures
    pub display_name: String,
}

/// User directory
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user; `Ok(None)` when the user does not exist
    async fn resolve_user(&self, id: UserId) -> Result<Option<UserProfile>, ServiceError>;
}

/// Blob store for document originals and filled field artifacts
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning a content-addressed reference
    async fn store_content(&self, bytes: Vec<u8>) -> Result<BlobRef, ServiceError>;

    /// Fetch previously stored bytes
    async fn fetch_content(&self, blob: &BlobRef) -> Result<Vec<u8>, ServiceError>;
}

/// Workflow events delivered to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A field awaits the user
    FieldAssigned {
        /// Document
        document: DocumentId,
        /// Field
        field: FieldId,
        /// Field kind
        block_type: BlockType,
    },
    /// Every field was finalized
    DocumentCompleted {
        /// Document
        document: DocumentId,
    },
    /// The owner voided the document
    DocumentVoided {
        /// Document
        document: DocumentId,
    },
    /// The user now owns the document
    OwnershipTransferred {
        /// Document
        document: DocumentId,
    },
}

/// Fire-and-forget notification sink; must never block
pub trait NotificationSink: Send + Sync {
    /// Deliver (best effort)
    fn notify(&self, user: UserId, event: NotificationEvent);
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _user: UserId, _event: NotificationEvent) {}
}

/// Sink that forwards into a bounded tokio channel, dropping on overflow
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<(UserId, NotificationEvent)>,
}

impl ChannelNotifier {
    /// Create notifier and the receiving end
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(UserId, NotificationEvent)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, user: UserId, event: NotificationEvent) {
        if let Err(e) = self.tx.try_send((user, event)) {
            tracing::warn!(%user, "notification dropped: {}", e);
        }
    }
}

/// Sink that records every event
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(UserId, NotificationEvent)>>,
}

impl RecordingNotifier {
    /// Create empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far
    #[must_use]
    pub fn events(&self) -> Vec<(UserId, NotificationEvent)> {
        self.events.lock().clone()
    }

    /// Events addressed to one user
    #[must_use]
    pub fn events_for(&self, user: UserId) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, user: UserId, event: NotificationEvent) {
        self.events.lock().push((user, event));
    }
}

/// In-memory user directory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, UserProfile>,
}

impl InMemoryDirectory {
    /// Create empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user, returning its id
    pub fn register(&self, display_name: impl Into<String>) -> UserId {
        let id = UserId::new();
        self.users.insert(
            id,
            UserProfile {
                id,
                display_name: display_name.into(),
            },
        );
        id
    }

    /// Remove a user
    pub fn remove(&self, id: UserId) {
        self.users.remove(&id);
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn resolve_user(&self, id: UserId) -> Result<Option<UserProfile>, ServiceError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }
}

/// In-memory content-addressed blob store with a fault switch
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<BlobRef, Vec<u8>>,
    failing: AtomicBool,
}

impl InMemoryBlobStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until turned off
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored blobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn check(&self) -> Result<(), ServiceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ServiceError::new("blob store", "unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store_content(&self, bytes: Vec<u8>) -> Result<BlobRef, ServiceError> {
        self.check()?;
        let blob = BlobRef(hex::encode(Sha256::digest(&bytes)));
        self.blobs.insert(blob.clone(), bytes);
        Ok(blob)
    }

    async fn fetch_content(&self, blob: &BlobRef) -> Result<Vec<u8>, ServiceError> {
        self.check()?;
        self.blobs
            .get(blob)
            .map(|b| b.value().clone())
            .ok_or_else(|| ServiceError::new("blob store", format!("missing blob {blob}")))
    }
}
