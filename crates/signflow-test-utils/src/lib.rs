//! Testing utilities for the signflow workspace
//!
//! Shared fixtures: an engine wired to in-memory collaborators and a manual
//! clock, plus helpers for users, signers, and documents.

#![allow(missing_docs)]

use chrono::Utc;
use signflow_core::{
    Actor, BlobRef, BoundingBox, DocumentId, DocumentRecord, DocumentStatus, FieldRequest,
    InMemoryBlobStore, InMemoryDirectory, InMemoryPurgeQueue, KeyManager, ManualClock,
    NewDocument, PageBounds, RecordingNotifier, SentinelBlock, SignatureStyle, SignflowConfig,
    UserId, WorkflowEngine,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Engine plus handles on every collaborator it was built with
pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub directory: Arc<InMemoryDirectory>,
    pub notifier: Arc<RecordingNotifier>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub keys: Arc<KeyManager>,
    pub queue: Arc<InMemoryPurgeQueue>,
    pub clock: Arc<ManualClock>,
    pub owner: UserId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SignflowConfig::default())
    }

    pub fn with_config(config: SignflowConfig) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let queue = Arc::new(InMemoryPurgeQueue::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keys = Arc::new(KeyManager::with_parts(queue.clone(), clock.clone()));
        let owner = directory.register("Olivia Owner");

        let engine = WorkflowEngine::new(config)
            .with_clock(clock.clone())
            .with_keys(keys.clone())
            .with_directory(directory.clone())
            .with_blob_store(blobs.clone())
            .with_notifier(notifier.clone());

        Self {
            engine: Arc::new(engine),
            directory,
            notifier,
            blobs,
            keys,
            queue,
            clock,
            owner,
        }
    }

    pub fn owner_actor(&self) -> Actor {
        Actor::user(self.owner)
    }

    /// Register a user with no signing identity
    pub fn user(&self, name: &str) -> UserId {
        self.directory.register(name)
    }

    /// Register a user with a signature block and an active key
    pub async fn signer(&self, name: &str) -> UserId {
        let user = self.directory.register(name);
        self.engine
            .create_signature_block(user, SignatureStyle::default())
            .await
            .unwrap();
        self.engine.issue_key(user).unwrap();
        user
    }

    /// Draft document owned by the harness owner, with `editors` added
    pub async fn draft(&self, title: &str, editors: &[UserId]) -> DocumentId {
        let doc = self
            .engine
            .create_document(self.owner, NewDocument::new(title, format!("%PDF {title}")))
            .await
            .unwrap();
        for editor in editors {
            self.engine
                .add_editor(self.owner_actor(), doc.id, *editor)
                .await
                .unwrap();
        }
        doc.id
    }

    /// Place a SIGNATURE field for `assignee` in slot `slot`
    pub async fn signature_field(&self, doc: DocumentId, assignee: UserId, slot: u32) -> SentinelBlock {
        self.engine
            .place_field(self.owner_actor(), doc, FieldRequest::signature(assignee, slot_bbox(slot)))
            .await
            .unwrap()
    }

    /// Place a TEXT field for `assignee` in slot `slot`
    pub async fn text_field(&self, doc: DocumentId, assignee: UserId, slot: u32) -> SentinelBlock {
        self.engine
            .place_field(self.owner_actor(), doc, FieldRequest::text(assignee, slot_bbox(slot)))
            .await
            .unwrap()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Stacked, non-overlapping regions on the first letter page
pub fn slot_bbox(slot: u32) -> BoundingBox {
    let row = f64::from(slot % 15);
    BoundingBox::new(0, 72.0, 40.0 + row * 48.0, 200.0, 40.0)
}

/// Bare draft record owned by `owner`, for import tests
pub fn draft_record(owner: UserId, editors: &[UserId]) -> DocumentRecord {
    let mut members: BTreeSet<UserId> = editors.iter().copied().collect();
    members.insert(owner);
    let now = Utc::now();
    DocumentRecord {
        id: DocumentId::new(),
        title: "Imported".into(),
        description: String::new(),
        owner,
        editors: members,
        original: BlobRef("00".repeat(32)),
        pages: vec![PageBounds::LETTER],
        status: DocumentStatus::Draft,
        fields: Vec::new(),
        created_at: now,
        updated_at: now,
        version: 0,
    }
}
