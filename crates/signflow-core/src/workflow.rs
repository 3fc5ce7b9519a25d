//! Document workflow engine
//!
//! Orchestrates the document lifecycle:
//! - creation, role management and field placement while in draft
//! - dispatch to assignees and per-field filling
//! - all-or-nothing finalization, voiding and destruction
//!
//! Every mutating operation resolves external collaborators first, then runs
//! a synchronous transition under the document's guard. Notifications and
//! audit entries are emitted only after a transition commits.

use crate::audit::AuditTrail;
use crate::binder;
use crate::clock::{Clock, SystemClock};
use crate::config::SignflowConfig;
use crate::document::{ContentField, DocumentRecord, FillContent, SentinelBlock};
use crate::error::{KeyError, Result, SignflowError, StateConflict, ValidationError};
use crate::guard::DocumentGuard;
use crate::keys::{FilePurgeQueue, KeyHandle, KeyManager, SignatureBlock};
use crate::placement::{self, FieldRequest};
use crate::ports::{
    BlobStore, ChannelNotifier, InMemoryBlobStore, InMemoryDirectory, NotificationEvent, NotificationSink,
    NullNotifier, UserDirectory, UserProfile,
};
use crate::state_machine::{validate_document_transition, validate_field_transition};
use crate::types::{
    Actor, BlobRef, DocumentId, DocumentStatus, FieldId, FieldState, PageBounds,
    SignatureBlockId, SignatureStyle, UserId,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Input for [`WorkflowEngine::create_document`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Original file bytes
    pub original: Vec<u8>,
    /// Page geometry; one letter page when empty
    pub pages: Vec<PageBounds>,
}

impl NewDocument {
    /// Single-page letter document
    #[must_use]
    pub fn new(title: impl Into<String>, original: impl Into<Vec<u8>>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            original: original.into(),
            pages: Vec::new(),
        }
    }

    /// With description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// With explicit pages
    #[must_use]
    pub fn with_pages(mut self, pages: Vec<PageBounds>) -> Self {
        self.pages = pages;
        self
    }
}

/// Outcome of voiding a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoidOutcome {
    /// Fields moved to void
    pub voided: usize,
    /// Finalized fields kept as they were
    pub retained: usize,
}

/// The signing workflow engine
pub struct WorkflowEngine {
    config: SignflowConfig,
    guard: DocumentGuard,
    keys: Arc<KeyManager>,
    directory: Arc<dyn UserDirectory>,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    audit: AuditTrail,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("documents", &self.guard.len())
            .field("audit_entries", &self.audit.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Engine with in-memory collaborators and the wall clock
    #[must_use]
    pub fn new(config: SignflowConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let audit = match config.workflow.audit_max_entries {
            Some(max) => AuditTrail::bounded(max),
            None => AuditTrail::new(),
        };
        Self {
            guard: DocumentGuard::new(config.lock_timeout(), Arc::clone(&clock)),
            config,
            keys: Arc::new(KeyManager::new()),
            directory: Arc::new(InMemoryDirectory::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            notifier: Arc::new(NullNotifier),
            clock,
            audit,
        }
    }

    /// Engine whose key manager uses the configured durable purge queue
    pub fn from_config(config: SignflowConfig) -> Result<Self> {
        config.validate()?;
        let engine = Self::new(config);
        match engine.config.keys.purge_queue_path.clone() {
            Some(path) => {
                let queue = FilePurgeQueue::open(path)?;
                let keys = KeyManager::with_parts(Arc::new(queue), Arc::clone(&engine.clock));
                Ok(engine.with_keys(Arc::new(keys)))
            }
            None => Ok(engine),
        }
    }

    /// With key manager
    #[must_use]
    pub fn with_keys(mut self, keys: Arc<KeyManager>) -> Self {
        self.keys = keys;
        self
    }

    /// With user directory
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// With blob store
    #[must_use]
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    /// With notification sink
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Deliver notifications into a bounded channel sized by
    /// `notify.channel_capacity`; returns the receiving end
    #[must_use]
    pub fn with_channel_notifier(
        self,
    ) -> (Self, mpsc::Receiver<(UserId, NotificationEvent)>) {
        let (notifier, rx) = ChannelNotifier::new(self.config.notify.channel_capacity);
        (self.with_notifier(Arc::new(notifier)), rx)
    }

    /// With clock; must be called before any document exists
    ///
    /// The key manager keeps its own clock, see [`KeyManager::with_parts`].
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.guard = DocumentGuard::new(self.config.lock_timeout(), Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &SignflowConfig {
        &self.config
    }

    /// Key manager
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Audit trail
    #[must_use]
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    async fn resolve(&self, user: UserId) -> Result<UserProfile> {
        self.directory
            .resolve_user(user)
            .await?
            .ok_or_else(|| ValidationError::UnknownUser(user).into())
    }

    fn record(&self, document: DocumentId, actor: UserId, action: &str, detail: impl Into<String>) {
        self.audit
            .record(self.clock.now(), document, actor, action, detail);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a draft document owned by `owner`
    ///
    /// The original is stored before any document state exists.
    #[tracing::instrument(skip_all, fields(%owner, title = %new.title))]
    pub async fn create_document(&self, owner: UserId, new: NewDocument) -> Result<DocumentRecord> {
        self.resolve(owner).await?;
        let pages = if new.pages.is_empty() {
            vec![PageBounds::LETTER]
        } else {
            new.pages
        };
        if let Some(bad) = pages
            .iter()
            .find(|p| !(p.width.is_finite() && p.height.is_finite() && p.width > 0.0 && p.height > 0.0))
        {
            return Err(ValidationError::InvalidDocument(format!(
                "page size {}x{} is not positive",
                bad.width, bad.height
            ))
            .into());
        }

        let original = self.blobs.store_content(new.original).await?;
        let now = self.clock.now();
        let record = DocumentRecord {
            id: DocumentId::new(),
            title: new.title,
            description: new.description,
            owner,
            editors: BTreeSet::from([owner]),
            original,
            pages,
            status: DocumentStatus::Draft,
            fields: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.guard.insert(record.clone())?;
        self.record(record.id, owner, "create_document", record.original.0.clone());
        tracing::info!(document = %record.id, "document created");
        Ok(record)
    }

    /// Rehydrate a persisted document
    ///
    /// Structural invariants are checked; field states are taken as given.
    #[tracing::instrument(skip_all, fields(document = %record.id))]
    pub fn import_document(&self, record: DocumentRecord) -> Result<()> {
        let (id, owner) = (record.id, record.owner);
        self.guard.insert(record)?;
        self.record(id, owner, "import_document", "");
        tracing::info!("document imported");
        Ok(())
    }

    /// Move a draft to awaiting signatures and notify every assignee
    #[tracing::instrument(skip_all, fields(%document, actor = %actor.user))]
    pub async fn send_for_signatures(&self, actor: Actor, document: DocumentId) -> Result<()> {
        let assigned = self
            .guard
            .transact(document, |r| {
                require_owner(r, actor)?;
                validate_document_transition(r.status, DocumentStatus::AwaitingSignatures)?;
                let live: Vec<&SentinelBlock> = r.live_fields().collect();
                if live.is_empty() {
                    return Err(StateConflict::NoFields.into());
                }
                if let Some(stray) = live.iter().find(|f| !r.is_editor_or_owner(f.assignee)) {
                    return Err(ValidationError::UnauthorizedAssignee(stray.assignee).into());
                }
                let assigned: Vec<_> = live
                    .iter()
                    .map(|f| (f.assignee, f.id, f.block_type))
                    .collect();
                r.status = DocumentStatus::AwaitingSignatures;
                Ok(assigned)
            })
            .await?;

        for (user, field, block_type) in &assigned {
            self.notifier.notify(
                *user,
                NotificationEvent::FieldAssigned {
                    document,
                    field: *field,
                    block_type: *block_type,
                },
            );
        }
        self.record(document, actor.user, "send_for_signatures", format!("{} fields", assigned.len()));
        tracing::info!(fields = assigned.len(), "sent for signatures");
        Ok(())
    }

    /// Finalize every filled field and complete the document
    #[tracing::instrument(skip_all, fields(%document, actor = %actor.user))]
    pub async fn finalize_document(&self, actor: Actor, document: DocumentId) -> Result<usize> {
        self.finalize(actor, document, None).await
    }

    /// Finalize starting from one field; commits the whole document
    #[tracing::instrument(skip_all, fields(%document, %field, actor = %actor.user))]
    pub async fn finalize_field(
        &self,
        actor: Actor,
        document: DocumentId,
        field: FieldId,
    ) -> Result<usize> {
        self.finalize(actor, document, Some(field)).await
    }

    async fn finalize(
        &self,
        actor: Actor,
        document: DocumentId,
        field: Option<FieldId>,
    ) -> Result<usize> {
        let clock = Arc::clone(&self.clock);
        let (count, editors) = self
            .guard
            .transact(document, |r| {
                require_owner(r, actor)?;
                if let Some(field) = field {
                    if r.field(field).is_none() {
                        return Err(SignflowError::FieldNotFound { document, field });
                    }
                }
                let count = binder::finalize_document(r, clock.now())?;
                Ok((count, r.editors.clone()))
            })
            .await?;

        for user in editors {
            self.notifier
                .notify(user, NotificationEvent::DocumentCompleted { document });
        }
        self.record(document, actor.user, "finalize", format!("{count} fields"));
        tracing::info!(fields = count, "document completed");
        Ok(count)
    }

    /// Void the document; finalized fields are retained
    #[tracing::instrument(skip_all, fields(%document, actor = %actor.user))]
    pub async fn void_document(&self, actor: Actor, document: DocumentId) -> Result<VoidOutcome> {
        let (outcome, editors) = self
            .guard
            .transact(document, |r| {
                require_owner(r, actor)?;
                validate_document_transition(r.status, DocumentStatus::Voided)?;
                let mut outcome = VoidOutcome {
                    voided: 0,
                    retained: 0,
                };
                for field in &mut r.fields {
                    match field.state {
                        FieldState::Pending | FieldState::Filled => {
                            validate_field_transition(field.state, FieldState::Void)?;
                            field.state = FieldState::Void;
                            outcome.voided += 1;
                        }
                        FieldState::Finalized => outcome.retained += 1,
                        FieldState::Void => {}
                    }
                }
                r.status = DocumentStatus::Voided;
                Ok((outcome, r.editors.clone()))
            })
            .await?;

        for user in editors {
            self.notifier
                .notify(user, NotificationEvent::DocumentVoided { document });
        }
        self.record(
            document,
            actor.user,
            "void_document",
            format!("voided {} retained {}", outcome.voided, outcome.retained),
        );
        tracing::info!(voided = outcome.voided, retained = outcome.retained, "document voided");
        Ok(outcome)
    }

    /// Remove the document and everything it owns
    #[tracing::instrument(skip_all, fields(%document, actor = %actor.user))]
    pub async fn destroy_document(&self, actor: Actor, document: DocumentId) -> Result<DocumentRecord> {
        let removed = self
            .guard
            .remove(document, |r| Ok(require_owner(r, actor)?))
            .await?;
        self.record(
            document,
            actor.user,
            "destroy_document",
            format!("{} fields", removed.fields.len()),
        );
        tracing::info!("document destroyed");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    /// Grant editor rights; returns false if `user` already was an editor
    #[tracing::instrument(skip_all, fields(%document, %user, actor = %actor.user))]
    pub async fn add_editor(&self, actor: Actor, document: DocumentId, user: UserId) -> Result<bool> {
        self.resolve(user).await?;
        let added = self
            .guard
            .transact(document, |r| {
                require_owner(r, actor)?;
                require_draft(r)?;
                Ok(r.editors.insert(user))
            })
            .await?;
        if added {
            self.record(document, actor.user, "add_editor", user.to_string());
            tracing::info!("editor added");
        }
        Ok(added)
    }

    /// Revoke editor rights
    #[tracing::instrument(skip_all, fields(%document, %user, actor = %actor.user))]
    pub async fn remove_editor(&self, actor: Actor, document: DocumentId, user: UserId) -> Result<()> {
        self.guard
            .transact(document, |r| {
                require_owner(r, actor)?;
                require_draft(r)?;
                if user == r.owner {
                    return Err(ValidationError::CannotRemoveOwner.into());
                }
                if r
                    .fields
                    .iter()
                    .any(|f| f.assignee == user && f.state == FieldState::Pending)
                {
                    return Err(ValidationError::EditorHasAssignedFields(user).into());
                }
                if !r.editors.remove(&user) {
                    return Err(ValidationError::NotEditor(user).into());
                }
                Ok(())
            })
            .await?;
        self.record(document, actor.user, "remove_editor", user.to_string());
        tracing::info!("editor removed");
        Ok(())
    }

    /// Hand the document to `new_owner`; the previous owner stays an editor
    #[tracing::instrument(skip_all, fields(%document, %new_owner, actor = %actor.user))]
    pub async fn transfer_ownership(
        &self,
        actor: Actor,
        document: DocumentId,
        new_owner: UserId,
    ) -> Result<()> {
        self.resolve(new_owner).await?;
        let previous = self
            .guard
            .transact(document, |r| {
                require_owner(r, actor)?;
                require_draft(r)?;
                let previous = r.owner;
                r.editors.insert(new_owner);
                r.owner = new_owner;
                Ok(previous)
            })
            .await?;

        self.notifier
            .notify(new_owner, NotificationEvent::OwnershipTransferred { document });
        self.record(
            document,
            actor.user,
            "transfer_ownership",
            format!("{previous} -> {new_owner}"),
        );
        tracing::info!(%previous, "ownership transferred");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    /// Place a field on a draft document
    #[tracing::instrument(skip_all, fields(%document, actor = %actor.user, block_type = %request.block_type))]
    pub async fn place_field(
        &self,
        actor: Actor,
        document: DocumentId,
        request: FieldRequest,
    ) -> Result<SentinelBlock> {
        let clock = Arc::clone(&self.clock);
        let block = self
            .guard
            .transact(document, |r| {
                require_editor(r, actor)?;
                placement::place_field(r, request, clock.now())
            })
            .await?;
        self.record(document, actor.user, "place_field", block.id.to_string());
        tracing::info!(field = %block.id, assignee = %block.assignee, "field placed");
        Ok(block)
    }

    /// Void a pending field on a draft document
    #[tracing::instrument(skip_all, fields(%document, %field, actor = %actor.user))]
    pub async fn remove_field(
        &self,
        actor: Actor,
        document: DocumentId,
        field: FieldId,
    ) -> Result<SentinelBlock> {
        let block = self
            .guard
            .transact(document, |r| {
                require_editor(r, actor)?;
                placement::remove_field(r, field)
            })
            .await?;
        self.record(document, actor.user, "remove_field", field.to_string());
        tracing::info!("field removed");
        Ok(block)
    }

    /// Fill a pending field as `filler`
    ///
    /// Content is validated and its artifact stored before the document lock
    /// is taken; the lock is held only for the state transition itself.
    #[tracing::instrument(skip_all, fields(%document, %field, %filler))]
    pub async fn fill_field(
        &self,
        filler: UserId,
        document: DocumentId,
        field: FieldId,
        content: FillContent,
    ) -> Result<ContentField> {
        let signature_block = match content {
            FillContent::Signature => self.keys.signature_block_for(filler),
            FillContent::Text(_) => None,
        };
        let content = binder::prepare_content(
            filler,
            content,
            signature_block.as_ref(),
            self.config.workflow.max_text_bytes,
        )?;
        let artifact = self.store_artifact(&content).await?;

        let keys = Arc::clone(&self.keys);
        let clock = Arc::clone(&self.clock);
        let filled = self
            .guard
            .transact(document, |r| {
                binder::fill_field(r, field, filler, content, Some(artifact), &keys, clock.now())
            })
            .await?;
        self.record(document, filler, "fill_field", filled.commitment.digest.clone());
        tracing::info!(content_field = %filled.id, "field filled");
        Ok(filled)
    }

    async fn store_artifact(&self, content: &crate::document::FieldContent) -> Result<BlobRef> {
        let bytes = serde_json::to_vec(content)
            .map_err(|e| ValidationError::InvalidDocument(format!("unencodable content: {e}")))?;
        Ok(self.blobs.store_content(bytes).await?)
    }

    // ------------------------------------------------------------------
    // Queries (snapshot reads, never take the document lock)
    // ------------------------------------------------------------------

    /// Latest committed document state
    #[must_use]
    pub fn document(&self, document: DocumentId) -> Option<Arc<DocumentRecord>> {
        self.guard.snapshot(document)
    }

    fn snapshot(&self, document: DocumentId) -> Result<Arc<DocumentRecord>> {
        self.guard
            .snapshot(document)
            .ok_or(SignflowError::DocumentNotFound(document))
    }

    /// All fields in placement order
    pub fn fields(&self, document: DocumentId) -> Result<Vec<SentinelBlock>> {
        Ok(self.snapshot(document)?.fields.clone())
    }

    /// One field
    pub fn field(&self, document: DocumentId, field: FieldId) -> Result<SentinelBlock> {
        self.snapshot(document)?
            .field(field)
            .cloned()
            .ok_or(SignflowError::FieldNotFound { document, field })
    }

    /// Lifecycle status
    pub fn status(&self, document: DocumentId) -> Result<DocumentStatus> {
        Ok(self.snapshot(document)?.status)
    }

    /// Whether `user` may be assigned fields on the document
    pub fn is_editor_or_owner(&self, document: DocumentId, user: UserId) -> Result<bool> {
        Ok(self.snapshot(document)?.is_editor_or_owner(user))
    }

    /// Check a filled field against its commitment and signing key
    pub fn verify_field(&self, document: DocumentId, field: FieldId) -> Result<()> {
        let record = self.snapshot(document)?;
        binder::verify_field(&record, field, &self.keys)
    }

    /// Fetch a document's original bytes
    pub async fn original(&self, document: DocumentId) -> Result<Vec<u8>> {
        let blob = self.snapshot(document)?.original.clone();
        Ok(self.blobs.fetch_content(&blob).await?)
    }

    // ------------------------------------------------------------------
    // Signing identities
    // ------------------------------------------------------------------

    /// Create the user's signature block, rendered with their display name
    #[tracing::instrument(skip_all, fields(%user))]
    pub async fn create_signature_block(
        &self,
        user: UserId,
        style: SignatureStyle,
    ) -> Result<SignatureBlock> {
        let profile = self.resolve(user).await?;
        Ok(self
            .keys
            .create_signature_block(user, style, profile.display_name)?)
    }

    /// Issue the first key on the user's block
    ///
    /// # Errors
    /// - `KeyError::NoSignatureBlock` until the user has created a block
    pub fn issue_key(&self, user: UserId) -> Result<KeyHandle> {
        let block = self.block_of(user)?;
        Ok(self.keys.issue_key(block)?)
    }

    /// Rotate the user's key and schedule the retired one for purge
    ///
    /// `grace_secs` defaults to the configured grace period. Retiring the
    /// old key and queueing its purge happen together or not at all.
    #[tracing::instrument(skip(self))]
    pub fn rotate_key(&self, user: UserId, grace_secs: Option<u64>) -> Result<KeyHandle> {
        let block = self.block_of(user)?;
        let grace = grace_secs.unwrap_or(self.config.keys.default_grace_secs);
        let (handle, _) = self.keys.rotate_and_schedule(block, grace)?;
        Ok(handle)
    }

    fn block_of(&self, user: UserId) -> Result<SignatureBlockId> {
        Ok(self
            .keys
            .signature_block_for(user)
            .ok_or(KeyError::NoSignatureBlock(user))?
            .id)
    }
}

fn require_owner(record: &DocumentRecord, actor: Actor) -> Result<(), ValidationError> {
    if actor.admin || record.owner == actor.user {
        Ok(())
    } else {
        Err(ValidationError::NotOwner(actor.user))
    }
}

fn require_editor(record: &DocumentRecord, actor: Actor) -> Result<(), ValidationError> {
    if actor.admin || record.is_editor_or_owner(actor.user) {
        Ok(())
    } else {
        Err(ValidationError::NotEditor(actor.user))
    }
}

fn require_draft(record: &DocumentRecord) -> Result<(), StateConflict> {
    if record.status == DocumentStatus::Draft {
        Ok(())
    } else {
        Err(StateConflict::DocumentLocked(record.status))
    }
}
