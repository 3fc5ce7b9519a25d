//! Error types for signflow
//!
//! Errors are grouped by how a caller should react:
//! - Validation errors are surfaced verbatim and never retried
//! - State conflicts may be retried after re-reading state
//! - Key errors require the signer to issue or rotate a key first
//! - Storage and lock timeouts are transient and safe to retry

use crate::types::{DocumentId, DocumentStatus, FieldId, FieldState, KeyId, SignatureBlockId, UserId};

/// Main signflow error type
#[derive(Debug, thiserror::Error)]
pub enum SignflowError {
    /// Bad input
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Wrong field/document state for the requested operation
    #[error("state conflict: {0}")]
    StateConflict(#[from] StateConflict),

    /// Key lifecycle error
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Blob store failure
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Document lock could not be acquired in time
    #[error("lock on document {document} not acquired within {waited_ms}ms")]
    LockTimeout {
        /// Contended document
        document: DocumentId,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Document does not exist
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    /// Field does not exist on the document
    #[error("field {field} not found on document {document}")]
    FieldNotFound {
        /// Owning document
        document: DocumentId,
        /// Missing field
        field: FieldId,
    },

    /// Stored content no longer matches its commitment
    #[error("field {field} on document {document} does not match its commitment")]
    IntegrityViolation {
        /// Owning document
        document: DocumentId,
        /// Tampered field
        field: FieldId,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input
    Validation,
    /// Wrong state
    StateConflict,
    /// Key lifecycle
    Key,
    /// Blob store
    Storage,
    /// Lock contention
    LockTimeout,
    /// Missing entity
    NotFound,
    /// Commitment mismatch
    Integrity,
    /// Configuration
    Config,
}

impl SignflowError {
    /// Classify the error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::StateConflict(_) => ErrorCategory::StateConflict,
            Self::Key(_) => ErrorCategory::Key,
            Self::StorageUnavailable(_) => ErrorCategory::Storage,
            Self::LockTimeout { .. } => ErrorCategory::LockTimeout,
            Self::DocumentNotFound(_) | Self::FieldNotFound { .. } => ErrorCategory::NotFound,
            Self::IntegrityViolation { .. } => ErrorCategory::Integrity,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Check if the whole operation can be retried as-is
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::LockTimeout { .. })
    }
}

/// Input validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Bounding box outside the page or malformed
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// Assignee is neither an editor nor the owner
    #[error("user {0} is not an editor or owner of the document")]
    UnauthorizedAssignee(UserId),

    /// Filler is not the field's assignee
    #[error("field is assigned to {expected}, not {actual}")]
    AssigneeMismatch {
        /// Bound assignee
        expected: UserId,
        /// Caller
        actual: UserId,
    },

    /// User directory does not know the user
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    /// Content kind does not match the block type
    #[error("content kind does not match {0} field")]
    ContentKindMismatch(crate::types::BlockType),

    /// Empty text content
    #[error("content is empty")]
    EmptyContent,

    /// Text content over the configured limit
    #[error("content is {size} bytes, limit is {limit}")]
    ContentTooLarge {
        /// Supplied size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Operation reserved for the owner (or an admin)
    #[error("user {0} is not the document owner")]
    NotOwner(UserId),

    /// Operation reserved for editors and the owner
    #[error("user {0} is not an editor of the document")]
    NotEditor(UserId),

    /// Owner cannot be removed from the editor set
    #[error("the owner cannot be removed from the editors")]
    CannotRemoveOwner,

    /// Editor still assigned to live fields
    #[error("user {0} still has assigned fields")]
    EditorHasAssignedFields(UserId),

    /// User already owns a signature block
    #[error("user {0} already has a signature block")]
    SignatureBlockExists(UserId),

    /// Imported or created document violates an invariant
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// State conflicts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateConflict {
    /// Field is no longer pending
    #[error("field {field} is {state}, not pending")]
    FieldAlreadyFilled {
        /// Field
        field: FieldId,
        /// Current state
        state: FieldState,
    },

    /// Document roles/fields are locked in its current status
    #[error("document is locked while {0}")]
    DocumentLocked(DocumentStatus),

    /// Fields can only be filled while awaiting signatures
    #[error("document is {0}, not awaiting signatures")]
    NotAwaitingSignatures(DocumentStatus),

    /// Finalize attempted before every field was filled
    #[error("{filled} of {total} fields filled")]
    NotAllFieldsFilled {
        /// Filled fields
        filled: usize,
        /// Live fields
        total: usize,
    },

    /// Field state machine violation
    #[error("illegal field transition {from} -> {to}")]
    IllegalFieldTransition {
        /// Current state
        from: FieldState,
        /// Requested state
        to: FieldState,
    },

    /// Document state machine violation
    #[error("illegal document transition {from} -> {to}")]
    IllegalDocumentTransition {
        /// Current status
        from: DocumentStatus,
        /// Requested status
        to: DocumentStatus,
    },

    /// Document has no live fields
    #[error("document has no fields")]
    NoFields,
}

/// Key lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Active key already present
    #[error("signature block {0} already has an active key")]
    KeyConflict(SignatureBlockId),

    /// No key to sign with
    #[error("no active key for signer {0}")]
    NoActiveKey(UserId),

    /// Key is in the wrong state for the operation
    #[error("key {key} is {state}")]
    InvalidKeyState {
        /// Key
        key: KeyId,
        /// Current state name
        state: &'static str,
    },

    /// Key id not known
    #[error("unknown key: {0}")]
    UnknownKey(KeyId),

    /// Key has been purged
    #[error("key {0} has been purged")]
    KeyPurged(KeyId),

    /// Signature does not verify
    #[error("signature does not verify under key {0}")]
    SignatureMismatch(KeyId),

    /// Signature block id not known
    #[error("unknown signature block: {0}")]
    UnknownSignatureBlock(SignatureBlockId),

    /// User has not created a signature block yet
    #[error("user {0} has no signature block")]
    NoSignatureBlock(UserId),

    /// Purge queue persistence failure
    #[error("purge queue error: {0}")]
    Queue(String),
}

/// Result alias
pub type Result<T, E = SignflowError> = std::result::Result<T, E>;
