//! Document records
//!
//! A [`DocumentRecord`] owns its sentinel blocks and their content fields;
//! destroying the record destroys them. Records are plain values: the guard
//! hands a transition a private copy and publishes it only on success.

use crate::error::ValidationError;
use crate::keys::KeySignature;
use crate::placement::validate_region;
use crate::types::{
    BlobRef, BlockType, BoundingBox, ContentFieldId, DocumentId, DocumentStatus, FieldId,
    FieldState, PageBounds, SignatureBlockId, SignatureStyle, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Something a content field can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
#[non_exhaustive]
pub enum Contentable {
    /// A placed sentinel block
    SentinelBlock(FieldId),
}

/// Content supplied by a filler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FillContent {
    /// Free text for a TEXT field
    Text(String),
    /// Apply the filler's signature block to a SIGNATURE field
    Signature,
}

/// Content as bound to a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldContent {
    /// Text body
    Text {
        /// Body
        body: String,
    },
    /// Rendered signature
    Signature {
        /// Signature block applied
        signature_block: SignatureBlockId,
        /// Rendered text
        body: String,
        /// Font and ink
        style: SignatureStyle,
    },
}

/// Cryptographic commitment to a filled field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    /// SHA-256 of the canonical field message, hex encoded
    pub digest: String,
    /// Signature over the digest (SIGNATURE fields)
    pub signature: Option<KeySignature>,
}

/// Filled instantiation of a contentable entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentField {
    /// Content field id
    pub id: ContentFieldId,
    /// What the content fills
    pub contentable: Contentable,
    /// Owning document
    pub document: DocumentId,
    /// Who filled it
    pub assignee: UserId,
    /// Page region
    pub bbox: BoundingBox,
    /// Supplied content
    pub content: FieldContent,
    /// Stored artifact, if any
    pub artifact: Option<BlobRef>,
    /// Commitment to the content
    pub commitment: Commitment,
    /// Fill time
    pub filled_at: DateTime<Utc>,
    /// Finalization time
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Placeholder field on a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelBlock {
    /// Field id
    pub id: FieldId,
    /// Owning document
    pub document: DocumentId,
    /// Kind
    pub block_type: BlockType,
    /// Human-readable label
    pub placeholder: String,
    /// Expected filler
    pub assignee: UserId,
    /// Page region
    pub bbox: BoundingBox,
    /// Lifecycle state
    pub state: FieldState,
    /// Content once filled
    pub content: Option<ContentField>,
    /// Placement time
    pub placed_at: DateTime<Utc>,
}

/// Complete state of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document id
    pub id: DocumentId,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Sole owner
    pub owner: UserId,
    /// Collaborators; always contains the owner
    pub editors: BTreeSet<UserId>,
    /// Original content
    pub original: BlobRef,
    /// Page geometry
    pub pages: Vec<PageBounds>,
    /// Lifecycle status
    pub status: DocumentStatus,
    /// Fields in placement order
    pub fields: Vec<SentinelBlock>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last committed change
    pub updated_at: DateTime<Utc>,
    /// Incremented on every committed transition
    pub version: u64,
}

impl DocumentRecord {
    /// Whether `user` is the owner or an editor
    #[inline]
    #[must_use]
    pub fn is_editor_or_owner(&self, user: UserId) -> bool {
        self.owner == user || self.editors.contains(&user)
    }

    /// Look up a field
    #[must_use]
    pub fn field(&self, id: FieldId) -> Option<&SentinelBlock> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Look up a field mutably
    pub fn field_mut(&mut self, id: FieldId) -> Option<&mut SentinelBlock> {
        self.fields.iter_mut().find(|f| f.id == id)
    }

    /// Fields that count toward completion
    pub fn live_fields(&self) -> impl Iterator<Item = &SentinelBlock> {
        self.fields.iter().filter(|f| f.state.is_live())
    }

    /// Number of fields in `state`
    #[must_use]
    pub fn count_in(&self, state: FieldState) -> usize {
        self.fields.iter().filter(|f| f.state == state).count()
    }

    /// Check every structural invariant
    pub fn check_invariants(&self) -> Result<(), ValidationError> {
        if !self.editors.contains(&self.owner) {
            return Err(ValidationError::InvalidDocument(format!(
                "owner {} is not in the editor set",
                self.owner
            )));
        }
        if self.pages.is_empty() {
            return Err(ValidationError::InvalidDocument("document has no pages".into()));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !seen.insert(field.id) {
                return Err(ValidationError::InvalidDocument(format!(
                    "duplicate field {}",
                    field.id
                )));
            }
            if field.document != self.id {
                return Err(ValidationError::InvalidDocument(format!(
                    "field {} belongs to another document",
                    field.id
                )));
            }
            validate_region(&self.pages, &field.bbox)?;
            let needs_content = matches!(field.state, FieldState::Filled | FieldState::Finalized);
            if needs_content != field.content.is_some() && field.state != FieldState::Void {
                return Err(ValidationError::InvalidDocument(format!(
                    "field {} is {} but content presence is {}",
                    field.id,
                    field.state,
                    field.content.is_some()
                )));
            }
            if field.state == FieldState::Pending && !self.is_editor_or_owner(field.assignee) {
                return Err(ValidationError::UnauthorizedAssignee(field.assignee));
            }
        }
        Ok(())
    }
}
