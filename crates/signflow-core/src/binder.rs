//! Signature binding
//!
//! Fills pending fields with content bound to a commitment, and finalizes a
//! document's fields all at once.
//!
//! The commitment digest covers the document, the field, the assignee, the
//! region, the content, and the fill time. SIGNATURE fields additionally
//! carry an ed25519 signature over the digest made with the assignee's active
//! key.

use crate::document::{Commitment, ContentField, Contentable, DocumentRecord, FieldContent, FillContent};
use crate::error::{Result, SignflowError, StateConflict, ValidationError};
use crate::keys::{KeyManager, SignatureBlock};
use crate::state_machine::{validate_document_transition, validate_field_transition};
use crate::types::{
    BlobRef, BlockType, BoundingBox, ContentFieldId, DocumentId, DocumentStatus, FieldId,
    FieldState, UserId,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Digest of everything a filled field commits to
#[must_use]
pub fn commitment_digest(
    document: DocumentId,
    field: FieldId,
    assignee: UserId,
    bbox: &BoundingBox,
    content: &FieldContent,
    filled_at: DateTime<Utc>,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"signflow.field.v1");
    hasher.update(document.0.as_bytes());
    hasher.update(field.0.as_bytes());
    hasher.update(assignee.0.as_bytes());
    hasher.update(bbox.page.to_le_bytes());
    for c in [bbox.x, bbox.y, bbox.width, bbox.height] {
        hasher.update(c.to_bits().to_le_bytes());
    }
    match content {
        FieldContent::Text { body } => {
            hasher.update([0u8]);
            hasher.update(body.as_bytes());
        }
        FieldContent::Signature {
            signature_block,
            body,
            style,
        } => {
            hasher.update([1u8]);
            hasher.update(signature_block.0.as_bytes());
            hasher.update(body.as_bytes());
            hasher.update([0]);
            hasher.update(style.font_family.css_name().as_bytes());
            hasher.update([0]);
            hasher.update(style.color.css_name().as_bytes());
        }
    }
    hasher.update([0]);
    hasher.update(
        filled_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.finalize().into()
}

/// Turn caller content into bound content, before taking the document lock
///
/// TEXT bodies are checked against `max_text_bytes`; SIGNATURE content
/// renders the signer's block. A signer without a block has no active key.
pub fn prepare_content(
    filler: UserId,
    content: FillContent,
    signature_block: Option<&SignatureBlock>,
    max_text_bytes: usize,
) -> Result<FieldContent> {
    match content {
        FillContent::Text(body) => {
            if body.trim().is_empty() {
                return Err(ValidationError::EmptyContent.into());
            }
            if body.len() > max_text_bytes {
                return Err(ValidationError::ContentTooLarge {
                    size: body.len(),
                    limit: max_text_bytes,
                }
                .into());
            }
            Ok(FieldContent::Text { body })
        }
        FillContent::Signature => {
            let block = signature_block
                .ok_or(crate::error::KeyError::NoActiveKey(filler))?;
            Ok(FieldContent::Signature {
                signature_block: block.id,
                body: block.body.clone(),
                style: block.style,
            })
        }
    }
}

/// Fill a pending field; runs under the document lock
pub(crate) fn fill_field(
    record: &mut DocumentRecord,
    field: FieldId,
    filler: UserId,
    content: FieldContent,
    artifact: Option<BlobRef>,
    keys: &KeyManager,
    now: DateTime<Utc>,
) -> Result<ContentField> {
    let document = record.id;
    if record.status != DocumentStatus::AwaitingSignatures {
        return Err(StateConflict::NotAwaitingSignatures(record.status).into());
    }
    let is_member = record.is_editor_or_owner(filler);
    let block = record
        .field_mut(field)
        .ok_or(SignflowError::FieldNotFound { document, field })?;

    if block.state != FieldState::Pending {
        return Err(StateConflict::FieldAlreadyFilled {
            field,
            state: block.state,
        }
        .into());
    }
    if block.assignee != filler {
        return Err(ValidationError::AssigneeMismatch {
            expected: block.assignee,
            actual: filler,
        }
        .into());
    }
    if !is_member {
        return Err(ValidationError::UnauthorizedAssignee(filler).into());
    }
    let kind_matches = matches!(
        (block.block_type, &content),
        (BlockType::Text, FieldContent::Text { .. })
            | (BlockType::Signature, FieldContent::Signature { .. })
    );
    if !kind_matches {
        return Err(ValidationError::ContentKindMismatch(block.block_type).into());
    }
    validate_field_transition(block.state, FieldState::Filled)?;

    let digest = commitment_digest(document, field, filler, &block.bbox, &content, now);
    let signature = match block.block_type {
        BlockType::Signature => Some(keys.sign_for_user(filler, &digest)?),
        BlockType::Text => None,
    };

    let filled = ContentField {
        id: ContentFieldId::new(),
        contentable: Contentable::SentinelBlock(field),
        document,
        assignee: filler,
        bbox: block.bbox,
        content,
        artifact,
        commitment: Commitment {
            digest: hex::encode(digest),
            signature,
        },
        filled_at: now,
        finalized_at: None,
    };
    block.state = FieldState::Filled;
    block.content = Some(filled.clone());
    Ok(filled)
}

/// Commit every live field and complete the document; all or nothing
pub(crate) fn finalize_document(record: &mut DocumentRecord, now: DateTime<Utc>) -> Result<usize> {
    validate_document_transition(record.status, DocumentStatus::Completed)?;

    let total = record.live_fields().count();
    if total == 0 {
        return Err(StateConflict::NoFields.into());
    }
    let filled = record.count_in(FieldState::Filled);
    if filled != total {
        return Err(StateConflict::NotAllFieldsFilled { filled, total }.into());
    }

    for field in record.fields.iter_mut().filter(|f| f.state.is_live()) {
        validate_field_transition(field.state, FieldState::Finalized)?;
        field.state = FieldState::Finalized;
        if let Some(content) = field.content.as_mut() {
            content.finalized_at = Some(now);
        }
    }
    record.status = DocumentStatus::Completed;
    Ok(total)
}

/// Re-derive a field's digest and check its signature
pub fn verify_field(record: &DocumentRecord, field: FieldId, keys: &KeyManager) -> Result<()> {
    let document = record.id;
    let block = record
        .field(field)
        .ok_or(SignflowError::FieldNotFound { document, field })?;
    let content = block.content.as_ref().ok_or(StateConflict::IllegalFieldTransition {
        from: block.state,
        to: FieldState::Filled,
    })?;

    let digest = commitment_digest(
        document,
        field,
        content.assignee,
        &content.bbox,
        &content.content,
        content.filled_at,
    );
    if hex::encode(digest) != content.commitment.digest {
        return Err(SignflowError::IntegrityViolation { document, field });
    }
    match (&content.commitment.signature, block.block_type) {
        (Some(signature), _) => keys.verify(signature, &digest).map_err(SignflowError::from),
        (None, BlockType::Text) => Ok(()),
        (None, BlockType::Signature) => Err(SignflowError::IntegrityViolation { document, field }),
    }
}
