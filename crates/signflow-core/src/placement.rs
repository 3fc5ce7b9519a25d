//! Field placement
//!
//! Anchors sentinel blocks to page regions and assignees. Placement and
//! removal only happen while a document is in draft.

use crate::document::{DocumentRecord, SentinelBlock};
use crate::error::{Result, SignflowError, StateConflict, ValidationError};
use crate::state_machine::validate_field_transition;
use crate::types::{BlockType, BoundingBox, DocumentStatus, FieldId, FieldState, PageBounds, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to place a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRequest {
    /// Kind
    pub block_type: BlockType,
    /// Label; defaults to "This is a {TYPE} placeholder"
    pub placeholder: Option<String>,
    /// Page region
    pub bbox: BoundingBox,
    /// Expected filler
    pub assignee: UserId,
}

impl FieldRequest {
    /// Signature field for `assignee`
    #[must_use]
    pub fn signature(assignee: UserId, bbox: BoundingBox) -> Self {
        Self {
            block_type: BlockType::Signature,
            placeholder: None,
            bbox,
            assignee,
        }
    }

    /// Text field for `assignee`
    #[must_use]
    pub fn text(assignee: UserId, bbox: BoundingBox) -> Self {
        Self {
            block_type: BlockType::Text,
            placeholder: None,
            bbox,
            assignee,
        }
    }

    /// With label
    #[must_use]
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }
}

/// Check that `bbox` lies entirely on one of `pages`
pub fn validate_region(pages: &[PageBounds], bbox: &BoundingBox) -> Result<(), ValidationError> {
    let page = usize::try_from(bbox.page)
        .ok()
        .and_then(|i| pages.get(i))
        .ok_or_else(|| {
            ValidationError::InvalidRegion(format!(
                "page {} out of range (document has {})",
                bbox.page,
                pages.len()
            ))
        })?;

    let coords = [bbox.x, bbox.y, bbox.width, bbox.height];
    if coords.iter().any(|c| !c.is_finite()) {
        return Err(ValidationError::InvalidRegion("non-finite coordinate".into()));
    }
    if bbox.x < 0.0 || bbox.y < 0.0 {
        return Err(ValidationError::InvalidRegion(format!(
            "origin ({}, {}) is negative",
            bbox.x, bbox.y
        )));
    }
    if bbox.width <= 0.0 || bbox.height <= 0.0 {
        return Err(ValidationError::InvalidRegion(format!(
            "size {}x{} is empty",
            bbox.width, bbox.height
        )));
    }
    if bbox.x + bbox.width > page.width || bbox.y + bbox.height > page.height {
        return Err(ValidationError::InvalidRegion(format!(
            "region ends at ({}, {}) beyond page {}x{}",
            bbox.x + bbox.width,
            bbox.y + bbox.height,
            page.width,
            page.height
        )));
    }
    Ok(())
}

/// Place a pending field on a draft document
pub(crate) fn place_field(
    record: &mut DocumentRecord,
    request: FieldRequest,
    now: DateTime<Utc>,
) -> Result<SentinelBlock> {
    if record.status != DocumentStatus::Draft {
        return Err(StateConflict::DocumentLocked(record.status).into());
    }
    if !record.is_editor_or_owner(request.assignee) {
        return Err(ValidationError::UnauthorizedAssignee(request.assignee).into());
    }
    validate_region(&record.pages, &request.bbox)?;

    let block = SentinelBlock {
        id: FieldId::new(),
        document: record.id,
        block_type: request.block_type,
        placeholder: request
            .placeholder
            .unwrap_or_else(|| request.block_type.default_placeholder()),
        assignee: request.assignee,
        bbox: request.bbox,
        state: FieldState::Pending,
        content: None,
        placed_at: now,
    };
    record.fields.push(block.clone());
    Ok(block)
}

/// Void a pending field
pub(crate) fn remove_field(record: &mut DocumentRecord, field: FieldId) -> Result<SentinelBlock> {
    let status = record.status;
    let document = record.id;
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
    if status != DocumentStatus::Draft {
        return Err(StateConflict::DocumentLocked(status).into());
    }
    validate_field_transition(block.state, FieldState::Void)?;
    block.state = FieldState::Void;
    Ok(block.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LETTER: [PageBounds; 2] = [PageBounds::LETTER, PageBounds::LETTER];

    #[test]
    fn region_inside_page_is_valid() {
        let bbox = BoundingBox::new(1, 72.0, 700.0, 200.0, 40.0);
        assert!(validate_region(&LETTER, &bbox).is_ok());
    }

    #[test]
    fn region_touching_edge_is_valid() {
        let bbox = BoundingBox::new(0, 0.0, 0.0, 612.0, 792.0);
        assert!(validate_region(&LETTER, &bbox).is_ok());
    }

    #[test]
    fn regions_outside_page_are_rejected() {
        let cases = [
            BoundingBox::new(2, 10.0, 10.0, 10.0, 10.0),
            BoundingBox::new(0, -1.0, 10.0, 10.0, 10.0),
            BoundingBox::new(0, 600.0, 10.0, 20.0, 10.0),
            BoundingBox::new(0, 10.0, 790.0, 10.0, 10.0),
            BoundingBox::new(0, 10.0, 10.0, 0.0, 10.0),
            BoundingBox::new(0, f64::NAN, 10.0, 10.0, 10.0),
            BoundingBox::new(0, 10.0, 10.0, f64::INFINITY, 10.0),
        ];
        for bbox in cases {
            assert!(
                matches!(
                    validate_region(&LETTER, &bbox),
                    Err(ValidationError::InvalidRegion(_))
                ),
                "{bbox:?} should be rejected"
            );
        }
    }
}
