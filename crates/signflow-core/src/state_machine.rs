//! Field and document transition tables
//!
//! Every state change goes through [`validate_field_transition`] or
//! [`validate_document_transition`]; there is no other way to move a field or
//! a document between states.

use crate::error::StateConflict;
use crate::types::{DocumentStatus, FieldState};

/// States a field may move to from `from`
#[must_use]
pub fn allowed_field_transitions(from: FieldState) -> &'static [FieldState] {
    use FieldState::*;
    match from {
        Pending => &[Filled, Void],
        // Void from filled only through a document void cascade
        Filled => &[Finalized, Void],
        Finalized | Void => &[],
    }
}

/// States a document may move to from `from`
#[must_use]
pub fn allowed_document_transitions(from: DocumentStatus) -> &'static [DocumentStatus] {
    use DocumentStatus::*;
    match from {
        Draft => &[AwaitingSignatures, Voided],
        AwaitingSignatures => &[Completed, Voided],
        Completed | Voided => &[],
    }
}

impl FieldState {
    /// See [`allowed_field_transitions`]
    #[inline]
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [FieldState] {
        allowed_field_transitions(self)
    }
}

impl DocumentStatus {
    /// See [`allowed_document_transitions`]
    #[inline]
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [DocumentStatus] {
        allowed_document_transitions(self)
    }
}

/// Check a field transition
pub fn validate_field_transition(from: FieldState, to: FieldState) -> Result<(), StateConflict> {
    if allowed_field_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateConflict::IllegalFieldTransition { from, to })
    }
}

/// Check a document transition
pub fn validate_document_transition(
    from: DocumentStatus,
    to: DocumentStatus,
) -> Result<(), StateConflict> {
    if allowed_document_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateConflict::IllegalDocumentTransition { from, to })
    }
}
