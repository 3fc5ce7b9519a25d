//! Signflow Core - document signing workflow engine
//!
//! Owners upload a document, place SIGNATURE and TEXT fields for assignees,
//! send it out, and finalize once every field is filled. The engine:
//! - anchors fields to page regions and editor/owner assignees
//! - binds filled content to a SHA-256 commitment, signed with ed25519
//! - manages signing keys with rotation and a deferred purge sweep
//! - serializes transitions per document while reads stay lock-free
//!
//! # Example
//!
//! ```rust,ignore
//! use signflow_core::prelude::*;
//!
//! # async fn example(engine: WorkflowEngine, owner: UserId, signer: UserId) -> Result<()> {
//! let doc = engine.create_document(owner, NewDocument::new("NDA", pdf_bytes)).await?;
//! engine.add_editor(Actor::user(owner), doc.id, signer).await?;
//! let bbox = BoundingBox::new(0, 72.0, 700.0, 200.0, 40.0);
//! let field = engine.place_field(Actor::user(owner), doc.id, FieldRequest::signature(signer, bbox)).await?;
//! engine.send_for_signatures(Actor::user(owner), doc.id).await?;
//! engine.fill_field(signer, doc.id, field.id, FillContent::Signature).await?;
//! engine.finalize_document(Actor::user(owner), doc.id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod audit;
pub mod binder;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod guard;
pub mod keys;
pub mod placement;
pub mod ports;
pub mod state_machine;
pub mod types;
pub mod workflow;

pub use audit::{AuditEntry, AuditIntegrityError, AuditTrail};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SignflowConfig;
pub use document::{
    Commitment, ContentField, Contentable, DocumentRecord, FieldContent, FillContent,
    SentinelBlock,
};
pub use error::{
    ErrorCategory, KeyError, Result, SignflowError, StateConflict, ValidationError,
};
pub use guard::DocumentGuard;
pub use keys::{
    FilePurgeQueue, InMemoryPurgeQueue, KeyHandle, KeyManager, KeySignature, KeyState,
    KeySweeper, PurgeEntry, PurgeQueue, SignatureBlock, SweepReport, SweeperHandle,
};
pub use placement::{validate_region, FieldRequest};
pub use ports::{
    BlobStore, ChannelNotifier, InMemoryBlobStore, InMemoryDirectory, NotificationEvent,
    NotificationSink, NullNotifier, RecordingNotifier, ServiceError, UserDirectory, UserProfile,
};
pub use types::{
    Actor, BlobRef, BlockType, BoundingBox, ContentFieldId, DocumentId, DocumentStatus,
    FieldId, FieldState, FontFamily, InkColor, KeyId, PageBounds, SignatureBlockId,
    SignatureStyle, UserId,
};
pub use workflow::{NewDocument, VoidOutcome, WorkflowEngine};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding the engine
    pub use crate::{
        Actor, BoundingBox, DocumentId, DocumentStatus, FieldId, FieldRequest, FieldState,
        FillContent, NewDocument, Result, SignatureStyle, SignflowConfig, SignflowError, UserId,
        WorkflowEngine,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
