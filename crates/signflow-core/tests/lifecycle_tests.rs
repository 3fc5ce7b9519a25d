use pretty_assertions::assert_eq;
use signflow_core::{
    Actor, DocumentStatus, FieldState, FillContent, KeyError, NotificationEvent, SignflowError,
    StateConflict, ValidationError,
};
use signflow_test_utils::Harness;

#[tokio::test]
async fn full_signing_flow() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let bob = h.signer("Bob Brown").await;
    let doc = h.draft("Purchase agreement", &[alice, bob]).await;

    let a_sig = h.signature_field(doc, alice, 0).await;
    let b_sig = h.signature_field(doc, bob, 1).await;
    let b_company = h.text_field(doc, bob, 2).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();

    h.engine
        .fill_field(alice, doc, a_sig.id, FillContent::Signature)
        .await
        .unwrap();
    h.engine
        .fill_field(bob, doc, b_sig.id, FillContent::Signature)
        .await
        .unwrap();
    h.engine
        .fill_field(bob, doc, b_company.id, FillContent::Text("Brown Holdings LLC".into()))
        .await
        .unwrap();

    assert_eq!(h.engine.finalize_document(h.owner_actor(), doc).await.unwrap(), 3);
    assert_eq!(h.engine.status(doc).unwrap(), DocumentStatus::Completed);
    for field in h.engine.fields(doc).unwrap() {
        assert_eq!(field.state, FieldState::Finalized);
        assert!(field.content.as_ref().unwrap().finalized_at.is_some());
        h.engine.verify_field(doc, field.id).unwrap();
    }

    assert!(h
        .notifier
        .events_for(alice)
        .contains(&NotificationEvent::DocumentCompleted { document: doc }));
    h.engine.audit().verify_integrity().unwrap();
}

#[tokio::test]
async fn signature_renders_signer_block() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let doc = h.draft("Lease", &[alice]).await;
    let field = h.signature_field(doc, alice, 0).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();

    let filled = h
        .engine
        .fill_field(alice, doc, field.id, FillContent::Signature)
        .await
        .unwrap();
    match filled.content {
        signflow_core::FieldContent::Signature { body, .. } => assert_eq!(body, "Alice Adams"),
        other => panic!("unexpected content {other:?}"),
    }
    assert!(filled.artifact.is_some());
    assert_eq!(h.blobs.len(), 2);
}

#[tokio::test]
async fn fill_before_dispatch_is_rejected() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let doc = h.draft("Lease", &[alice]).await;
    let field = h.signature_field(doc, alice, 0).await;

    let err = h
        .engine
        .fill_field(alice, doc, field.id, FillContent::Signature)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SignflowError::StateConflict(StateConflict::NotAwaitingSignatures(DocumentStatus::Draft))
    ));
}

#[tokio::test]
async fn signer_without_key_cannot_sign() {
    let h = Harness::new();
    let carol = h.user("Carol Clark");
    let doc = h.draft("Lease", &[carol]).await;
    let field = h.signature_field(doc, carol, 0).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();

    let err = h
        .engine
        .fill_field(carol, doc, field.id, FillContent::Signature)
        .await
        .unwrap_err();
    assert!(matches!(err, SignflowError::Key(KeyError::NoActiveKey(_))));
    assert_eq!(h.engine.field(doc, field.id).unwrap().state, FieldState::Pending);
}

#[tokio::test]
async fn storage_outage_fails_fill_without_change() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let doc = h.draft("Lease", &[alice]).await;
    let field = h.text_field(doc, alice, 0).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    let before = h.engine.document(doc).unwrap();

    h.blobs.set_failing(true);
    let err = h
        .engine
        .fill_field(alice, doc, field.id, FillContent::Text("ACME".into()))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(*h.engine.document(doc).unwrap(), *before);

    h.blobs.set_failing(false);
    h.engine
        .fill_field(alice, doc, field.id, FillContent::Text("ACME".into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn remove_editor_rules() {
    let h = Harness::new();
    let alice = h.user("Alice Adams");
    let bob = h.user("Bob Brown");
    let doc = h.draft("Lease", &[alice, bob]).await;
    h.text_field(doc, alice, 0).await;
    let owner = h.owner_actor();

    let err = h.engine.remove_editor(owner, doc, h.owner).await.unwrap_err();
    assert!(matches!(
        err,
        SignflowError::Validation(ValidationError::CannotRemoveOwner)
    ));

    let err = h.engine.remove_editor(owner, doc, alice).await.unwrap_err();
    assert!(matches!(
        err,
        SignflowError::Validation(ValidationError::EditorHasAssignedFields(_))
    ));

    h.engine.remove_editor(owner, doc, bob).await.unwrap();
    assert!(!h.engine.is_editor_or_owner(doc, bob).unwrap());
    assert!(h.engine.is_editor_or_owner(doc, alice).unwrap());
}

#[tokio::test]
async fn remove_field_only_while_pending_in_draft() {
    let h = Harness::new();
    let alice = h.user("Alice Adams");
    let doc = h.draft("Lease", &[alice]).await;
    let keep = h.text_field(doc, alice, 0).await;
    let drop = h.text_field(doc, alice, 1).await;

    let removed = h
        .engine
        .remove_field(h.owner_actor(), doc, drop.id)
        .await
        .unwrap();
    assert_eq!(removed.state, FieldState::Void);

    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    let err = h
        .engine
        .remove_field(h.owner_actor(), doc, keep.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SignflowError::StateConflict(StateConflict::DocumentLocked(_))
    ));
}

#[tokio::test]
async fn completed_document_cannot_be_voided() {
    let h = Harness::new();
    let alice = h.user("Alice Adams");
    let doc = h.draft("Lease", &[alice]).await;
    let field = h.text_field(doc, alice, 0).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    h.engine
        .fill_field(alice, doc, field.id, FillContent::Text("ok".into()))
        .await
        .unwrap();
    h.engine
        .finalize_field(h.owner_actor(), doc, field.id)
        .await
        .unwrap();

    let err = h.engine.void_document(h.owner_actor(), doc).await.unwrap_err();
    assert!(matches!(
        err,
        SignflowError::StateConflict(StateConflict::IllegalDocumentTransition { .. })
    ));
}

#[tokio::test]
async fn only_owner_finalizes() {
    let h = Harness::new();
    let alice = h.user("Alice Adams");
    let doc = h.draft("Lease", &[alice]).await;
    let field = h.text_field(doc, alice, 0).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    h.engine
        .fill_field(alice, doc, field.id, FillContent::Text("ok".into()))
        .await
        .unwrap();

    let err = h
        .engine
        .finalize_document(Actor::user(alice), doc)
        .await
        .unwrap_err();
    assert!(matches!(err, SignflowError::Validation(ValidationError::NotOwner(_))));
    assert_eq!(h.engine.field(doc, field.id).unwrap().state, FieldState::Filled);
}

#[tokio::test]
async fn destroy_drops_document() {
    let h = Harness::new();
    let doc = h.draft("Lease", &[]).await;
    h.text_field(doc, h.owner, 0).await;

    let removed = h.engine.destroy_document(h.owner_actor(), doc).await.unwrap();
    assert_eq!(removed.fields.len(), 1);
    assert!(h.engine.document(doc).is_none());
    assert!(matches!(
        h.engine.status(doc),
        Err(SignflowError::DocumentNotFound(_))
    ));
}
