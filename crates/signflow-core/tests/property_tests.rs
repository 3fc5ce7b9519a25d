use chrono::Duration;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use signflow_core::{
    Actor, BoundingBox, DocumentStatus, FieldRequest, FieldState, FillContent, KeyError,
    SignflowError, StateConflict, ValidationError,
};
use signflow_test_utils::{draft_record, Harness};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fills_on_one_document_both_land() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let bob = h.signer("Bob Brown").await;
    let doc = h.draft("Joint venture", &[alice, bob]).await;
    let a = h.signature_field(doc, alice, 0).await;
    let b = h.signature_field(doc, bob, 1).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    let version = h.engine.document(doc).unwrap().version;

    let (ra, rb) = tokio::join!(
        h.engine.fill_field(alice, doc, a.id, FillContent::Signature),
        h.engine.fill_field(bob, doc, b.id, FillContent::Signature),
    );
    ra.unwrap();
    rb.unwrap();

    let snap = h.engine.document(doc).unwrap();
    assert_eq!(snap.count_in(FieldState::Filled), 2);
    assert_eq!(snap.version, version + 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_fills_of_one_field_have_one_winner() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let doc = h.draft("Lease", &[alice]).await;
    let field = h.text_field(doc, alice, 0).await.id;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();

    let attempts = (0..8).map(|i| {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .fill_field(alice, doc, field, FillContent::Text(format!("attempt {i}")))
                .await
        })
    });
    let results = futures::future::join_all(attempts).await;

    let wins = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    assert_eq!(wins, 1);
    for result in results {
        if let Ok(Err(e)) = result {
            assert!(matches!(
                e,
                SignflowError::StateConflict(StateConflict::FieldAlreadyFilled { .. })
            ));
        }
    }
}

#[tokio::test]
async fn finalize_short_of_all_fields_changes_nothing() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let doc = h.draft("Lease", &[alice]).await;
    let sig = h.signature_field(doc, alice, 0).await;
    h.text_field(doc, alice, 1).await;
    h.text_field(doc, alice, 2).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    h.engine
        .fill_field(alice, doc, sig.id, FillContent::Signature)
        .await
        .unwrap();
    let before = h.engine.document(doc).unwrap();

    let err = h
        .engine
        .finalize_document(h.owner_actor(), doc)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SignflowError::StateConflict(StateConflict::NotAllFieldsFilled { filled: 1, total: 3 })
    ));
    assert_eq!(*h.engine.document(doc).unwrap(), *before);
}

#[tokio::test]
async fn void_keeps_finalized_and_voids_pending() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let bob = h.signer("Bob Brown").await;
    let doc = h.draft("Partnership", &[alice, bob]).await;
    let a = h.signature_field(doc, alice, 0).await;
    let b = h.signature_field(doc, bob, 1).await;
    let c = h.text_field(doc, bob, 2).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    h.engine.fill_field(alice, doc, a.id, FillContent::Signature).await.unwrap();
    h.engine.fill_field(bob, doc, b.id, FillContent::Signature).await.unwrap();

    // A persisted record where two fields were committed before the third
    // signer joined; rehydrate it under the same id.
    let mut record = (*h.engine.document(doc).unwrap()).clone();
    h.engine.destroy_document(h.owner_actor(), doc).await.unwrap();
    for field in record.fields.iter_mut().filter(|f| f.state == FieldState::Filled) {
        field.state = FieldState::Finalized;
        if let Some(content) = field.content.as_mut() {
            content.finalized_at = Some(content.filled_at);
        }
    }
    h.engine.import_document(record).unwrap();

    let outcome = h.engine.void_document(h.owner_actor(), doc).await.unwrap();
    assert_eq!((outcome.voided, outcome.retained), (1, 2));

    let snap = h.engine.document(doc).unwrap();
    assert_eq!(snap.status, DocumentStatus::Voided);
    assert_eq!(snap.field(a.id).unwrap().state, FieldState::Finalized);
    assert_eq!(snap.field(b.id).unwrap().state, FieldState::Finalized);
    assert_eq!(snap.field(c.id).unwrap().state, FieldState::Void);
    h.engine.verify_field(doc, a.id).unwrap();
}

#[tokio::test]
async fn out_of_bounds_signature_field_creates_nothing() {
    let h = Harness::new();
    let alice = h.user("Alice Adams");
    let doc = h.draft("Lease", &[alice]).await;
    let version = h.engine.document(doc).unwrap().version;

    let outside = BoundingBox::new(0, 500.0, 780.0, 200.0, 40.0);
    let err = h
        .engine
        .place_field(h.owner_actor(), doc, FieldRequest::signature(alice, outside))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SignflowError::Validation(ValidationError::InvalidRegion(_))
    ));
    let snap = h.engine.document(doc).unwrap();
    assert!(snap.fields.is_empty());
    assert_eq!(snap.version, version);
}

#[tokio::test]
async fn rotation_grace_then_purge() {
    let h = Harness::new();
    let alice = h.signer("Alice Adams").await;
    let doc = h.draft("Lease", &[alice]).await;
    let field = h.signature_field(doc, alice, 0).await;
    h.engine.send_for_signatures(h.owner_actor(), doc).await.unwrap();
    h.engine
        .fill_field(alice, doc, field.id, FillContent::Signature)
        .await
        .unwrap();

    h.engine.rotate_key(alice, Some(30)).unwrap();
    h.engine.verify_field(doc, field.id).unwrap();

    h.clock.advance(Duration::seconds(10));
    assert!(h.keys.sweep().purged.is_empty());
    h.engine.verify_field(doc, field.id).unwrap();

    h.clock.advance(Duration::seconds(21));
    assert_eq!(h.keys.sweep().purged.len(), 1);
    assert!(matches!(
        h.engine.verify_field(doc, field.id),
        Err(SignflowError::Key(KeyError::KeyPurged(_)))
    ));
}

#[tokio::test]
async fn import_rejects_broken_membership() {
    let h = Harness::new();
    let mut record = draft_record(h.owner, &[]);
    record.editors.clear();
    let err = h.engine.import_document(record).unwrap_err();
    assert!(matches!(
        err,
        SignflowError::Validation(ValidationError::InvalidDocument(_))
    ));
}

#[derive(Debug, Clone)]
enum RoleOp {
    Add(usize),
    Remove(usize),
    Transfer(usize),
}

fn role_op() -> impl Strategy<Value = RoleOp> {
    prop_oneof![
        (0..4usize).prop_map(RoleOp::Add),
        (0..4usize).prop_map(RoleOp::Remove),
        (0..4usize).prop_map(RoleOp::Transfer),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_owner_always_an_editor(ops in prop::collection::vec(role_op(), 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let h = Harness::new();
            let users: Vec<_> = (0..4).map(|i| h.user(&format!("user {i}"))).collect();
            let doc = h.draft("Roles", &[]).await;
            let admin = Actor::admin(h.owner);

            for op in ops {
                // Failures (e.g. removing the owner) are expected and must not
                // break the invariant either.
                let _ = match op {
                    RoleOp::Add(i) => h.engine.add_editor(admin, doc, users[i]).await.map(|_| ()),
                    RoleOp::Remove(i) => h.engine.remove_editor(admin, doc, users[i]).await,
                    RoleOp::Transfer(i) => h.engine.transfer_ownership(admin, doc, users[i]).await,
                };
                let snap = h.engine.document(doc).unwrap();
                assert!(snap.editors.contains(&snap.owner));
            }
        });
    }
}

fn field_state() -> impl Strategy<Value = FieldState> {
    prop_oneof![
        Just(FieldState::Pending),
        Just(FieldState::Filled),
        Just(FieldState::Finalized),
        Just(FieldState::Void),
    ]
}

proptest! {
    #[test]
    fn prop_field_validation_matches_table(from in field_state(), to in field_state()) {
        let ok = signflow_core::state_machine::validate_field_transition(from, to).is_ok();
        prop_assert_eq!(ok, from.allowed_transitions().contains(&to));
        prop_assert!(!(from == FieldState::Pending && to == FieldState::Finalized && ok));
    }
}
