//! Seeded end-to-end workload
//!
//! Creates documents with randomly assigned fields, fills every field
//! concurrently in a shuffled order, finalizes, then re-verifies every
//! commitment and the audit chain. Notifications flow through the
//! configured bounded channel and are counted.

use anyhow::{ensure, Context};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use signflow_core::{
    Actor, BlockType, BoundingBox, DocumentId, FieldId, FieldRequest, FillContent,
    InMemoryDirectory, NewDocument, PageBounds, SignatureStyle, SignflowConfig, UserId,
    WorkflowEngine,
};
use std::sync::Arc;
use std::time::Instant;

const SIGNERS: usize = 4;
const SLOTS_PER_PAGE: u32 = 15;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Simulation {
    pub(crate) documents: usize,
    pub(crate) fields: u32,
    pub(crate) seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SimulationReport {
    pub(crate) documents: usize,
    pub(crate) fields_filled: usize,
    pub(crate) completed: usize,
    pub(crate) verified: usize,
    pub(crate) audit_entries: usize,
    pub(crate) notifications: usize,
    pub(crate) elapsed_ms: u128,
}

impl SimulationReport {
    pub(crate) fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "documents": self.documents,
            "fields_filled": self.fields_filled,
            "completed": self.completed,
            "verified": self.verified,
            "audit_entries": self.audit_entries,
            "notifications": self.notifications,
            "elapsed_ms": self.elapsed_ms,
        })
    }
}

struct Assignment {
    document: DocumentId,
    field: FieldId,
    signer: UserId,
    block_type: BlockType,
}

fn slot(index: u32) -> BoundingBox {
    let row = f64::from(index % SLOTS_PER_PAGE);
    BoundingBox::new(index / SLOTS_PER_PAGE, 72.0, 40.0 + row * 48.0, 200.0, 40.0)
}

pub(crate) async fn run(sim: Simulation, config: SignflowConfig) -> anyhow::Result<SimulationReport> {
    let started = Instant::now();
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let directory = Arc::new(InMemoryDirectory::new());
    let (engine, mut events) = WorkflowEngine::new(config)
        .with_directory(directory.clone())
        .with_channel_notifier();
    let engine = Arc::new(engine);
    let inbox = tokio::spawn(async move {
        let mut received = 0usize;
        while events.recv().await.is_some() {
            received += 1;
        }
        received
    });

    let owner = directory.register("Simulation Owner");
    let mut signers = Vec::with_capacity(SIGNERS);
    for i in 0..SIGNERS {
        let user = directory.register(format!("Signer {i}"));
        engine
            .create_signature_block(user, SignatureStyle::default())
            .await?;
        engine.issue_key(user)?;
        signers.push(user);
    }

    let pages = vec![PageBounds::LETTER; sim.fields.div_ceil(SLOTS_PER_PAGE).max(1) as usize];
    let actor = Actor::user(owner);
    let mut documents = Vec::with_capacity(sim.documents);
    let mut plan = Vec::new();
    for d in 0..sim.documents {
        let title = format!("simulated-{d}");
        let doc = engine
            .create_document(
                owner,
                NewDocument::new(title.clone(), title.into_bytes()).with_pages(pages.clone()),
            )
            .await?;
        for signer in &signers {
            engine.add_editor(actor, doc.id, *signer).await?;
        }
        for f in 0..sim.fields {
            let signer = signers[rng.gen_range(0..signers.len())];
            let request = if rng.gen_bool(0.5) {
                FieldRequest::signature(signer, slot(f))
            } else {
                FieldRequest::text(signer, slot(f))
            };
            let block = engine.place_field(actor, doc.id, request).await?;
            plan.push(Assignment {
                document: doc.id,
                field: block.id,
                signer,
                block_type: block.block_type,
            });
        }
        engine.send_for_signatures(actor, doc.id).await?;
        documents.push(doc.id);
    }

    plan.shuffle(&mut rng);
    let fills = plan.iter().map(|a| {
        let engine = Arc::clone(&engine);
        let (document, field, signer) = (a.document, a.field, a.signer);
        let content = match a.block_type {
            BlockType::Signature => FillContent::Signature,
            BlockType::Text => FillContent::Text(format!("filled by {signer}")),
        };
        tokio::spawn(async move { engine.fill_field(signer, document, field, content).await })
    });
    let mut fields_filled = 0;
    for result in futures::future::join_all(fills).await {
        result.context("fill task panicked")??;
        fields_filled += 1;
    }

    let mut completed = 0;
    for doc in &documents {
        engine.finalize_document(actor, *doc).await?;
        completed += 1;
    }

    let mut verified = 0;
    for a in &plan {
        engine
            .verify_field(a.document, a.field)
            .with_context(|| format!("field {} on {}", a.field, a.document))?;
        verified += 1;
    }
    engine.audit().verify_integrity()?;
    ensure!(verified == plan.len(), "verified {verified} of {} fields", plan.len());
    let audit_entries = engine.audit().len();

    // Fill tasks are done, so this is the last handle on the notifier
    drop(engine);
    let notifications = inbox.await.context("notification inbox panicked")?;

    Ok(SimulationReport {
        documents: documents.len(),
        fields_filled,
        completed,
        verified,
        audit_entries,
        notifications,
        elapsed_ms: started.elapsed().as_millis(),
    })
}
