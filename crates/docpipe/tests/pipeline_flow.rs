//! End-to-end pipeline scenarios against the in-process providers

use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use docpipe::pipeline::PipelineProviders;
use docpipe::providers::{LocalEnrichment, LocalOcrEngine, MemorySearchIndex};
use docpipe::storage::{document_signature, MemoryObjectStore, ObjectStore, OpsRecord};
use docpipe::types::{staged_key, ObjectEventKind, PipelineStage, RoutePath, StageStatus};
use docpipe::{JobNotice, JobStatus, Pipeline, PipelineConfig};

struct Harness {
    pipeline: Pipeline,
    store: Arc<MemoryObjectStore>,
    search: Arc<MemorySearchIndex>,
}

fn start_pipeline(config: PipelineConfig) -> Result<Harness> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryObjectStore::new());
    let search = Arc::new(MemorySearchIndex::new());
    let pipeline = Pipeline::start(
        config,
        store.clone(),
        PipelineProviders {
            ocr: Arc::new(LocalOcrEngine::new(store.clone())),
            enrichment: Arc::new(LocalEnrichment),
            search: search.clone(),
        },
    )?;
    Ok(Harness {
        pipeline,
        store,
        search,
    })
}

async fn upload(store: &MemoryObjectStore, key: &str, body: &str) -> Result<()> {
    store
        .put(
            "document-intake",
            key,
            Bytes::from(body.to_string()),
            HashMap::new(),
            "uploader",
        )
        .await?;
    Ok(())
}

/// Poll until the document under the given intake key reaches a terminal
/// enrichment state, or give up.
async fn wait_for_enriched(pipeline: &Pipeline, key: &str) -> Option<OpsRecord> {
    for _ in 0..500 {
        let documents = pipeline.db().list_documents(100, 0).ok()?;
        let found = documents.into_iter().find(|d| {
            d.object_key == key
                && d.stage == PipelineStage::Enriched
                && d.status == StageStatus::Succeeded
        });
        if found.is_some() {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn image_flows_through_the_sync_path() -> Result<()> {
    let h = start_pipeline(PipelineConfig::default())?;

    upload(&h.store, "doc-1.png", "quarterly NASA observations\u{c}appendix material").await?;

    let record = wait_for_enriched(&h.pipeline, "doc-1.png")
        .await
        .expect("document never reached the enriched state");
    assert_eq!(record.route, Some(RoutePath::Sync));
    assert!(record.job_id.is_none());

    // Registration committed with the default class metadata
    let registration = h.pipeline.db().get_registration(&record.document_id)?.unwrap();
    assert_eq!(registration.object_key, "doc-1.png");
    assert_eq!(registration.metadata["class"], "external_public_report");

    // Exactly four hops: intake write, staging copy, OCR output, enrichment output
    let trail = h.pipeline.db().lineage_for(&record.document_id)?;
    assert_eq!(trail.len(), 4);
    assert_eq!(trail[1].kind, ObjectEventKind::Copied);
    assert_eq!(trail[1].target_bucket, "sync-staging");
    assert_eq!(trail[3].target_bucket, "enrichment-results");

    // Both pages were enriched and indexed
    let indexed = h.search.documents("document");
    assert_eq!(indexed.len(), 2);
    assert_eq!(indexed[0]["document_id"], record.document_id.to_string());
    assert_eq!(indexed[0]["entities"]["NASA"], "ORGANIZATION");

    let output_key = format!("{}/doc-1.png/enrichment-output.json", record.document_id);
    assert!(h.store.exists("enrichment-results", &output_key).await?);

    // The timeline covers every stage of the sync path
    let stages: Vec<PipelineStage> = record.timeline.iter().map(|e| e.stage).collect();
    for stage in [
        PipelineStage::Classified,
        PipelineStage::Routed,
        PipelineStage::SyncProcessing,
        PipelineStage::Enriched,
    ] {
        assert!(stages.contains(&stage), "timeline missing stage {}", stage);
    }

    // A later removal of the intake object lands in the trail by signature
    h.store.remove("document-intake", "doc-1.png", "janitor").await?;
    settle().await;
    let trail = h.pipeline.db().lineage_for(&record.document_id)?;
    assert_eq!(trail.len(), 5);
    assert_eq!(trail[4].kind, ObjectEventKind::Removed);

    h.pipeline.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_sync_staging_delivery_converges_on_the_same_state() -> Result<()> {
    let h = start_pipeline(PipelineConfig::default())?;

    upload(&h.store, "doc-3.png", "lunar ESA telemetry\u{c}appendix material").await?;

    let record = wait_for_enriched(&h.pipeline, "doc-3.png")
        .await
        .expect("document never reached the enriched state");
    let trail_before = h.pipeline.db().lineage_for(&record.document_id)?;
    assert_eq!(trail_before.len(), 4);
    let timeline_before = record.timeline.len();

    // Redeliver the staging write: re-issuing the routing copy fires the
    // staged-object notification again and re-drives the sync processor
    // and, through the overwritten OCR output, the enrichment processor.
    let staged = staged_key(&record.document_id, "doc-3.png");
    h.store
        .copy("document-intake", "doc-3.png", "sync-staging", &staged, "router")
        .await?;
    settle().await;
    settle().await;

    let replayed = h.pipeline.db().get_document(&record.document_id)?.unwrap();
    assert_eq!(replayed.stage, PipelineStage::Enriched);
    assert_eq!(replayed.status, StageStatus::Succeeded);
    assert_eq!(replayed.timeline.len(), timeline_before);
    assert_eq!(
        h.pipeline.db().lineage_for(&record.document_id)?.len(),
        trail_before.len()
    );

    // Deterministic keys: one artifact set, overwritten in place
    let full_key = format!("{}/ocr-analysis/fullresponse.json", staged);
    assert!(h.store.exists("ocr-results", &full_key).await?);
    assert!(
        h.store
            .exists(
                "enrichment-results",
                &format!("{}/doc-3.png/enrichment-output.json", record.document_id)
            )
            .await?
    );

    h.pipeline.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pdf_flows_through_the_async_path_and_tolerates_duplicate_notices() -> Result<()> {
    let h = start_pipeline(PipelineConfig::default())?;

    upload(&h.store, "doc-2.pdf", "alpha findings\u{c}beta findings").await?;

    let record = wait_for_enriched(&h.pipeline, "doc-2.pdf")
        .await
        .expect("document never reached the enriched state");
    assert_eq!(record.route, Some(RoutePath::Async));
    let job_id = record.job_id.clone().expect("async path must record a job id");

    let trail_before = h.pipeline.db().lineage_for(&record.document_id)?;
    assert_eq!(trail_before.len(), 4);

    // Redeliver the completion notice; deterministic keys plus publish
    // dedup make the replay converge instead of duplicating work.
    let staged = format!("{}/doc-2.pdf", record.document_id);
    h.pipeline
        .job_notice_sender()
        .send(JobNotice {
            job_id,
            job_tag: record.document_id,
            status: JobStatus::Succeeded,
            bucket: "async-staging".into(),
            object_key: staged.clone(),
            message: None,
        })
        .await?;
    settle().await;

    let replayed = h.pipeline.db().get_document(&record.document_id)?.unwrap();
    assert_eq!(replayed.stage, PipelineStage::Enriched);
    assert_eq!(replayed.status, StageStatus::Succeeded);
    assert_eq!(
        h.pipeline.db().lineage_for(&record.document_id)?.len(),
        trail_before.len()
    );

    let full_key = format!("{}/ocr-analysis/fullresponse.json", staged);
    assert!(h.store.exists("ocr-results", &full_key).await?);

    h.pipeline.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ineligible_class_stops_after_registration() -> Result<()> {
    let mut config = PipelineConfig::default();
    config.classification.default_class = "meeting_notes".to_string();
    let h = start_pipeline(config)?;

    upload(&h.store, "notes.png", "weekly notes").await?;

    // Registered but never admitted into the pipeline
    let signature = document_signature("document-intake", "notes.png", None);
    let mut document_id = None;
    for _ in 0..500 {
        document_id = h.pipeline.db().query_document_id(&signature)?;
        if document_id.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let document_id = document_id.expect("registration lineage missing");
    assert!(h.pipeline.db().get_registration(&document_id)?.is_some());

    // Tracking opens at REGISTERED and stops there; nothing is staged
    let mut record = None;
    for _ in 0..500 {
        record = h
            .pipeline
            .db()
            .get_document(&document_id)?
            .filter(|d| d.status == StageStatus::Succeeded);
        if record.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = record.expect("registered-only record missing");
    assert_eq!(record.stage, PipelineStage::Registered);
    assert!(record.route.is_none());
    settle().await;
    assert!(
        !h.store
            .exists("sync-staging", &format!("{}/notes.png", document_id))
            .await?
    );
    assert!(h.search.documents("document").is_empty());

    h.pipeline.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_extension_fails_at_routing() -> Result<()> {
    let h = start_pipeline(PipelineConfig::default())?;

    upload(&h.store, "notes.txt", "plain text").await?;

    let mut failed = None;
    for _ in 0..500 {
        let documents = h.pipeline.db().list_documents(100, 0)?;
        failed = documents.into_iter().find(|d| d.status == StageStatus::Failed);
        if failed.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = failed.expect("routing failure never recorded");
    assert_eq!(record.stage, PipelineStage::Routed);
    assert!(record
        .timeline
        .last()
        .unwrap()
        .message
        .as_deref()
        .unwrap()
        .contains("notes.txt"));

    h.pipeline.shutdown();
    Ok(())
}
