//! Pipeline stages and their wiring
//!
//! `Pipeline::start` assembles the whole processing graph: the metadata bus
//! with its three writers, the change feeds that sequence stage handoffs,
//! and one task (or task pool) per stage. Stages communicate only through
//! bus events, change-feed records, and object-store notifications; no
//! stage calls another directly.

pub mod async_ocr;
pub mod classifier;
pub mod enrichment;
pub mod registrar;
pub mod router;
pub mod sync_ocr;

pub use async_ocr::{AsyncOcrStarter, AsyncResultProcessor};
pub use classifier::Classifier;
pub use enrichment::{chunk_text, EnrichmentProcessor, IndexedPage, FULL_RESPONSE_SUFFIX};
pub use registrar::Registrar;
pub use router::ExtensionRouter;
pub use sync_ocr::SyncOcrProcessor;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{
    LineagePublisher, MetadataBus, MetadataFilter, OpsPublisher, RegistryPublisher,
};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::metadata::{LineageWriter, OpsWriter, RegistryWriter};
use crate::providers::{EnrichmentProvider, OcrProvider, OcrResult, SearchIndex};
use crate::storage::{ChangeFeed, ObjectStore, PipelineDb, DOCUMENT_ID_TAG};
use crate::types::{DocumentId, JobNotice, MetadataType};

/// Read the document id a staged or derived object carries as a tag
pub(crate) async fn tagged_document_id(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> Result<DocumentId> {
    let tags = store.get_tags(bucket, key).await?;
    let raw = tags.get(DOCUMENT_ID_TAG).ok_or_else(|| Error::UntaggedObject {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })?;
    Uuid::parse_str(raw)
        .map_err(|e| Error::Malformed(format!("corrupt document id tag {:?}: {}", raw, e)))
}

/// Write the OCR artifact set under `{prefix}/ocr-analysis/`: per-page
/// response and text objects in parallel, then the full response last so
/// its notification fires only once everything else is in place. Returns
/// the full-response key.
pub(crate) async fn write_ocr_artifacts(
    store: &dyn ObjectStore,
    bucket: &str,
    document_id: DocumentId,
    prefix: &str,
    result: &OcrResult,
    writer: &str,
) -> Result<String> {
    let tags = HashMap::from([(DOCUMENT_ID_TAG.to_string(), document_id.to_string())]);

    let mut entries: Vec<(String, Bytes)> = Vec::with_capacity(result.pages.len() * 2);
    for page in &result.pages {
        entries.push((
            format!("{}/ocr-analysis/page-{}/response.json", prefix, page.page_number),
            Bytes::from(serde_json::to_vec(page)?),
        ));
        entries.push((
            format!("{}/ocr-analysis/page-{}/text.txt", prefix, page.page_number),
            Bytes::from(page.text.clone().into_bytes()),
        ));
    }
    futures::future::try_join_all(
        entries
            .iter()
            .map(|(key, body)| store.put(bucket, key, body.clone(), tags.clone(), writer)),
    )
    .await?;

    let full_key = format!("{}/ocr-analysis/fullresponse.json", prefix);
    store
        .put(
            bucket,
            &full_key,
            Bytes::from(serde_json::to_vec(result)?),
            tags,
            writer,
        )
        .await?;
    Ok(full_key)
}

/// External service implementations injected at startup
pub struct PipelineProviders {
    pub ocr: Arc<dyn OcrProvider>,
    pub enrichment: Arc<dyn EnrichmentProvider>,
    pub search: Arc<dyn SearchIndex>,
}

/// A running pipeline: the bus, the durable stores, and every stage task
pub struct Pipeline {
    bus: Arc<MetadataBus>,
    db: Arc<PipelineDb>,
    job_notices: mpsc::Sender<JobNotice>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        providers: PipelineProviders,
    ) -> Result<Self> {
        let db = Arc::new(match &config.database_path {
            Some(path) => PipelineDb::open(path)?,
            None => PipelineDb::in_memory()?,
        });
        let bus = Arc::new(MetadataBus::new(config.metadata_topic.clone(), &config.bus));
        let registry_feed = Arc::new(ChangeFeed::with_retention(config.bus.queue_capacity));
        let ops_feed = Arc::new(ChangeFeed::with_retention(config.bus.queue_capacity));

        let mut handles = Vec::new();

        // Writers subscribe before any publisher can run, so no bus
        // traffic is ever dropped on the floor.
        let registry_rx = bus.subscribe(MetadataFilter::only(MetadataType::DocumentRegistry));
        handles.push(
            RegistryWriter::new(db.clone(), registry_feed.clone(), config.delivery.clone())
                .spawn(registry_rx),
        );
        let lineage_rx = bus.subscribe(MetadataFilter::only(MetadataType::DocumentLineage));
        handles.push(LineageWriter::new(db.clone(), config.delivery.clone()).spawn(lineage_rx));
        let ops_rx = bus.subscribe(MetadataFilter::only(MetadataType::PipelineOperations));
        handles.push(
            OpsWriter::new(db.clone(), ops_feed.clone(), config.delivery.clone()).spawn(ops_rx),
        );

        let registry_pub = RegistryPublisher::new(
            bus.clone(),
            &config.classification.default_owner,
            &config.classification.default_class,
        );
        let lineage_pub = LineagePublisher::new(bus.clone());
        let ops_pub = OpsPublisher::new(bus.clone());

        let intake_rx = store.subscribe(&config.buckets.intake, None);
        handles.push(
            Registrar::new(
                store.clone(),
                registry_pub,
                lineage_pub.clone(),
                config.delivery.clone(),
            )
            .spawn(intake_rx),
        );

        handles.push(
            Classifier::new(
                ops_pub.clone(),
                config.classification.clone(),
                config.delivery.clone(),
            )
            .spawn(registry_feed.subscribe()),
        );

        handles.push(
            ExtensionRouter::new(
                store.clone(),
                ops_pub.clone(),
                lineage_pub.clone(),
                config.buckets.clone(),
                config.delivery.clone(),
            )
            .spawn(ops_feed.subscribe()),
        );

        let sync_rx = store.subscribe(&config.buckets.sync_staging, None);
        handles.push(
            SyncOcrProcessor::new(
                store.clone(),
                providers.ocr.clone(),
                ops_pub.clone(),
                lineage_pub.clone(),
                config.buckets.ocr_results.clone(),
                config.concurrency.sync_ocr,
                config.timeouts.sync_ocr(),
                config.delivery.clone(),
            )
            .spawn(sync_rx),
        );

        let (notice_tx, notice_rx) = mpsc::channel(config.bus.queue_capacity);
        let (results_tx, results_rx) = mpsc::channel(config.bus.queue_capacity);
        let async_rx = store.subscribe(&config.buckets.async_staging, None);
        handles.extend(
            AsyncOcrStarter::new(
                store.clone(),
                providers.ocr.clone(),
                ops_pub.clone(),
                notice_tx.clone(),
                config.concurrency.async_start,
                config.delivery.clone(),
            )
            .spawn(async_rx, notice_rx, results_tx),
        );
        handles.push(
            AsyncResultProcessor::new(
                store.clone(),
                providers.ocr,
                ops_pub.clone(),
                lineage_pub.clone(),
                config.buckets.ocr_results.clone(),
                config.timeouts.result_fetch(),
                config.delivery.clone(),
            )
            .spawn(results_rx),
        );

        let enrichment_rx = store.subscribe(
            &config.buckets.ocr_results,
            Some(FULL_RESPONSE_SUFFIX.to_string()),
        );
        handles.push(
            EnrichmentProcessor::new(
                store,
                providers.enrichment,
                providers.search,
                ops_pub,
                lineage_pub,
                config.buckets.enrichment_results.clone(),
                config.search_index.clone(),
                config.concurrency.enrichment,
                config.timeouts.enrichment(),
                config.delivery.clone(),
            )
            .spawn(enrichment_rx),
        );

        Ok(Self {
            bus,
            db,
            job_notices: notice_tx,
            handles,
        })
    }

    pub fn bus(&self) -> &Arc<MetadataBus> {
        &self.bus
    }

    pub fn db(&self) -> &Arc<PipelineDb> {
        &self.db
    }

    /// Channel for external job services to report OCR job completion
    pub fn job_notice_sender(&self) -> mpsc::Sender<JobNotice> {
        self.job_notices.clone()
    }

    /// Abort every stage task. In-flight handlers stop at the next await.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
