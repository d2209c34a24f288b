//! Async OCR path: job starter and serial result processor
//!
//! The starter submits one analysis job per staged document, using the
//! document id as both idempotency token and job tag, then records the job
//! reference. Completion notices arrive out of band and are forwarded onto
//! an internal results queue; the result processor drains that queue
//! serially to bound memory against large result payloads.

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bus::{deliver_with_retry, LineagePublisher, OpsPublisher};
use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::providers::OcrProvider;
use crate::storage::ObjectStore;
use crate::types::{JobNotice, JobStatus, LineageEvent, ObjectEvent, ObjectEventKind, PipelineStage};

use super::{tagged_document_id, write_ocr_artifacts};

const CALLER: &str = "async-ocr";

/// Submits analysis jobs for staged documents and forwards their
/// completion notices to the result processor
pub struct AsyncOcrStarter {
    inner: Arc<StarterInner>,
    semaphore: Arc<Semaphore>,
    delivery: DeliveryConfig,
}

struct StarterInner {
    store: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrProvider>,
    ops: OpsPublisher,
    notice_tx: mpsc::Sender<JobNotice>,
}

impl AsyncOcrStarter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrProvider>,
        ops: OpsPublisher,
        notice_tx: mpsc::Sender<JobNotice>,
        concurrency: usize,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StarterInner {
                store,
                ocr,
                ops,
                notice_tx,
            }),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            delivery,
        }
    }

    /// Spawn the submission loop plus the notice-forwarding loop
    pub fn spawn(
        self,
        mut events_rx: mpsc::UnboundedReceiver<ObjectEvent>,
        mut notice_rx: mpsc::Receiver<JobNotice>,
        results_tx: mpsc::Sender<JobNotice>,
    ) -> Vec<JoinHandle<()>> {
        let submit = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if event.kind.is_removal() {
                    continue;
                }
                let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                    break;
                };
                let inner = Arc::clone(&self.inner);
                let delivery = self.delivery.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    deliver_with_retry(&delivery, "async-ocr-start", || inner.handle(&event)).await;
                });
            }
        });

        let forward = tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                if results_tx.send(notice).await.is_err() {
                    break;
                }
            }
        });

        vec![submit, forward]
    }
}

impl StarterInner {
    async fn handle(&self, event: &ObjectEvent) -> Result<()> {
        let document_id = tagged_document_id(self.store.as_ref(), &event.bucket, &event.key).await?;
        let scope = self.ops.scope(
            document_id,
            &event.bucket,
            &event.key,
            PipelineStage::AsyncAwaitingJob,
        );
        scope.in_progress()?;

        // The id as client token makes a redelivered submission resolve to
        // the job already running instead of starting a second one.
        let started = self
            .ocr
            .start_analysis(
                &event.bucket,
                &event.key,
                &document_id.to_string(),
                document_id,
                self.notice_tx.clone(),
            )
            .await;
        let job_id = match started {
            Ok(job_id) => job_id,
            Err(e) => {
                scope.failed(&e.to_string())?;
                return Err(e);
            }
        };

        tracing::info!(document_id = %document_id, job_id = %job_id, "analysis job started");
        scope.with_job(&job_id).succeeded()
    }
}

/// Drains completion notices one at a time, fetching results and writing
/// the OCR artifacts
pub struct AsyncResultProcessor {
    inner: Arc<ResultInner>,
    delivery: DeliveryConfig,
}

struct ResultInner {
    store: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrProvider>,
    ops: OpsPublisher,
    lineage: LineagePublisher,
    results_bucket: String,
    fetch_budget: std::time::Duration,
}

impl AsyncResultProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrProvider>,
        ops: OpsPublisher,
        lineage: LineagePublisher,
        results_bucket: String,
        fetch_budget: std::time::Duration,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ResultInner {
                store,
                ocr,
                ops,
                lineage,
                results_bucket,
                fetch_budget,
            }),
            delivery,
        }
    }

    pub fn spawn(self, mut results_rx: mpsc::Receiver<JobNotice>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(notice) = results_rx.recv().await {
                deliver_with_retry(&self.delivery, "async-ocr-result", || {
                    self.inner.handle(&notice)
                })
                .await;
            }
        })
    }
}

impl ResultInner {
    async fn handle(&self, notice: &JobNotice) -> Result<()> {
        let scope = self
            .ops
            .scope(
                notice.job_tag,
                &notice.bucket,
                &notice.object_key,
                PipelineStage::AsyncProcessing,
            )
            .with_job(&notice.job_id);

        if notice.status == JobStatus::Failed {
            // Terminal: the job service will not succeed on replay
            let err = Error::JobFailed {
                job_id: notice.job_id.clone(),
                document_id: notice.job_tag,
                message: notice
                    .message
                    .clone()
                    .unwrap_or_else(|| "analysis job failed".to_string()),
            };
            return scope.failed(&err.to_string());
        }
        scope.in_progress()?;

        let fetched = timeout(self.fetch_budget, self.ocr.fetch_job_result(&notice.job_id))
            .await
            .map_err(|_| Error::Timeout {
                service: self.ocr.name().to_string(),
                secs: self.fetch_budget.as_secs(),
            })
            .and_then(|r| r);
        let result = match fetched {
            Ok(result) => result,
            Err(e) => {
                scope.failed(&e.to_string())?;
                return Err(e);
            }
        };
        tracing::info!(
            document_id = %notice.job_tag,
            job_id = %notice.job_id,
            pages = result.page_count(),
            "analysis job result fetched"
        );

        let full_key = write_ocr_artifacts(
            self.store.as_ref(),
            &self.results_bucket,
            notice.job_tag,
            &notice.object_key,
            &result,
            CALLER,
        )
        .await?;
        self.lineage.record_lineage(LineageEvent {
            document_id: Some(notice.job_tag),
            caller: CALLER.to_string(),
            target_bucket: self.results_bucket.clone(),
            target_key: full_key,
            kind: ObjectEventKind::Created,
            source_bucket: Some(notice.bucket.clone()),
            source_key: Some(notice.object_key.clone()),
            version: None,
        })?;
        scope.succeeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MetadataBus, MetadataFilter};
    use crate::config::BusConfig;
    use crate::providers::LocalOcrEngine;
    use crate::storage::{MemoryObjectStore, DOCUMENT_ID_TAG};
    use crate::types::{MetadataPayload, MetadataType, StageStatus};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    async fn staged(store: &MemoryObjectStore, id: &Uuid, key: &str) {
        store
            .put(
                "async-staging",
                key,
                Bytes::from("pdf body"),
                HashMap::from([(DOCUMENT_ID_TAG.to_string(), id.to_string())]),
                "router",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn started_job_is_recorded_with_its_reference() {
        let store = Arc::new(MemoryObjectStore::new());
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let mut rx = bus.subscribe(MetadataFilter::only(MetadataType::PipelineOperations));
        let (notice_tx, mut notice_rx) = mpsc::channel(8);

        let starter = AsyncOcrStarter::new(
            store.clone(),
            Arc::new(LocalOcrEngine::new(store.clone())),
            OpsPublisher::new(bus),
            notice_tx,
            50,
            DeliveryConfig::default(),
        );

        let id = Uuid::new_v4();
        let key = format!("{}/report.pdf", id);
        staged(&store, &id, &key).await;
        starter
            .inner
            .handle(&ObjectEvent {
                bucket: "async-staging".into(),
                key: key.clone(),
                kind: ObjectEventKind::Copied,
                writer: "router".into(),
                version: None,
            })
            .await
            .unwrap();

        let notice = notice_rx.recv().await.unwrap();
        assert_eq!(notice.job_tag, id);

        let mut last_job_id = None;
        while let Ok(event) = rx.try_recv() {
            if let MetadataPayload::Ops(e) = event.payload {
                if e.status == StageStatus::Succeeded {
                    last_job_id = e.job_id;
                }
            }
        }
        assert_eq!(last_job_id.as_deref(), Some(notice.job_id.as_str()));
    }

    fn result_processor(
        store: Arc<MemoryObjectStore>,
        ocr: Arc<dyn OcrProvider>,
        bus: Arc<MetadataBus>,
    ) -> AsyncResultProcessor {
        AsyncResultProcessor::new(
            store,
            ocr,
            OpsPublisher::new(bus.clone()),
            LineagePublisher::new(bus),
            "ocr-results".into(),
            Duration::from_secs(900),
            DeliveryConfig::default(),
        )
    }

    #[tokio::test]
    async fn duplicate_completion_notices_converge_on_one_artifact_set() {
        let store = Arc::new(MemoryObjectStore::new());
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let ocr = Arc::new(LocalOcrEngine::new(store.clone()));

        let id = Uuid::new_v4();
        let key = format!("{}/report.pdf", id);
        staged(&store, &id, &key).await;

        let (notice_tx, mut notice_rx) = mpsc::channel(8);
        ocr.start_analysis("async-staging", &key, &id.to_string(), id, notice_tx)
            .await
            .unwrap();
        let notice = notice_rx.recv().await.unwrap();

        let mut results_rx = store.subscribe("ocr-results", Some("fullresponse.json".into()));
        let processor = result_processor(store.clone(), ocr, bus);
        processor.inner.handle(&notice).await.unwrap();
        processor.inner.handle(&notice).await.unwrap();

        // Deterministic keys: the replay overwrote the same objects.
        assert!(results_rx.try_recv().is_ok());
        assert!(results_rx.try_recv().is_ok());
        assert!(store
            .exists("ocr-results", &format!("{}/ocr-analysis/fullresponse.json", key))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failed_job_is_terminal() {
        let store = Arc::new(MemoryObjectStore::new());
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let mut rx = bus.subscribe(MetadataFilter::only(MetadataType::PipelineOperations));
        let ocr: Arc<dyn OcrProvider> = Arc::new(LocalOcrEngine::new(store.clone()));
        let processor = result_processor(store.clone(), ocr, bus);

        let id = Uuid::new_v4();
        processor
            .inner
            .handle(&JobNotice {
                job_id: "job-9".into(),
                job_tag: id,
                status: JobStatus::Failed,
                bucket: "async-staging".into(),
                object_key: format!("{}/report.pdf", id),
                message: Some("unreadable document".into()),
            })
            .await
            .unwrap();

        match rx.try_recv().unwrap().payload {
            MetadataPayload::Ops(e) => {
                assert_eq!(e.stage, PipelineStage::AsyncProcessing);
                assert_eq!(e.status, StageStatus::Failed);
                assert_eq!(e.job_id.as_deref(), Some("job-9"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(!store
            .exists("ocr-results", &format!("{}/report.pdf/ocr-analysis/fullresponse.json", id))
            .await
            .unwrap());
    }
}
