//! Sync OCR processor: inline text detection for image documents
//!
//! Concurrency is capped (default 1) to respect the synchronous OCR
//! backend's per-second request limit; waiting work queues on the
//! notification channel. Every external call runs under a timeout that
//! stays inside the notification trigger's own window.

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bus::{deliver_with_retry, LineagePublisher, OpsPublisher};
use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::providers::OcrProvider;
use crate::storage::ObjectStore;
use crate::types::{LineageEvent, ObjectEvent, ObjectEventKind, PipelineStage};

use super::{tagged_document_id, write_ocr_artifacts};

const CALLER: &str = "sync-ocr";

pub struct SyncOcrProcessor {
    inner: Arc<Inner>,
    semaphore: Arc<Semaphore>,
    delivery: DeliveryConfig,
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrProvider>,
    ops: OpsPublisher,
    lineage: LineagePublisher,
    results_bucket: String,
    call_budget: std::time::Duration,
}

impl SyncOcrProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrProvider>,
        ops: OpsPublisher,
        lineage: LineagePublisher,
        results_bucket: String,
        concurrency: usize,
        call_budget: std::time::Duration,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                ocr,
                ops,
                lineage,
                results_bucket,
                call_budget,
            }),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            delivery,
        }
    }

    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<ObjectEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
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
                    deliver_with_retry(&delivery, "sync-ocr", || inner.handle(&event)).await;
                });
            }
        })
    }
}

impl Inner {
    async fn handle(&self, event: &ObjectEvent) -> Result<()> {
        let document_id = tagged_document_id(self.store.as_ref(), &event.bucket, &event.key).await?;
        let scope = self
            .ops
            .scope(document_id, &event.bucket, &event.key, PipelineStage::SyncProcessing);
        scope.in_progress()?;

        let detection = timeout(self.call_budget, self.ocr.detect_text(&event.bucket, &event.key))
            .await
            .map_err(|_| Error::Timeout {
                service: self.ocr.name().to_string(),
                secs: self.call_budget.as_secs(),
            })
            .and_then(|r| r);

        let result = match detection {
            Ok(result) => result,
            Err(e) => {
                scope.failed(&e.to_string())?;
                return Err(e);
            }
        };
        tracing::info!(
            document_id = %document_id,
            pages = result.page_count(),
            "sync text detection complete"
        );

        let full_key = write_ocr_artifacts(
            self.store.as_ref(),
            &self.results_bucket,
            document_id,
            &event.key,
            &result,
            CALLER,
        )
        .await?;
        self.lineage.record_lineage(LineageEvent {
            document_id: Some(document_id),
            caller: CALLER.to_string(),
            target_bucket: self.results_bucket.clone(),
            target_key: full_key,
            kind: ObjectEventKind::Created,
            source_bucket: Some(event.bucket.clone()),
            source_key: Some(event.key.clone()),
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

    fn processor(
        store: Arc<MemoryObjectStore>,
        bus: Arc<MetadataBus>,
    ) -> SyncOcrProcessor {
        SyncOcrProcessor::new(
            store.clone(),
            Arc::new(LocalOcrEngine::new(store)),
            OpsPublisher::new(bus.clone()),
            LineagePublisher::new(bus),
            "ocr-results".into(),
            1,
            Duration::from_secs(25),
            DeliveryConfig::default(),
        )
    }

    async fn stage_object(store: &MemoryObjectStore, id: &Uuid, key: &str, body: &str) {
        store
            .put(
                "sync-staging",
                key,
                Bytes::from(body.to_string()),
                HashMap::from([(DOCUMENT_ID_TAG.to_string(), id.to_string())]),
                "router",
            )
            .await
            .unwrap();
    }

    fn staged_event(key: &str) -> ObjectEvent {
        ObjectEvent {
            bucket: "sync-staging".into(),
            key: key.into(),
            kind: ObjectEventKind::Copied,
            writer: "router".into(),
            version: None,
        }
    }

    #[tokio::test]
    async fn detection_writes_page_artifacts_and_full_response() {
        let store = Arc::new(MemoryObjectStore::new());
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let processor = processor(store.clone(), bus);

        let id = Uuid::new_v4();
        let key = format!("{}/doc-1.png", id);
        stage_object(&store, &id, &key, "page one\u{c}page two").await;

        processor.inner.handle(&staged_event(&key)).await.unwrap();

        for artifact in [
            format!("{}/ocr-analysis/page-1/response.json", key),
            format!("{}/ocr-analysis/page-2/text.txt", key),
            format!("{}/ocr-analysis/fullresponse.json", key),
        ] {
            assert!(store.exists("ocr-results", &artifact).await.unwrap());
        }
        let tags = store
            .get_tags(
                "ocr-results",
                &format!("{}/ocr-analysis/fullresponse.json", key),
            )
            .await
            .unwrap();
        assert_eq!(tags.get(DOCUMENT_ID_TAG), Some(&id.to_string()));
    }

    #[tokio::test]
    async fn untagged_staged_object_is_rejected() {
        let store = Arc::new(MemoryObjectStore::new());
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let processor = processor(store.clone(), bus);

        store
            .put("sync-staging", "orphan.png", Bytes::from("x"), HashMap::new(), "router")
            .await
            .unwrap();
        let err = processor
            .inner
            .handle(&staged_event("orphan.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UntaggedObject { .. }));
    }

    struct ThrottledOcr;

    #[async_trait::async_trait]
    impl OcrProvider for ThrottledOcr {
        async fn detect_text(&self, _bucket: &str, _key: &str) -> crate::error::Result<crate::providers::OcrResult> {
            Err(Error::ExternalService {
                service: "ocr".into(),
                message: "throttled".into(),
            })
        }

        async fn start_analysis(
            &self,
            _bucket: &str,
            _key: &str,
            _client_token: &str,
            _job_tag: Uuid,
            _notify: mpsc::Sender<crate::types::JobNotice>,
        ) -> crate::error::Result<String> {
            unreachable!()
        }

        async fn fetch_job_result(&self, _job_id: &str) -> crate::error::Result<crate::providers::OcrResult> {
            unreachable!()
        }

        fn name(&self) -> &str {
            "throttled-ocr"
        }
    }

    #[tokio::test]
    async fn backend_failure_reports_stage_failure_and_propagates() {
        let store = Arc::new(MemoryObjectStore::new());
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let mut rx = bus.subscribe(MetadataFilter::only(MetadataType::PipelineOperations));
        let processor = SyncOcrProcessor::new(
            store.clone(),
            Arc::new(ThrottledOcr),
            OpsPublisher::new(bus.clone()),
            LineagePublisher::new(bus),
            "ocr-results".into(),
            1,
            Duration::from_secs(25),
            DeliveryConfig::default(),
        );

        let id = Uuid::new_v4();
        let key = format!("{}/doc-1.png", id);
        stage_object(&store, &id, &key, "body").await;

        assert!(processor.inner.handle(&staged_event(&key)).await.is_err());

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let MetadataPayload::Ops(e) = event.payload {
                saw_failed |= e.status == StageStatus::Failed;
            }
        }
        assert!(saw_failed);
    }
}
