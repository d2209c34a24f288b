//! Extension router: sends each admitted document down the sync or async
//! OCR path
//!
//! Consumes freshly opened pipeline-operations records from the change
//! feed, picks a path from the file extension, and copies the object into
//! the matching staging bucket under a deterministic `{id}/{key}` layout
//! so a redelivered copy overwrites instead of duplicating.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{deliver_with_retry, LineagePublisher, OpsPublisher};
use crate::config::{BucketConfig, DeliveryConfig};
use crate::error::{Error, Result};
use crate::storage::{ObjectStore, OpsRecord};
use crate::types::{staged_key, PipelineStage, RoutePath};

const CALLER: &str = "router";

pub struct ExtensionRouter {
    store: Arc<dyn ObjectStore>,
    ops: OpsPublisher,
    lineage: LineagePublisher,
    buckets: BucketConfig,
    delivery: DeliveryConfig,
}

impl ExtensionRouter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        ops: OpsPublisher,
        lineage: LineagePublisher,
        buckets: BucketConfig,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            ops,
            lineage,
            buckets,
            delivery,
        }
    }

    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<OpsRecord>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                deliver_with_retry(&self.delivery, "router", || self.handle(&record)).await;
            }
        })
    }

    async fn handle(&self, record: &OpsRecord) -> Result<()> {
        // Only freshly classified documents move on; records opened at
        // REGISTERED are terminal.
        if record.stage != PipelineStage::Classified {
            return Ok(());
        }

        let scope = self.ops.scope(
            record.document_id,
            &record.bucket,
            &record.object_key,
            PipelineStage::Routed,
        );

        let Some(route) = RoutePath::for_key(&record.object_key) else {
            // Terminal: a new notification for the same key would fail again
            let err = Error::UnsupportedExtension(record.object_key.clone());
            return scope.failed(&err.to_string());
        };
        let scope = scope.with_route(route);
        scope.in_progress()?;

        let target_bucket = match route {
            RoutePath::Sync => &self.buckets.sync_staging,
            RoutePath::Async => &self.buckets.async_staging,
        };
        let target_key = staged_key(&record.document_id, &record.object_key);

        tracing::info!(
            document_id = %record.document_id,
            %route,
            target = %format!("{}/{}", target_bucket, target_key),
            "routing document"
        );
        self.store
            .copy(
                &record.bucket,
                &record.object_key,
                target_bucket,
                &target_key,
                CALLER,
            )
            .await?;
        self.lineage.record_lineage_of_copy(
            record.document_id,
            CALLER,
            &record.bucket,
            &record.object_key,
            target_bucket,
            &target_key,
        )?;
        scope.succeeded()
    }
}
