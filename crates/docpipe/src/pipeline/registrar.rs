//! Document registrar: first touch of every intake object
//!
//! Assigns the canonical document id, stamps it onto the object as a tag,
//! and announces the registration and the initial lineage hop. Removal
//! notifications become lineage hops without an id; the lineage writer
//! resolves them through the signature index.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{deliver_with_retry, LineagePublisher, RegistryPublisher};
use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::storage::{ObjectStore, DOCUMENT_ID_TAG};
use crate::types::{DocumentId, LineageEvent, ObjectEvent, ObjectEventKind};

const CALLER: &str = "registrar";

pub struct Registrar {
    store: Arc<dyn ObjectStore>,
    registry: RegistryPublisher,
    lineage: LineagePublisher,
    delivery: DeliveryConfig,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: RegistryPublisher,
        lineage: LineagePublisher,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            lineage,
            delivery,
        }
    }

    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<ObjectEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver_with_retry(&self.delivery, "registrar", || self.handle(&event)).await;
            }
        })
    }

    async fn handle(&self, event: &ObjectEvent) -> Result<()> {
        if event.kind.is_removal() {
            // The id died with the object tag; the signature resolves it.
            return self.lineage.record_lineage(LineageEvent {
                document_id: None,
                caller: CALLER.to_string(),
                target_bucket: event.bucket.clone(),
                target_key: event.key.clone(),
                kind: ObjectEventKind::Removed,
                source_bucket: None,
                source_key: None,
                version: event.version.clone(),
            });
        }

        let document_id = self.resolve_document_id(event).await?;
        tracing::info!(
            document_id = %document_id,
            bucket = %event.bucket,
            key = %event.key,
            "registering document"
        );

        self.registry.register_document(
            document_id,
            &event.bucket,
            &event.key,
            &event.writer,
            event.version.clone(),
        )?;
        self.lineage.record_lineage(LineageEvent {
            document_id: Some(document_id),
            caller: CALLER.to_string(),
            target_bucket: event.bucket.clone(),
            target_key: event.key.clone(),
            kind: event.kind,
            source_bucket: None,
            source_key: None,
            version: event.version.clone(),
        })
    }

    /// Reuse the tagged id on a redelivered notification; mint and stamp a
    /// fresh one on first sight.
    async fn resolve_document_id(&self, event: &ObjectEvent) -> Result<DocumentId> {
        let tags = self.store.get_tags(&event.bucket, &event.key).await?;
        if let Some(raw) = tags.get(DOCUMENT_ID_TAG) {
            return Uuid::parse_str(raw)
                .map_err(|e| Error::Malformed(format!("corrupt document id tag {:?}: {}", raw, e)));
        }

        let document_id = Uuid::new_v4();
        self.store
            .tag(
                &event.bucket,
                &event.key,
                DOCUMENT_ID_TAG,
                &document_id.to_string(),
            )
            .await?;
        Ok(document_id)
    }
}
