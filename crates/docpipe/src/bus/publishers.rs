//! Typed publisher facades over the metadata bus
//!
//! Each pipeline component holds only the publishers it needs; the facades
//! stamp timestamps and fill the per-type payload shape so call sites stay
//! small.

use std::sync::Arc;

use crate::error::Result;
use crate::types::{
    DocumentId, LineageEvent, MetadataEvent, MetadataPayload, ObjectEventKind, OpsEvent,
    PipelineStage, RegistryEvent, RoutePath, StageStatus,
};

use super::MetadataBus;

/// Publishes `document-registry` events
#[derive(Clone)]
pub struct RegistryPublisher {
    bus: Arc<MetadataBus>,
    /// Metadata merged into every registration (owner, class defaults)
    defaults: serde_json::Map<String, serde_json::Value>,
}

impl RegistryPublisher {
    pub fn new(bus: Arc<MetadataBus>, owner: &str, class: &str) -> Self {
        let mut defaults = serde_json::Map::new();
        defaults.insert("owner".to_string(), owner.into());
        defaults.insert("class".to_string(), class.into());
        Self { bus, defaults }
    }

    pub fn register_document(
        &self,
        document_id: DocumentId,
        bucket: &str,
        object_key: &str,
        writer: &str,
        version: Option<String>,
    ) -> Result<()> {
        let event = RegistryEvent {
            document_id,
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            link: format!("store://{}/{}", bucket, object_key),
            writer: writer.to_string(),
            metadata: self.defaults.clone(),
            version,
        };
        self.bus
            .publish(MetadataEvent::now(MetadataPayload::Registry(event)))
    }
}

/// Publishes `document-lineage` events
#[derive(Clone)]
pub struct LineagePublisher {
    bus: Arc<MetadataBus>,
}

impl LineagePublisher {
    pub fn new(bus: Arc<MetadataBus>) -> Self {
        Self { bus }
    }

    /// Record a direct write (or removal) hop
    pub fn record_lineage(&self, event: LineageEvent) -> Result<()> {
        tracing::debug!(
            document_id = ?event.document_id,
            target = %format!("{}/{}", event.target_bucket, event.target_key),
            kind = ?event.kind,
            "recording lineage"
        );
        self.bus
            .publish(MetadataEvent::now(MetadataPayload::Lineage(event)))
    }

    /// Record an inter-bucket copy hop
    pub fn record_lineage_of_copy(
        &self,
        document_id: DocumentId,
        caller: &str,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
    ) -> Result<()> {
        self.record_lineage(LineageEvent {
            document_id: Some(document_id),
            caller: caller.to_string(),
            target_bucket: target_bucket.to_string(),
            target_key: target_key.to_string(),
            kind: ObjectEventKind::Copied,
            source_bucket: Some(source_bucket.to_string()),
            source_key: Some(source_key.to_string()),
            version: None,
        })
    }
}

/// Publishes `pipeline-operations` events
#[derive(Clone)]
pub struct OpsPublisher {
    bus: Arc<MetadataBus>,
}

impl OpsPublisher {
    pub fn new(bus: Arc<MetadataBus>) -> Self {
        Self { bus }
    }

    /// Fix the document/stage coordinates for a sequence of status updates
    pub fn scope(
        &self,
        document_id: DocumentId,
        bucket: &str,
        object_key: &str,
        stage: PipelineStage,
    ) -> OpsScope {
        OpsScope {
            bus: self.bus.clone(),
            document_id,
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            stage,
            route: None,
            job_id: None,
        }
    }
}

/// One document's status updates within a single stage
pub struct OpsScope {
    bus: Arc<MetadataBus>,
    document_id: DocumentId,
    bucket: String,
    object_key: String,
    stage: PipelineStage,
    route: Option<RoutePath>,
    job_id: Option<String>,
}

impl OpsScope {
    /// Attach the routing decision to subsequent events
    pub fn with_route(mut self, route: RoutePath) -> Self {
        self.route = Some(route);
        self
    }

    /// Attach the external job reference to subsequent events
    pub fn with_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    fn publish(&self, status: StageStatus, init_doc: bool, message: Option<&str>) -> Result<()> {
        let event = OpsEvent {
            document_id: self.document_id,
            bucket: self.bucket.clone(),
            object_key: self.object_key.clone(),
            stage: self.stage,
            status,
            init_doc,
            route: self.route,
            job_id: self.job_id.clone(),
            message: message.map(String::from),
        };
        self.bus
            .publish(MetadataEvent::now(MetadataPayload::Ops(event)))
    }

    /// Open tracking for this document (first pipeline-operations record)
    pub fn init_doc(&self) -> Result<()> {
        self.publish(StageStatus::InProgress, true, None)
    }

    pub fn in_progress(&self) -> Result<()> {
        self.publish(StageStatus::InProgress, false, None)
    }

    pub fn succeeded(&self) -> Result<()> {
        self.publish(StageStatus::Succeeded, false, None)
    }

    pub fn failed(&self, message: &str) -> Result<()> {
        tracing::warn!(
            document_id = %self.document_id,
            stage = %self.stage,
            message,
            "stage failed"
        );
        self.publish(StageStatus::Failed, false, Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MetadataFilter;
    use crate::config::BusConfig;
    use crate::types::MetadataType;
    use uuid::Uuid;

    #[test]
    fn scope_publishes_status_sequence_in_order() {
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let mut rx = bus.subscribe(MetadataFilter::only(MetadataType::PipelineOperations));

        let ops = OpsPublisher::new(bus);
        let scope = ops
            .scope(Uuid::nil(), "intake", "doc-1.png", PipelineStage::Routed)
            .with_route(RoutePath::Sync);
        scope.in_progress().unwrap();
        scope.succeeded().unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        match (first.payload, second.payload) {
            (MetadataPayload::Ops(a), MetadataPayload::Ops(b)) => {
                assert_eq!(a.status, StageStatus::InProgress);
                assert_eq!(b.status, StageStatus::Succeeded);
                assert_eq!(b.route, Some(RoutePath::Sync));
            }
            other => panic!("unexpected payloads: {:?}", other),
        }
    }

    #[test]
    fn registration_carries_default_metadata() {
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let mut rx = bus.subscribe(MetadataFilter::only(MetadataType::DocumentRegistry));

        let registry = RegistryPublisher::new(bus, "team-a", "external_public_report");
        registry
            .register_document(Uuid::nil(), "intake", "doc-1.png", "uploader", None)
            .unwrap();

        match rx.try_recv().unwrap().payload {
            MetadataPayload::Registry(e) => {
                assert_eq!(e.metadata["class"], "external_public_report");
                assert_eq!(e.link, "store://intake/doc-1.png");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
