//! Classifier: admits registered documents into the processing pipeline
//!
//! Consumes committed registry records from the change feed. An eligible
//! class opens pipeline tracking at the CLASSIFIED stage; anything else is
//! tracked as REGISTERED only and never routed.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{deliver_with_retry, OpsPublisher};
use crate::config::{ClassificationConfig, DeliveryConfig};
use crate::error::Result;
use crate::storage::RegistryRecord;
use crate::types::PipelineStage;

pub struct Classifier {
    ops: OpsPublisher,
    policy: ClassificationConfig,
    delivery: DeliveryConfig,
}

impl Classifier {
    pub fn new(ops: OpsPublisher, policy: ClassificationConfig, delivery: DeliveryConfig) -> Self {
        Self {
            ops,
            policy,
            delivery,
        }
    }

    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<RegistryRecord>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                deliver_with_retry(&self.delivery, "classifier", || {
                    let outcome = self.handle(&record);
                    async move { outcome }
                })
                .await;
            }
        })
    }

    fn handle(&self, record: &RegistryRecord) -> Result<()> {
        let stage = if is_eligible(&self.policy, record) {
            PipelineStage::Classified
        } else {
            // Terminal: the router skips anything still at REGISTERED
            tracing::info!(
                document_id = %record.document_id,
                class = ?record.metadata.get("class"),
                "document class not eligible for processing"
            );
            PipelineStage::Registered
        };

        let scope = self.ops.scope(
            record.document_id,
            &record.bucket,
            &record.object_key,
            stage,
        );
        scope.init_doc()?;
        scope.succeeded()
    }
}

/// A document proceeds only when its `class` metadata names an eligible class
pub fn is_eligible(policy: &ClassificationConfig, record: &RegistryRecord) -> bool {
    record
        .metadata
        .get("class")
        .and_then(serde_json::Value::as_str)
        .map(|class| policy.eligible_classes.iter().any(|e| e == class))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MetadataBus, MetadataFilter};
    use crate::config::BusConfig;
    use crate::types::{MetadataPayload, MetadataType, StageStatus};
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    fn record(class: Option<&str>) -> RegistryRecord {
        let mut metadata = serde_json::Map::new();
        if let Some(class) = class {
            metadata.insert("class".to_string(), class.into());
        }
        RegistryRecord {
            document_id: Uuid::new_v4(),
            bucket: "document-intake".into(),
            object_key: "doc-1.png".into(),
            link: "store://document-intake/doc-1.png".into(),
            writer: "uploader".into(),
            metadata,
            version: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn eligibility_follows_the_class_list() {
        let policy = ClassificationConfig::default();
        assert!(is_eligible(&policy, &record(Some("internal_research_report"))));
        assert!(is_eligible(&policy, &record(Some("external_public_report"))));
        assert!(!is_eligible(&policy, &record(Some("meeting_notes"))));
        assert!(!is_eligible(&policy, &record(None)));
    }

    #[test]
    fn eligible_document_opens_tracking_then_succeeds() {
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let mut rx = bus.subscribe(MetadataFilter::only(MetadataType::PipelineOperations));
        let classifier = Classifier::new(
            OpsPublisher::new(bus),
            ClassificationConfig::default(),
            DeliveryConfig::default(),
        );

        classifier.handle(&record(Some("external_public_report"))).unwrap();

        match (rx.try_recv().unwrap().payload, rx.try_recv().unwrap().payload) {
            (MetadataPayload::Ops(init), MetadataPayload::Ops(done)) => {
                assert!(init.init_doc);
                assert_eq!(init.stage, PipelineStage::Classified);
                assert!(!done.init_doc);
                assert_eq!(done.status, StageStatus::Succeeded);
            }
            other => panic!("unexpected payloads: {:?}", other),
        }
    }

    #[test]
    fn ineligible_document_is_tracked_as_registered_only() {
        let bus = Arc::new(MetadataBus::new("t", &BusConfig::default()));
        let mut rx = bus.subscribe(MetadataFilter::only(MetadataType::PipelineOperations));
        let classifier = Classifier::new(
            OpsPublisher::new(bus),
            ClassificationConfig::default(),
            DeliveryConfig::default(),
        );

        classifier.handle(&record(Some("meeting_notes"))).unwrap();

        match (rx.try_recv().unwrap().payload, rx.try_recv().unwrap().payload) {
            (MetadataPayload::Ops(init), MetadataPayload::Ops(done)) => {
                assert!(init.init_doc);
                assert_eq!(init.stage, PipelineStage::Registered);
                assert_eq!(done.status, StageStatus::Succeeded);
            }
            other => panic!("unexpected payloads: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
