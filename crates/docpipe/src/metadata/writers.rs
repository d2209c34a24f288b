//! The three metadata writers, one per filtered bus subscription
//!
//! Each writer drains its own queue serially, applies the store's
//! idempotent write primitive, and for registry and pipeline-ops inserts
//! republishes the stored record on the corresponding change feed. The
//! change feeds are the ordering backbone of the pipeline: downstream
//! stages react to committed records, never to raw bus traffic.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::deliver_with_retry;
use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::storage::{
    document_signature, ChangeFeed, LineageRecord, OpsRecord, PipelineDb, RegistryRecord,
    TimelineEntry,
};
use crate::types::{LineageEvent, MetadataEvent, MetadataPayload, OpsEvent, RegistryEvent};

/// Persists document registrations and announces new ones on the feed
pub struct RegistryWriter {
    db: Arc<PipelineDb>,
    feed: Arc<ChangeFeed<RegistryRecord>>,
    delivery: DeliveryConfig,
}

impl RegistryWriter {
    pub fn new(
        db: Arc<PipelineDb>,
        feed: Arc<ChangeFeed<RegistryRecord>>,
        delivery: DeliveryConfig,
    ) -> Self {
        Self { db, feed, delivery }
    }

    pub fn spawn(self, mut rx: mpsc::Receiver<MetadataEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let MetadataPayload::Registry(registry) = event.payload else {
                    continue;
                };
                let record = registry_record(registry, &event.timestamp);
                deliver_with_retry(&self.delivery, "registry-writer", || {
                    let db = Arc::clone(&self.db);
                    let feed = Arc::clone(&self.feed);
                    let record = record.clone();
                    async move {
                        if db.register_document(&record)? {
                            info!(
                                document_id = %record.document_id,
                                bucket = %record.bucket,
                                object_key = %record.object_key,
                                "document registered"
                            );
                            feed.publish(record);
                        } else {
                            debug!(
                                document_id = %record.document_id,
                                "registration replay ignored"
                            );
                        }
                        Ok(())
                    }
                })
                .await;
            }
        })
    }
}

fn registry_record(event: RegistryEvent, timestamp: &chrono::DateTime<chrono::Utc>) -> RegistryRecord {
    RegistryRecord {
        document_id: event.document_id,
        bucket: event.bucket,
        object_key: event.object_key,
        link: event.link,
        writer: event.writer,
        metadata: event.metadata,
        version: event.version,
        created_at: *timestamp,
    }
}

/// Appends audit-trail hops, resolving a missing document id through the
/// signature index
pub struct LineageWriter {
    db: Arc<PipelineDb>,
    delivery: DeliveryConfig,
}

impl LineageWriter {
    pub fn new(db: Arc<PipelineDb>, delivery: DeliveryConfig) -> Self {
        Self { db, delivery }
    }

    pub fn spawn(self, mut rx: mpsc::Receiver<MetadataEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let MetadataPayload::Lineage(lineage) = event.payload else {
                    continue;
                };
                deliver_with_retry(&self.delivery, "lineage-writer", || {
                    let db = Arc::clone(&self.db);
                    let lineage = lineage.clone();
                    let timestamp = event.timestamp;
                    async move { write_lineage(&db, lineage, timestamp) }
                })
                .await;
            }
        })
    }
}

fn write_lineage(
    db: &PipelineDb,
    event: LineageEvent,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let signature = document_signature(
        &event.target_bucket,
        &event.target_key,
        event.version.as_deref(),
    );

    // Removal notifications arrive without an id; the signature of the
    // removed location identifies the document.
    let document_id = match event.document_id {
        Some(id) => id,
        None => match db.query_document_id(&signature)? {
            Some(id) => id,
            None => {
                warn!(
                    signature = %signature,
                    caller = %event.caller,
                    "lineage event for unknown document dropped"
                );
                return Ok(());
            }
        },
    };

    db.create_lineage(&LineageRecord {
        document_id,
        timestamp,
        document_signature: signature,
        caller: event.caller,
        target_bucket: event.target_bucket,
        target_key: event.target_key,
        kind: event.kind,
        source_bucket: event.source_bucket,
        source_key: event.source_key,
        version: event.version,
    })
}

/// Tracks pipeline progress, announcing freshly opened documents on the feed
pub struct OpsWriter {
    db: Arc<PipelineDb>,
    feed: Arc<ChangeFeed<OpsRecord>>,
    delivery: DeliveryConfig,
}

impl OpsWriter {
    pub fn new(
        db: Arc<PipelineDb>,
        feed: Arc<ChangeFeed<OpsRecord>>,
        delivery: DeliveryConfig,
    ) -> Self {
        Self { db, feed, delivery }
    }

    pub fn spawn(self, mut rx: mpsc::Receiver<MetadataEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let MetadataPayload::Ops(ops) = event.payload else {
                    continue;
                };
                deliver_with_retry(&self.delivery, "ops-writer", || {
                    let db = Arc::clone(&self.db);
                    let feed = Arc::clone(&self.feed);
                    let ops = ops.clone();
                    let timestamp = event.timestamp;
                    async move { write_ops(&db, &feed, ops, timestamp) }
                })
                .await;
            }
        })
    }
}

fn write_ops(
    db: &PipelineDb,
    feed: &ChangeFeed<OpsRecord>,
    event: OpsEvent,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    if event.init_doc {
        let record = OpsRecord {
            document_id: event.document_id,
            bucket: event.bucket,
            object_key: event.object_key,
            stage: event.stage,
            status: event.status,
            route: event.route,
            job_id: event.job_id,
            last_update: timestamp,
            timeline: vec![TimelineEntry {
                timestamp,
                stage: event.stage,
                status: event.status,
                message: event.message,
            }],
        };
        if db.start_tracking(&record)? {
            info!(
                document_id = %record.document_id,
                stage = %record.stage,
                "pipeline tracking opened"
            );
            feed.publish(record);
        } else {
            debug!(document_id = %record.document_id, "tracking init replay ignored");
        }
        return Ok(());
    }

    db.update_status(
        &event.document_id,
        event.stage,
        event.status,
        timestamp,
        event.route,
        event.job_id.as_deref(),
        event.message.as_deref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectEventKind, PipelineStage, RoutePath, StageStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn registry_event(id: Uuid) -> RegistryEvent {
        RegistryEvent {
            document_id: id,
            bucket: "intake".into(),
            object_key: "doc-1.png".into(),
            link: "store://intake/doc-1.png".into(),
            writer: "uploader".into(),
            metadata: serde_json::Map::new(),
            version: None,
        }
    }

    fn lineage_event(id: Option<Uuid>, key: &str) -> LineageEvent {
        LineageEvent {
            document_id: id,
            caller: "registrar".into(),
            target_bucket: "intake".into(),
            target_key: key.into(),
            kind: ObjectEventKind::Created,
            source_bucket: None,
            source_key: None,
            version: None,
        }
    }

    fn ops_init(id: Uuid) -> OpsEvent {
        OpsEvent {
            document_id: id,
            bucket: "intake".into(),
            object_key: "doc-1.png".into(),
            stage: PipelineStage::Classified,
            status: StageStatus::InProgress,
            init_doc: true,
            route: None,
            job_id: None,
            message: None,
        }
    }

    #[test]
    fn replayed_registration_publishes_one_feed_record() {
        let db = Arc::new(PipelineDb::in_memory().unwrap());
        let feed = ChangeFeed::default();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let record = registry_record(registry_event(id), &now);
        assert!(db.register_document(&record).unwrap());
        feed.publish(record.clone());
        // Replay: the store refuses the second insert, so no feed record.
        assert!(!db.register_document(&record).unwrap());

        let mut rx = feed.subscribe();
        assert_eq!(rx.try_recv().unwrap().document_id, id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn removal_lineage_is_resolved_through_the_signature_index() {
        let db = PipelineDb::in_memory().unwrap();
        let id = Uuid::new_v4();

        write_lineage(&db, lineage_event(Some(id), "doc-1.png"), Utc::now()).unwrap();

        let mut removal = lineage_event(None, "doc-1.png");
        removal.kind = ObjectEventKind::Removed;
        write_lineage(&db, removal, Utc::now() + chrono::Duration::milliseconds(5)).unwrap();

        let trail = db.lineage_for(&id).unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].kind, ObjectEventKind::Removed);
    }

    #[test]
    fn unresolvable_lineage_is_dropped_without_error() {
        let db = PipelineDb::in_memory().unwrap();
        write_lineage(&db, lineage_event(None, "never-seen.png"), Utc::now()).unwrap();
    }

    #[test]
    fn ops_init_then_update_builds_the_timeline() {
        let db = PipelineDb::in_memory().unwrap();
        let feed = ChangeFeed::default();
        let id = Uuid::new_v4();

        write_ops(&db, &feed, ops_init(id), Utc::now()).unwrap();

        let mut update = ops_init(id);
        update.init_doc = false;
        update.stage = PipelineStage::Routed;
        update.status = StageStatus::Succeeded;
        update.route = Some(RoutePath::Sync);
        write_ops(&db, &feed, update, Utc::now()).unwrap();

        let doc = db.get_document(&id).unwrap().unwrap();
        assert_eq!(doc.stage, PipelineStage::Routed);
        assert_eq!(doc.route, Some(RoutePath::Sync));
        assert_eq!(doc.timeline.len(), 2);

        // Only the init lands on the feed; the router keys off inserts.
        let mut rx = feed.subscribe();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ops_update_without_init_is_rejected() {
        let db = PipelineDb::in_memory().unwrap();
        let feed = ChangeFeed::default();
        let mut update = ops_init(Uuid::new_v4());
        update.init_doc = false;
        assert!(write_ops(&db, &feed, update, Utc::now()).is_err());
    }
}
