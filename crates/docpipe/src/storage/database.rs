//! SQLite-backed durable stores: registry, pipeline-ops, lineage
//!
//! The three stores are the only shared mutable state in the pipeline.
//! Writers use create-if-absent / upsert / append semantics keyed by
//! document id (plus timestamp for lineage) so concurrent writers for
//! different documents never conflict and redelivered writes for the same
//! document are harmless.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{DocumentId, ObjectEventKind, PipelineStage, RoutePath, StageStatus};

/// Registry record: one row per document, created once at ingestion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryRecord {
    pub document_id: DocumentId,
    pub bucket: String,
    pub object_key: String,
    pub link: String,
    pub writer: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One datapoint in a document's pipeline-operations timeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: PipelineStage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Pipeline-operations record: latest known stage plus full timeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpsRecord {
    pub document_id: DocumentId,
    pub bucket: String,
    pub object_key: String,
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub route: Option<RoutePath>,
    pub job_id: Option<String>,
    pub last_update: DateTime<Utc>,
    pub timeline: Vec<TimelineEntry>,
}

/// Lineage record: one append-only hop in a document's audit trail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageRecord {
    pub document_id: DocumentId,
    pub timestamp: DateTime<Utc>,
    pub document_signature: String,
    pub caller: String,
    pub target_bucket: String,
    pub target_key: String,
    pub kind: ObjectEventKind,
    pub source_bucket: Option<String>,
    pub source_key: Option<String>,
    pub version: Option<String>,
}

/// Content signature used by the lineage secondary index to answer
/// "what happened to the document at this location" without a table scan
pub fn document_signature(bucket: &str, key: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("BUCKET:{}@FILE:{}@VERSION:{}", bucket, key, v),
        None => format!("BUCKET:{}@FILE:{}", bucket, key),
    }
}

/// The durable metadata database
pub struct PipelineDb {
    conn: Arc<Mutex<Connection>>,
}

impl PipelineDb {
    /// Create or open the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (tests and ephemeral pipelines)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("failed to open in-memory database: {}", e)))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::Storage(format!("failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS registry (
                document_id TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                object_key TEXT NOT NULL,
                link TEXT NOT NULL,
                writer TEXT NOT NULL,
                metadata TEXT NOT NULL,
                version TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pipeline_ops (
                document_id TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                object_key TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                route TEXT,
                job_id TEXT,
                last_update TEXT NOT NULL,
                timeline TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lineage (
                document_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                document_signature TEXT NOT NULL,
                caller TEXT NOT NULL,
                target_bucket TEXT NOT NULL,
                target_key TEXT NOT NULL,
                storage_event TEXT NOT NULL,
                source_bucket TEXT,
                source_key TEXT,
                version TEXT,
                PRIMARY KEY (document_id, ts)
            );

            CREATE INDEX IF NOT EXISTS lineage_by_signature
                ON lineage (document_signature, ts);
        "#,
        )
        .map_err(|e| Error::Storage(format!("failed to create tables: {}", e)))?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Create-if-absent registration. Returns true when a new row was
    /// inserted; re-registration of a known document id is a no-op success.
    pub fn register_document(&self, record: &RegistryRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let metadata = serde_json::to_string(&record.metadata)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO registry
                (document_id, bucket, object_key, link, writer, metadata, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.document_id.to_string(),
                record.bucket,
                record.object_key,
                record.link,
                record.writer,
                metadata,
                record.version,
                record.created_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_registration(&self, document_id: &DocumentId) -> Result<Option<RegistryRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT document_id, bucket, object_key, link, writer, metadata, version, created_at
             FROM registry WHERE document_id = ?1",
            params![document_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, DateTime<Utc>>(7)?,
                ))
            },
        )
        .optional()?
        .map(
            |(id, bucket, object_key, link, writer, metadata, version, created_at)| {
                Ok(RegistryRecord {
                    document_id: parse_document_id(&id)?,
                    bucket,
                    object_key,
                    link,
                    writer,
                    metadata: serde_json::from_str(&metadata)?,
                    version,
                    created_at,
                })
            },
        )
        .transpose()
    }

    // ------------------------------------------------------------------
    // Pipeline operations
    // ------------------------------------------------------------------

    /// Open tracking for a document. Returns true when the row was created;
    /// a duplicate init under at-least-once redelivery is a no-op success.
    pub fn start_tracking(&self, record: &OpsRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let timeline = serde_json::to_string(&record.timeline)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO pipeline_ops
                (document_id, bucket, object_key, stage, status, route, job_id, last_update, timeline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.document_id.to_string(),
                record.bucket,
                record.object_key,
                record.stage.to_string(),
                record.status.to_string(),
                record.route.map(|r| r.to_string()),
                record.job_id,
                record.last_update,
                timeline,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Upsert the latest stage/status and append a timeline datapoint.
    /// Fails with `MissingRecord` when the document is not tracked yet.
    #[allow(clippy::too_many_arguments)]
    pub fn update_status(
        &self,
        document_id: &DocumentId,
        stage: PipelineStage,
        status: StageStatus,
        timestamp: DateTime<Utc>,
        route: Option<RoutePath>,
        job_id: Option<&str>,
        message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let timeline_json: Option<String> = conn
            .query_row(
                "SELECT timeline FROM pipeline_ops WHERE document_id = ?1",
                params![document_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(timeline_json) = timeline_json else {
            return Err(Error::MissingRecord(*document_id));
        };

        let mut timeline: Vec<TimelineEntry> = serde_json::from_str(&timeline_json)?;
        timeline.push(TimelineEntry {
            timestamp,
            stage,
            status,
            message: message.map(String::from),
        });

        conn.execute(
            "UPDATE pipeline_ops
             SET stage = ?2,
                 status = ?3,
                 last_update = ?4,
                 timeline = ?5,
                 route = COALESCE(?6, route),
                 job_id = COALESCE(?7, job_id)
             WHERE document_id = ?1",
            params![
                document_id.to_string(),
                stage.to_string(),
                status.to_string(),
                timestamp,
                serde_json::to_string(&timeline)?,
                route.map(|r| r.to_string()),
                job_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_document(&self, document_id: &DocumentId) -> Result<Option<OpsRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT document_id, bucket, object_key, stage, status, route, job_id, last_update, timeline
             FROM pipeline_ops WHERE document_id = ?1",
            params![document_id.to_string()],
            row_to_ops_tuple,
        )
        .optional()?
        .map(ops_record_from_tuple)
        .transpose()
    }

    /// Page through tracked documents in document-id order
    pub fn list_documents(&self, limit: usize, offset: usize) -> Result<Vec<OpsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT document_id, bucket, object_key, stage, status, route, job_id, last_update, timeline
             FROM pipeline_ops ORDER BY document_id LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_ops_tuple)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(ops_record_from_tuple(row?)?);
        }
        Ok(records)
    }

    /// Administrative removal. The pipeline itself never deletes ops rows.
    pub fn delete_document(&self, document_id: &DocumentId) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pipeline_ops WHERE document_id = ?1",
            params![document_id.to_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lineage
    // ------------------------------------------------------------------

    /// Append a lineage record. Replaying an identical record (same
    /// document id and timestamp) overwrites in place.
    pub fn create_lineage(&self, record: &LineageRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO lineage
                (document_id, ts, document_signature, caller, target_bucket, target_key,
                 storage_event, source_bucket, source_key, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.document_id.to_string(),
                record.timestamp,
                record.document_signature,
                record.caller,
                record.target_bucket,
                record.target_key,
                record.kind.to_string(),
                record.source_bucket,
                record.source_key,
                record.version,
            ],
        )?;
        Ok(())
    }

    /// Resolve a content signature to the earliest document id that touched
    /// that location; `None` when the signature was never seen.
    pub fn query_document_id(&self, signature: &str) -> Result<Option<DocumentId>> {
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT document_id FROM lineage
                 WHERE document_signature = ?1
                 ORDER BY ts ASC LIMIT 1",
                params![signature],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|id| parse_document_id(&id)).transpose()
    }

    /// Full audit trail for one document, oldest first
    pub fn lineage_for(&self, document_id: &DocumentId) -> Result<Vec<LineageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT document_id, ts, document_signature, caller, target_bucket, target_key,
                    storage_event, source_bucket, source_key, version
             FROM lineage WHERE document_id = ?1 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![document_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, DateTime<Utc>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (id, ts, signature, caller, target_bucket, target_key, event, source_bucket, source_key, version) =
                row?;
            records.push(LineageRecord {
                document_id: parse_document_id(&id)?,
                timestamp: ts,
                document_signature: signature,
                caller,
                target_bucket,
                target_key,
                kind: ObjectEventKind::from_str(&event)?,
                source_bucket,
                source_key,
                version,
            });
        }
        Ok(records)
    }
}

type OpsTuple = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    String,
);

fn row_to_ops_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpsTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn ops_record_from_tuple(tuple: OpsTuple) -> Result<OpsRecord> {
    let (id, bucket, object_key, stage, status, route, job_id, last_update, timeline) = tuple;
    Ok(OpsRecord {
        document_id: parse_document_id(&id)?,
        bucket,
        object_key,
        stage: PipelineStage::from_str(&stage)?,
        status: StageStatus::from_str(&status)?,
        route: route.as_deref().map(RoutePath::from_str).transpose()?,
        job_id,
        last_update,
        timeline: serde_json::from_str(&timeline)?,
    })
}

fn parse_document_id(raw: &str) -> Result<DocumentId> {
    Uuid::parse_str(raw).map_err(|e| Error::Storage(format!("corrupt document id {:?}: {}", raw, e)))
}
