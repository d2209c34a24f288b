//! Metadata events, storage notifications, and job-completion notices

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::document::{DocumentId, PipelineStage, RoutePath, StageStatus};

/// Closed set of metadata event types used for subscriber-side filtering
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataType {
    DocumentRegistry,
    DocumentLineage,
    PipelineOperations,
}

impl std::fmt::Display for MetadataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MetadataType::DocumentRegistry => "document-registry",
            MetadataType::DocumentLineage => "document-lineage",
            MetadataType::PipelineOperations => "pipeline-operations",
        };
        write!(f, "{}", s)
    }
}

/// What happened to a stored object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectEventKind {
    /// Direct write into a bucket
    Created,
    /// Write produced by a copy between buckets
    Copied,
    /// Object deletion
    Removed,
}

impl ObjectEventKind {
    pub fn is_removal(&self) -> bool {
        matches!(self, ObjectEventKind::Removed)
    }
}

impl std::fmt::Display for ObjectEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObjectEventKind::Created => "created",
            ObjectEventKind::Copied => "copied",
            ObjectEventKind::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ObjectEventKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ObjectEventKind::Created),
            "copied" => Ok(ObjectEventKind::Copied),
            "removed" => Ok(ObjectEventKind::Removed),
            other => Err(crate::error::Error::Malformed(format!(
                "unknown object event kind {:?}",
                other
            ))),
        }
    }
}

/// Object-created / object-removed notification carrying bucket and key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectEvent {
    pub bucket: String,
    pub key: String,
    pub kind: ObjectEventKind,
    /// Principal that performed the write (uploader or pipeline component)
    pub writer: String,
    pub version: Option<String>,
}

/// Registration payload published on first touch of a document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEvent {
    pub document_id: DocumentId,
    pub bucket: String,
    pub object_key: String,
    /// Canonical source location, e.g. `store://bucket/key`
    pub link: String,
    pub writer: String,
    /// Free-form document metadata; `class` drives classification
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub version: Option<String>,
}

/// One hop in a document's audit trail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageEvent {
    /// None for removal events whose document id is resolved later via the
    /// content-signature index
    pub document_id: Option<DocumentId>,
    pub caller: String,
    pub target_bucket: String,
    pub target_key: String,
    pub kind: ObjectEventKind,
    pub source_bucket: Option<String>,
    pub source_key: Option<String>,
    pub version: Option<String>,
}

/// Pipeline-operations payload: a stage transition for one document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpsEvent {
    pub document_id: DocumentId,
    pub bucket: String,
    pub object_key: String,
    pub stage: PipelineStage,
    pub status: StageStatus,
    /// True on the event that opens tracking for a document
    pub init_doc: bool,
    /// Routing decision, present once the router has chosen a path
    pub route: Option<RoutePath>,
    /// External job reference, present once an async job has started
    pub job_id: Option<String>,
    pub message: Option<String>,
}

/// Typed payload of a metadata event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetadataPayload {
    Registry(RegistryEvent),
    Lineage(LineageEvent),
    Ops(OpsEvent),
}

impl MetadataPayload {
    pub fn metadata_type(&self) -> MetadataType {
        match self {
            MetadataPayload::Registry(_) => MetadataType::DocumentRegistry,
            MetadataPayload::Lineage(_) => MetadataType::DocumentLineage,
            MetadataPayload::Ops(_) => MetadataType::PipelineOperations,
        }
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            MetadataPayload::Registry(e) => Some(e.document_id),
            MetadataPayload::Lineage(e) => e.document_id,
            MetadataPayload::Ops(e) => Some(e.document_id),
        }
    }
}

/// A lifecycle notice published on the metadata topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataEvent {
    pub timestamp: DateTime<Utc>,
    pub payload: MetadataPayload,
}

impl MetadataEvent {
    /// Stamp a payload with the current time
    pub fn now(payload: MetadataPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn metadata_type(&self) -> MetadataType {
        self.payload.metadata_type()
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.payload.document_id()
    }

    /// Content key for idempotent publish: identical (document id, type,
    /// payload) collapse to one delivery regardless of timestamp.
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(id) = self.document_id() {
            hasher.update(id.as_bytes());
        }
        hasher.update(self.metadata_type().to_string().as_bytes());
        // serde_json serialization of the payload is stable for a fixed
        // struct layout, which is all the dedup window needs
        let body = serde_json::to_vec(&self.payload).unwrap_or_default();
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}

/// Completion status reported by the external OCR job service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

/// Out-of-band notification that a long-running OCR job finished.
///
/// Carries only the job reference plus the correlation tag the starter set
/// at submission time; the result payload must be fetched separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobNotice {
    pub job_id: String,
    /// Tag set when the job was started; this is the document id
    pub job_tag: DocumentId,
    pub status: JobStatus,
    /// Staged location the job was started on
    pub bucket: String,
    pub object_key: String,
    pub message: Option<String>,
}
