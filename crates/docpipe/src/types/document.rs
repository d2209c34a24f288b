//! Document identity, pipeline stages, and format routing

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for one logical document across all stages.
///
/// Assigned exactly once at registration; every staged copy and derived
/// artifact carries it as an object tag.
pub type DocumentId = Uuid;

/// Where a document sits in the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Registered,
    Classified,
    Routed,
    SyncProcessing,
    AsyncAwaitingJob,
    AsyncProcessing,
    Enriched,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStage::Registered => "REGISTERED",
            PipelineStage::Classified => "CLASSIFIED",
            PipelineStage::Routed => "ROUTED",
            PipelineStage::SyncProcessing => "SYNC_PROCESSING",
            PipelineStage::AsyncAwaitingJob => "ASYNC_AWAITING_JOB",
            PipelineStage::AsyncProcessing => "ASYNC_PROCESSING",
            PipelineStage::Enriched => "ENRICHED",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a stage attempt, recorded in the pipeline-operations timeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::InProgress => "IN_PROGRESS",
            StageStatus::Succeeded => "SUCCEEDED",
            StageStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for PipelineStage {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTERED" => Ok(PipelineStage::Registered),
            "CLASSIFIED" => Ok(PipelineStage::Classified),
            "ROUTED" => Ok(PipelineStage::Routed),
            "SYNC_PROCESSING" => Ok(PipelineStage::SyncProcessing),
            "ASYNC_AWAITING_JOB" => Ok(PipelineStage::AsyncAwaitingJob),
            "ASYNC_PROCESSING" => Ok(PipelineStage::AsyncProcessing),
            "ENRICHED" => Ok(PipelineStage::Enriched),
            other => Err(crate::error::Error::Malformed(format!(
                "unknown pipeline stage {:?}",
                other
            ))),
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(StageStatus::InProgress),
            "SUCCEEDED" => Ok(StageStatus::Succeeded),
            "FAILED" => Ok(StageStatus::Failed),
            other => Err(crate::error::Error::Malformed(format!(
                "unknown stage status {:?}",
                other
            ))),
        }
    }
}

/// Processing path chosen by the router
///
/// Low-latency single-call OCR handles flat image formats; everything else
/// goes through the long-running job API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoutePath {
    Sync,
    Async,
}

impl RoutePath {
    /// Routing decision as a pure function of the file extension
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" | "png" => Some(RoutePath::Sync),
            "pdf" => Some(RoutePath::Async),
            _ => None,
        }
    }

    /// Extract the extension from an object key and route on it
    pub fn for_key(key: &str) -> Option<Self> {
        let ext = key.rsplit('.').next().unwrap_or("");
        if ext == key {
            return None;
        }
        Self::for_extension(ext)
    }
}

impl std::fmt::Display for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutePath::Sync => write!(f, "sync"),
            RoutePath::Async => write!(f, "async"),
        }
    }
}

impl std::str::FromStr for RoutePath {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(RoutePath::Sync),
            "async" => Ok(RoutePath::Async),
            other => Err(crate::error::Error::Malformed(format!(
                "unknown route path {:?}",
                other
            ))),
        }
    }
}

/// Deterministic staging key for a routed document.
///
/// Derived from the document id rather than a fresh random key so a retried
/// copy overwrites instead of duplicating downstream triggers.
pub fn staged_key(document_id: &DocumentId, object_key: &str) -> String {
    format!("{}/{}", document_id, object_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_image_formats_to_sync_path() {
        assert_eq!(RoutePath::for_extension("jpg"), Some(RoutePath::Sync));
        assert_eq!(RoutePath::for_extension("JPEG"), Some(RoutePath::Sync));
        assert_eq!(RoutePath::for_extension("png"), Some(RoutePath::Sync));
    }

    #[test]
    fn routes_multi_page_formats_to_async_path() {
        assert_eq!(RoutePath::for_extension("pdf"), Some(RoutePath::Async));
        assert_eq!(RoutePath::for_extension("PDF"), Some(RoutePath::Async));
    }

    #[test]
    fn rejects_unsupported_extensions() {
        assert_eq!(RoutePath::for_extension("docx"), None);
        assert_eq!(RoutePath::for_extension(""), None);
        assert_eq!(RoutePath::for_key("no-extension"), None);
        assert_eq!(RoutePath::for_key("archive.tar.gz"), None);
    }

    #[test]
    fn routing_is_derived_from_the_last_dot_segment() {
        assert_eq!(RoutePath::for_key("scans/report.v2.png"), Some(RoutePath::Sync));
        assert_eq!(RoutePath::for_key("a/b/c.pdf"), Some(RoutePath::Async));
    }

    #[test]
    fn staged_key_is_deterministic() {
        let id = Uuid::nil();
        assert_eq!(staged_key(&id, "doc-1.png"), format!("{}/doc-1.png", id));
        assert_eq!(staged_key(&id, "doc-1.png"), staged_key(&id, "doc-1.png"));
    }
}
