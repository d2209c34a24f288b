//! Configuration for the document pipeline
//!
//! Components are configured purely via store/bucket/index identifiers plus
//! explicit concurrency ceilings and delivery windows; there are no other
//! runtime parameters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bucket identifiers for each stage surface
    #[serde(default)]
    pub buckets: BucketConfig,
    /// Metadata topic identifier (used for logging and diagnostics)
    #[serde(default = "default_metadata_topic")]
    pub metadata_topic: String,
    /// Target search index name
    #[serde(default = "default_search_index")]
    pub search_index: String,
    /// Metadata bus behavior
    #[serde(default)]
    pub bus: BusConfig,
    /// Per-stage concurrency ceilings
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// External-call timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Redelivery behavior for failed handler invocations
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Document classification policy
    #[serde(default)]
    pub classification: ClassificationConfig,
    /// Path for the durable metadata database; in-memory when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buckets: BucketConfig::default(),
            metadata_topic: default_metadata_topic(),
            search_index: default_search_index(),
            bus: BusConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            timeouts: TimeoutConfig::default(),
            delivery: DeliveryConfig::default(),
            classification: ClassificationConfig::default(),
            database_path: None,
        }
    }
}

/// Bucket names for intake, staging areas, and result stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub intake: String,
    pub sync_staging: String,
    pub async_staging: String,
    pub ocr_results: String,
    pub enrichment_results: String,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            intake: "document-intake".to_string(),
            sync_staging: "sync-staging".to_string(),
            async_staging: "async-staging".to_string(),
            ocr_results: "ocr-results".to_string(),
            enrichment_results: "enrichment-results".to_string(),
        }
    }
}

/// Metadata bus tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Window within which identical publishes collapse to one delivery
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Capacity of each filtered subscription queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BusConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Concurrency ceilings per stage
///
/// The sync OCR ceiling of 1 respects a hard per-second limit on the
/// external synchronous OCR API. Result fetching is serial per worker to
/// bound memory against potentially large payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_sync_ocr_concurrency")]
    pub sync_ocr: usize,
    #[serde(default = "default_stage_concurrency")]
    pub async_start: usize,
    #[serde(default = "default_stage_concurrency")]
    pub enrichment: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            sync_ocr: default_sync_ocr_concurrency(),
            async_start: default_stage_concurrency(),
            enrichment: default_stage_concurrency(),
        }
    }
}

/// Bounded timeouts for external-service calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Sync OCR call budget; must stay under the trigger's 30s window
    #[serde(default = "default_sync_ocr_timeout_secs")]
    pub sync_ocr_secs: u64,
    /// Result fetch + store budget for the async path
    #[serde(default = "default_result_fetch_timeout_secs")]
    pub result_fetch_secs: u64,
    /// Enrichment call budget per document
    #[serde(default = "default_enrichment_timeout_secs")]
    pub enrichment_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sync_ocr_secs: default_sync_ocr_timeout_secs(),
            result_fetch_secs: default_result_fetch_timeout_secs(),
            enrichment_secs: default_enrichment_timeout_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn sync_ocr(&self) -> Duration {
        Duration::from_secs(self.sync_ocr_secs)
    }

    pub fn result_fetch(&self) -> Duration {
        Duration::from_secs(self.result_fetch_secs)
    }

    pub fn enrichment(&self) -> Duration {
        Duration::from_secs(self.enrichment_secs)
    }
}

/// At-least-once redelivery policy
///
/// `max_attempts` is the in-process analog of a queue retention window:
/// once exhausted the message is discarded as poison and logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl DeliveryConfig {
    /// Linear backoff before the next delivery attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms * u64::from(attempt))
    }
}

/// Which document classes are eligible for the processing pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Classes that proceed to OCR/NLP processing
    #[serde(default = "default_eligible_classes")]
    pub eligible_classes: Vec<String>,
    /// Metadata attached to newly registered documents
    #[serde(default = "default_document_owner")]
    pub default_owner: String,
    #[serde(default = "default_document_class")]
    pub default_class: String,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            eligible_classes: default_eligible_classes(),
            default_owner: default_document_owner(),
            default_class: default_document_class(),
        }
    }
}

fn default_metadata_topic() -> String {
    "document-metadata".to_string()
}

fn default_search_index() -> String {
    "document".to_string()
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_sync_ocr_concurrency() -> usize {
    1
}

fn default_stage_concurrency() -> usize {
    50
}

fn default_sync_ocr_timeout_secs() -> u64 {
    25
}

fn default_result_fetch_timeout_secs() -> u64 {
    900
}

fn default_enrichment_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_eligible_classes() -> Vec<String> {
    vec![
        "internal_research_report".to_string(),
        "external_public_report".to_string(),
    ]
}

fn default_document_owner() -> String {
    "unassigned".to_string()
}

fn default_document_class() -> String {
    "external_public_report".to_string()
}
