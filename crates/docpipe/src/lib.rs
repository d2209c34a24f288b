//! docpipe: document pipeline orchestration over a metadata event bus
//!
//! An intake object flows through registration, classification, extension
//! routing, sync or async OCR, and enrichment, with every stage announcing
//! its progress on a typed metadata bus. Three writers persist that traffic
//! into durable registry, pipeline-operations, and lineage stores; change
//! feeds over those stores sequence the handoff from one stage to the next.
//! Every handler is idempotent under at-least-once delivery.

pub mod bus;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod providers;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineProviders};
pub use types::{
    document::{staged_key, DocumentId, PipelineStage, RoutePath, StageStatus},
    event::{JobNotice, JobStatus, MetadataEvent, MetadataType, ObjectEvent, ObjectEventKind},
};
