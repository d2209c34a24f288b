//! Core types: documents, pipeline stages, and metadata events

pub mod document;
pub mod event;

pub use document::{staged_key, DocumentId, PipelineStage, RoutePath, StageStatus};
pub use event::{
    JobNotice, JobStatus, LineageEvent, MetadataEvent, MetadataPayload, MetadataType, ObjectEvent,
    ObjectEventKind, OpsEvent, RegistryEvent,
};
