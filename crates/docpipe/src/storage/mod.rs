//! Durable stores, change feeds, and the content-addressed object store

pub mod change_feed;
pub mod database;
pub mod object_store;

pub use change_feed::ChangeFeed;
pub use database::{
    document_signature, LineageRecord, OpsRecord, PipelineDb, RegistryRecord, TimelineEntry,
};
pub use object_store::{MemoryObjectStore, ObjectStore, DOCUMENT_ID_TAG};
