//! Search index provider trait plus an in-memory implementation

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Bulk document indexing into a named index
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_bulk(&self, index: &str, documents: &[serde_json::Value]) -> Result<()>;

    fn name(&self) -> &str;
}

/// Keeps indexed documents in memory, in arrival order per index
#[derive(Default)]
pub struct MemorySearchIndex {
    indices: DashMap<String, Vec<serde_json::Value>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self, index: &str) -> Vec<serde_json::Value> {
        self.indices
            .get(index)
            .map(|docs| docs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn index_bulk(&self, index: &str, documents: &[serde_json::Value]) -> Result<()> {
        self.indices
            .entry(index.to_string())
            .or_default()
            .extend_from_slice(documents);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory-index"
    }
}
