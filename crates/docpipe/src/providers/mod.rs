//! Provider abstractions for the external services the pipeline leans on
//!
//! Each external dependency sits behind a small async trait so the pipeline
//! stages never name a concrete backend. The in-process implementations in
//! this module are deterministic and self-contained; production deployments
//! swap in real OCR, NLP, and search backends behind the same traits.

pub mod enrichment;
pub mod ocr;
pub mod search_index;

pub use enrichment::{Enrichment, EnrichmentProvider, LocalEnrichment};
pub use ocr::{LocalOcrEngine, OcrPage, OcrProvider, OcrResult};
pub use search_index::{MemorySearchIndex, SearchIndex};
