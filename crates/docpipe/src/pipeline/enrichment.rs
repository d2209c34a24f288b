//! Enrichment processor: NLP analysis and search indexing of OCR output
//!
//! Triggers only on `fullresponse.json` writes in the OCR results bucket,
//! so the per-page artifacts written alongside never cause extra runs. The
//! object key encodes the document id and is cross-checked against the
//! object tag before any work happens.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::bus::{deliver_with_retry, LineagePublisher, OpsPublisher};
use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::providers::{Enrichment, EnrichmentProvider, OcrResult, SearchIndex};
use crate::storage::{ObjectStore, DOCUMENT_ID_TAG};
use crate::types::{DocumentId, LineageEvent, ObjectEvent, ObjectEventKind, PipelineStage};

const CALLER: &str = "enrichment";
const LANGUAGE: &str = "en";

/// Suffix the processor's bucket subscription filters on
pub const FULL_RESPONSE_SUFFIX: &str = "fullresponse.json";

/// One page as it lands in the search index
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexedPage {
    pub document_id: DocumentId,
    pub document: String,
    pub page: usize,
    pub key_phrases: Vec<String>,
    pub entities: HashMap<String, String>,
    pub text: String,
}

pub struct EnrichmentProcessor {
    inner: Arc<Inner>,
    semaphore: Arc<Semaphore>,
    delivery: DeliveryConfig,
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    enrichment: Arc<dyn EnrichmentProvider>,
    search: Arc<dyn SearchIndex>,
    ops: OpsPublisher,
    lineage: LineagePublisher,
    output_bucket: String,
    index: String,
    call_budget: std::time::Duration,
}

impl EnrichmentProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        enrichment: Arc<dyn EnrichmentProvider>,
        search: Arc<dyn SearchIndex>,
        ops: OpsPublisher,
        lineage: LineagePublisher,
        output_bucket: String,
        index: String,
        concurrency: usize,
        call_budget: std::time::Duration,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                enrichment,
                search,
                ops,
                lineage,
                output_bucket,
                index,
                call_budget,
            }),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            delivery,
        }
    }

    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<ObjectEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.kind.is_removal() {
                    continue;
                }
                let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                    break;
                };
                let inner = Arc::clone(&self.inner);
                let delivery = self.delivery.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    deliver_with_retry(&delivery, "enrichment", || inner.handle(&event)).await;
                });
            }
        })
    }
}

impl Inner {
    async fn handle(&self, event: &ObjectEvent) -> Result<()> {
        let (document_id, document) = dissect_result_key(&event.key)?;
        self.verify_tag(event, document_id).await?;

        let scope = self
            .ops
            .scope(document_id, &event.bucket, &event.key, PipelineStage::Enriched);
        scope.in_progress()?;

        match self.enrich(event, document_id, document).await {
            Ok(()) => scope.succeeded(),
            Err(e) => {
                scope.failed(&e.to_string())?;
                Err(e)
            }
        }
    }

    async fn enrich(&self, event: &ObjectEvent, document_id: DocumentId, document: &str) -> Result<()> {
        let data = self.store.get(&event.bucket, &event.key).await?;
        let result: OcrResult = serde_json::from_slice(&data)?;

        let mut pages = Vec::with_capacity(result.pages.len());
        for page in &result.pages {
            let enrichment = self.enrich_text(&page.text).await?;
            pages.push(IndexedPage {
                document_id,
                document: document.to_string(),
                page: page.page_number,
                key_phrases: enrichment.key_phrases,
                entities: enrichment.entities,
                text: page.text.clone(),
            });
        }

        let index_docs: Vec<serde_json::Value> = pages
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;
        self.search.index_bulk(&self.index, &index_docs).await?;
        tracing::info!(
            document_id = %document_id,
            pages = pages.len(),
            index = %self.index,
            "indexed enriched pages"
        );

        let output_key = format!("{}/{}/enrichment-output.json", document_id, document);
        self.store
            .put(
                &self.output_bucket,
                &output_key,
                Bytes::from(serde_json::to_vec(&pages)?),
                HashMap::from([(DOCUMENT_ID_TAG.to_string(), document_id.to_string())]),
                CALLER,
            )
            .await?;
        self.lineage.record_lineage(LineageEvent {
            document_id: Some(document_id),
            caller: CALLER.to_string(),
            target_bucket: self.output_bucket.clone(),
            target_key: output_key,
            kind: ObjectEventKind::Created,
            source_bucket: Some(event.bucket.clone()),
            source_key: Some(event.key.clone()),
            version: None,
        })
    }

    /// Chunk over-limit text and merge the per-chunk results
    async fn enrich_text(&self, text: &str) -> Result<Enrichment> {
        let chunks = chunk_text(text, self.enrichment.character_limit());
        let call = async {
            match chunks.len() {
                0 => Ok(Enrichment::default()),
                1 => self.enrichment.detect(&chunks[0], LANGUAGE).await,
                _ => {
                    let results = self.enrichment.detect_batch(&chunks, LANGUAGE).await?;
                    let mut merged = Enrichment::default();
                    for result in results {
                        merged.merge(result);
                    }
                    Ok(merged)
                }
            }
        };
        timeout(self.call_budget, call)
            .await
            .map_err(|_| Error::Timeout {
                service: self.enrichment.name().to_string(),
                secs: self.call_budget.as_secs(),
            })
            .and_then(|r| r)
    }

    async fn verify_tag(&self, event: &ObjectEvent, document_id: DocumentId) -> Result<()> {
        let tags = self.store.get_tags(&event.bucket, &event.key).await?;
        match tags.get(DOCUMENT_ID_TAG) {
            Some(tag) if *tag == document_id.to_string() => Ok(()),
            Some(tag) => Err(Error::Malformed(format!(
                "object tag {} disagrees with key-encoded document id {}",
                tag, document_id
            ))),
            None => Err(Error::UntaggedObject {
                bucket: event.bucket.clone(),
                key: event.key.clone(),
            }),
        }
    }
}

/// Split an OCR artifact key into its document id and document name.
/// Keys look like `{id}/{document}/ocr-analysis/fullresponse.json`.
fn dissect_result_key(key: &str) -> Result<(DocumentId, &str)> {
    let malformed = || Error::Malformed(format!("unexpected OCR artifact key {:?}", key));
    let (prefix, _) = key.split_once("/ocr-analysis/").ok_or_else(malformed)?;
    let (raw_id, document) = prefix.split_once('/').ok_or_else(malformed)?;
    let document_id = Uuid::parse_str(raw_id).map_err(|_| malformed())?;
    Ok((document_id, document))
}

/// Split text into chunks of at most `limit` characters, breaking on
/// whitespace where possible. A single token longer than the limit is
/// hard-split on character boundaries.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();

        if word_len > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut piece = String::new();
            let mut count = 0usize;
            for ch in word.chars() {
                piece.push(ch);
                count += 1;
                if count == limit {
                    chunks.push(std::mem::take(&mut piece));
                    count = 0;
                }
            }
            current = piece;
            current_len = count;
            continue;
        }

        let extra = if current.is_empty() { word_len } else { word_len + 1 };
        if current_len + extra > limit {
            chunks.push(std::mem::take(&mut current));
            current.push_str(word);
            current_len = word_len;
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_len += extra;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
