//! OCR provider trait plus a deterministic in-process engine

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::ObjectStore;
use crate::types::{DocumentId, JobNotice, JobStatus};

/// Text recognized on a single page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OcrPage {
    pub page_number: usize,
    pub text: String,
}

/// Full recognition output for one document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OcrResult {
    pub pages: Vec<OcrPage>,
}

impl OcrResult {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Text recognition over objects in the store.
///
/// `detect_text` is the synchronous path for small documents and returns the
/// result inline. `start_analysis` is the asynchronous path: it submits a job
/// and later reports completion on the caller's notice channel, after which
/// `fetch_job_result` retrieves the output. The `client_token` makes a retried
/// submission return the already-running job instead of starting a second one.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn detect_text(&self, bucket: &str, key: &str) -> Result<OcrResult>;

    async fn start_analysis(
        &self,
        bucket: &str,
        key: &str,
        client_token: &str,
        job_tag: DocumentId,
        notify: mpsc::Sender<JobNotice>,
    ) -> Result<String>;

    async fn fetch_job_result(&self, job_id: &str) -> Result<OcrResult>;

    fn name(&self) -> &str;
}

struct OcrJob {
    bucket: String,
    key: String,
}

/// In-process engine that treats object bytes as UTF-8 text with form-feed
/// page breaks. Async jobs complete immediately on a spawned task.
pub struct LocalOcrEngine {
    store: Arc<dyn ObjectStore>,
    jobs: DashMap<String, OcrJob>,
    tokens: DashMap<String, String>,
}

impl LocalOcrEngine {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            jobs: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    async fn recognize(&self, bucket: &str, key: &str) -> Result<OcrResult> {
        let data = self.store.get(bucket, key).await?;
        let text = String::from_utf8_lossy(&data);
        let pages = text
            .split('\u{c}')
            .enumerate()
            .map(|(i, page)| OcrPage {
                page_number: i + 1,
                text: page.trim().to_string(),
            })
            .collect();
        Ok(OcrResult { pages })
    }
}

#[async_trait]
impl OcrProvider for LocalOcrEngine {
    async fn detect_text(&self, bucket: &str, key: &str) -> Result<OcrResult> {
        self.recognize(bucket, key).await
    }

    async fn start_analysis(
        &self,
        bucket: &str,
        key: &str,
        client_token: &str,
        job_tag: DocumentId,
        notify: mpsc::Sender<JobNotice>,
    ) -> Result<String> {
        if let Some(existing) = self.tokens.get(client_token) {
            return Ok(existing.value().clone());
        }

        let job_id = Uuid::new_v4().to_string();
        self.jobs.insert(
            job_id.clone(),
            OcrJob {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
        );
        self.tokens.insert(client_token.to_string(), job_id.clone());

        let notice = JobNotice {
            job_id: job_id.clone(),
            job_tag,
            status: JobStatus::Succeeded,
            bucket: bucket.to_string(),
            object_key: key.to_string(),
            message: None,
        };
        tokio::spawn(async move {
            let _ = notify.send(notice).await;
        });

        Ok(job_id)
    }

    async fn fetch_job_result(&self, job_id: &str) -> Result<OcrResult> {
        let (bucket, key) = match self.jobs.get(job_id) {
            Some(job) => (job.bucket.clone(), job.key.clone()),
            None => {
                return Err(Error::ExternalService {
                    service: self.name().to_string(),
                    message: format!("unknown job {}", job_id),
                })
            }
        };
        self.recognize(&bucket, &key).await
    }

    fn name(&self) -> &str {
        "local-ocr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use bytes::Bytes;
    use std::collections::HashMap;

    async fn engine_with(key: &str, body: &str) -> LocalOcrEngine {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("docs", key, Bytes::from(body.to_string()), HashMap::new(), "test")
            .await
            .unwrap();
        LocalOcrEngine::new(store)
    }

    #[tokio::test]
    async fn detect_text_splits_pages_on_form_feed() {
        let engine = engine_with("a.png", "first page\u{c}second page").await;
        let result = engine.detect_text("docs", "a.png").await.unwrap();
        assert_eq!(result.page_count(), 2);
        assert_eq!(result.pages[1].text, "second page");
    }

    #[tokio::test]
    async fn retried_start_returns_the_same_job() {
        let engine = engine_with("a.pdf", "body").await;
        let (tx, mut rx) = mpsc::channel(4);
        let tag = Uuid::new_v4();

        let first = engine
            .start_analysis("docs", "a.pdf", "token-1", tag, tx.clone())
            .await
            .unwrap();
        let second = engine
            .start_analysis("docs", "a.pdf", "token-1", tag, tx)
            .await
            .unwrap();
        assert_eq!(first, second);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.job_id, first);
        assert_eq!(notice.job_tag, tag);
        assert_eq!(notice.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn fetch_result_for_unknown_job_fails() {
        let engine = engine_with("a.pdf", "body").await;
        assert!(engine.fetch_job_result("no-such-job").await.is_err());
    }
}
