//! Text enrichment provider trait plus a deterministic local analyzer

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

/// Key phrases and named entities extracted from one piece of text
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enrichment {
    pub key_phrases: Vec<String>,
    pub entities: HashMap<String, String>,
}

impl Enrichment {
    pub fn merge(&mut self, other: Enrichment) {
        for phrase in other.key_phrases {
            if !self.key_phrases.contains(&phrase) {
                self.key_phrases.push(phrase);
            }
        }
        self.entities.extend(other.entities);
    }
}

/// NLP analysis over recognized text.
///
/// Callers must keep each input under `character_limit` characters; longer
/// text is chunked upstream and the per-chunk results merged.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn detect(&self, text: &str, language: &str) -> Result<Enrichment>;

    async fn detect_batch(&self, texts: &[String], language: &str) -> Result<Vec<Enrichment>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.detect(text, language).await?);
        }
        Ok(results)
    }

    fn character_limit(&self) -> usize {
        4096
    }

    fn name(&self) -> &str;
}

/// Rule-based analyzer: long lowercase words become key phrases, uppercase
/// acronyms become entities. Deterministic, so pipeline output is testable.
pub struct LocalEnrichment;

#[async_trait]
impl EnrichmentProvider for LocalEnrichment {
    async fn detect(&self, text: &str, _language: &str) -> Result<Enrichment> {
        let mut enrichment = Enrichment::default();
        for raw in text.split_whitespace() {
            let word: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
            if word.len() >= 2 && word.chars().all(|c| c.is_ascii_uppercase()) {
                enrichment
                    .entities
                    .insert(word.clone(), "ORGANIZATION".to_string());
            } else if word.len() >= 8 {
                let phrase = word.to_lowercase();
                if !enrichment.key_phrases.contains(&phrase) {
                    enrichment.key_phrases.push(phrase);
                }
            }
        }
        Ok(enrichment)
    }

    fn name(&self) -> &str {
        "local-enrichment"
    }
}
