//! Metadata event bus: typed publish with content dedup and filtered fan-out
//!
//! A single ordered publish point feeds independent per-subscriber FIFO
//! queues. Each subscription declares a static predicate over
//! [`MetadataType`] at registration; an event is copied only into queues
//! whose predicate matches. Publish is idempotent within the dedup window.

pub mod publishers;

pub use publishers::{LineagePublisher, OpsPublisher, OpsScope, RegistryPublisher};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::types::{MetadataEvent, MetadataType};

/// Static subscription predicate over the metadata type set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataFilter {
    registry: bool,
    lineage: bool,
    operations: bool,
}

impl MetadataFilter {
    /// Match exactly one metadata type
    pub fn only(metadata_type: MetadataType) -> Self {
        let mut filter = Self {
            registry: false,
            lineage: false,
            operations: false,
        };
        match metadata_type {
            MetadataType::DocumentRegistry => filter.registry = true,
            MetadataType::DocumentLineage => filter.lineage = true,
            MetadataType::PipelineOperations => filter.operations = true,
        }
        filter
    }

    pub fn matches(&self, metadata_type: MetadataType) -> bool {
        match metadata_type {
            MetadataType::DocumentRegistry => self.registry,
            MetadataType::DocumentLineage => self.lineage,
            MetadataType::PipelineOperations => self.operations,
        }
    }
}

struct SubscriptionEntry {
    filter: MetadataFilter,
    sender: mpsc::Sender<MetadataEvent>,
}

struct BusInner {
    subscriptions: Vec<SubscriptionEntry>,
    /// Dedup key -> first-seen instant, pruned by window age
    seen: HashMap<String, Instant>,
}

/// The metadata topic
pub struct MetadataBus {
    inner: Mutex<BusInner>,
    dedup_window: Duration,
    queue_capacity: usize,
    topic: String,
}

impl MetadataBus {
    pub fn new(topic: impl Into<String>, config: &BusConfig) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscriptions: Vec::new(),
                seen: HashMap::new(),
            }),
            dedup_window: config.dedup_window(),
            queue_capacity: config.queue_capacity,
            topic: topic.into(),
        }
    }

    /// Register a filtered subscription.
    ///
    /// Events matching the filter are delivered in publish order; the
    /// returned receiver is an independent delivery stream.
    pub fn subscribe(&self, filter: MetadataFilter) -> mpsc::Receiver<MetadataEvent> {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.inner
            .lock()
            .subscriptions
            .push(SubscriptionEntry { filter, sender });
        receiver
    }

    /// Publish one event to every matching subscription.
    ///
    /// A re-publish with identical content inside the dedup window is acked
    /// without fan-out. Failure is synchronous; the caller retries. There is
    /// no partial-delivery guarantee across subscribers: each filtered
    /// queue is independent.
    pub fn publish(&self, event: MetadataEvent) -> Result<()> {
        let metadata_type = event.metadata_type();
        let key = event.dedup_key();

        let mut inner = self.inner.lock();
        let now = Instant::now();
        let window = self.dedup_window;
        inner.seen.retain(|_, seen_at| now.duration_since(*seen_at) < window);

        if inner.seen.contains_key(&key) {
            tracing::debug!(
                topic = %self.topic,
                %metadata_type,
                "duplicate publish absorbed by dedup window"
            );
            return Ok(());
        }

        let mut backpressured = 0usize;
        for entry in &inner.subscriptions {
            if !entry.filter.matches(metadata_type) {
                continue;
            }
            if entry.sender.try_send(event.clone()).is_err() {
                backpressured += 1;
            }
        }
        if backpressured > 0 {
            // Do not record the key: the caller must retry the publish
            return Err(Error::Publish(format!(
                "{} subscription queue(s) full on topic {}",
                backpressured, self.topic
            )));
        }

        inner.seen.insert(key, now);
        Ok(())
    }
}

/// Drive a message handler under at-least-once semantics.
///
/// A transient failure is retried up to `max_attempts` with linear backoff.
/// A permanent failure, or exhaustion of the attempt budget, drops the
/// message with a warning so one poison message cannot wedge its queue.
pub async fn deliver_with_retry<F, Fut>(
    delivery: &crate::config::DeliveryConfig,
    context: &'static str,
    mut handler: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    for attempt in 1..=delivery.max_attempts {
        match handler().await {
            Ok(()) => return,
            Err(e) if attempt < delivery.max_attempts && e.is_transient() => {
                tracing::warn!(context, attempt, error = %e, "handler failed, redelivering");
                tokio::time::sleep(delivery.backoff(attempt)).await;
            }
            Err(e) => {
                tracing::warn!(
                    context,
                    attempt,
                    error = %e,
                    "message dropped after unrecoverable failure"
                );
                return;
            }
        }
    }
}
