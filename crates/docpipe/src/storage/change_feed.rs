//! Change-notification feed for the durable record stores
//!
//! An append-only log of post-change ("new image") records with bounded
//! retention. A subscriber attached for the first time starts from the
//! oldest retained record (trim-horizon) and then receives live records in
//! append order. The durable stores hold the full history; the feed only
//! needs to retain enough for subscribers attached during startup.
//! Delivery is at-least-once; handlers must be idempotent.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Records replayed to a late subscriber before live delivery begins
pub const DEFAULT_RETENTION: usize = 1024;

struct FeedInner<T> {
    retained: VecDeque<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

/// In-process change feed over records of type `T`
pub struct ChangeFeed<T: Clone + Send + 'static> {
    retention: usize,
    inner: Mutex<FeedInner<T>>,
}

impl<T: Clone + Send + 'static> ChangeFeed<T> {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// A feed that retains at most `retention` records for replay; the
    /// trim horizon advances as older records fall off.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention,
            inner: Mutex::new(FeedInner {
                retained: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append a new-image record and fan it out to all live subscribers
    pub fn publish(&self, record: T) {
        let mut inner = self.inner.lock();
        // Dropped receivers are pruned on the way through
        inner.subscribers.retain(|tx| tx.send(record.clone()).is_ok());
        inner.retained.push_back(record);
        while inner.retained.len() > self.retention {
            inner.retained.pop_front();
        }
    }

    /// Attach a subscriber at trim-horizon: replays every retained record,
    /// then delivers live records in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for record in &inner.retained {
            // A receiver cannot be closed before we return it
            let _ = tx.send(record.clone());
        }
        inner.subscribers.push(tx);
        rx
    }
}

impl<T: Clone + Send + 'static> Default for ChangeFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_subscriber_starts_from_trim_horizon() {
        let feed = ChangeFeed::new();
        feed.publish(1u32);
        feed.publish(2);

        let mut rx = feed.subscribe();
        feed.publish(3);

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn each_subscriber_is_an_independent_stream() {
        let feed = ChangeFeed::new();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        feed.publish("rec");

        assert_eq!(a.try_recv().unwrap(), "rec");
        assert_eq!(b.try_recv().unwrap(), "rec");
    }

    #[test]
    fn retention_bounds_the_replay_and_advances_the_trim_horizon() {
        let feed = ChangeFeed::with_retention(2);
        feed.publish(1u32);
        feed.publish(2);
        feed.publish(3);

        let mut late = feed.subscribe();
        assert_eq!(late.try_recv().unwrap(), 2);
        assert_eq!(late.try_recv().unwrap(), 3);
        assert!(late.try_recv().is_err());
    }
}
