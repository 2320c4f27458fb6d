//! Data-source abstraction.
//!
//! The lifecycle core never looks inside a data source. It only asks whether
//! the initial load has completed ([`DataSource::has_synced`]) and follows
//! its change feed to enqueue keys for control-loop workers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

/// Capacity of the in-memory change feed before slow subscribers lag.
pub const CHANGE_FEED_CAPACITY: usize = 1024;

/// A locally cached view of some external state.
pub trait DataSource: Send + Sync {
    /// Source name, used for logs.
    fn name(&self) -> &str;

    /// Whether the initial load has completed.
    fn has_synced(&self) -> bool;

    /// Keys currently present in the local view.
    fn keys(&self) -> Vec<String>;

    /// Subscribes to keys as they change.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// A keyed in-memory [`DataSource`].
///
/// Writes are broadcast on the change feed whether or not the source has
/// synced; `mark_synced` flips the synced bit exactly once.
#[derive(Debug)]
pub struct InMemorySource {
    name: String,
    synced: AtomicBool,
    items: RwLock<BTreeMap<String, String>>,
    feed: broadcast::Sender<String>,
}

impl InMemorySource {
    /// Creates an empty, unsynced source.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (feed, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            name: name.into(),
            synced: AtomicBool::new(false),
            items: RwLock::new(BTreeMap::new()),
            feed,
        }
    }

    /// Inserts or replaces `key` and notifies subscribers.
    pub fn upsert(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.into());
        // No subscribers is fine: nothing is consuming this source yet.
        let _ = self.feed.send(key);
    }

    /// Removes `key` and notifies subscribers if it was present.
    pub fn delete(&self, key: &str) -> Option<String> {
        let removed = self
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            let _ = self.feed.send(key.to_string());
        }
        removed
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Number of items in the local view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the local view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the initial load complete.
    pub fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::SeqCst) {
            tracing::debug!(source = %self.name, "data source synced");
        }
    }
}

impl DataSource for InMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn keys(&self) -> Vec<String> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_source_feed() {
        let source = InMemorySource::new("namespaces");
        let mut rx = source.subscribe();

        source.upsert("default", "{}");
        source.upsert("kube-system", "{}");
        assert_eq!(source.delete("default"), Some("{}".to_string()));
        assert_eq!(source.delete("missing"), None);

        assert_eq!(rx.recv().await.unwrap(), "default");
        assert_eq!(rx.recv().await.unwrap(), "kube-system");
        assert_eq!(rx.recv().await.unwrap(), "default");
        assert!(rx.try_recv().is_err());

        assert_eq!(source.keys(), vec!["kube-system".to_string()]);
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn test_mark_synced_is_sticky() {
        let source = InMemorySource::new("workspaces");
        assert!(!source.has_synced());
        source.mark_synced();
        source.mark_synced();
        assert!(source.has_synced());
    }
}
