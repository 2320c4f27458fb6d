//! Shared work queue for control-loop workers.
//!
//! Keys are deduplicated while they wait, and a key that is being processed
//! is never handed to a second worker. Re-adding a key while it is in
//! flight marks it dirty; it is queued again once the worker calls
//! [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backoff::BackoffConfig;
use crate::config::QueueConfig;

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    backoff: BackoffConfig,
    max_retries: u32,
    state: Mutex<State>,
    notify: Notify,
    timers: TaskTracker,
    shutdown: CancellationToken,
}

/// A deduplicating FIFO of keys with in-flight tracking and rate-limited
/// requeue.
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Creates an empty queue named after the owning unit.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                backoff: config.backoff.clone(),
                max_retries: config.max_retries,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                timers: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adds `key` unless it is already waiting. Ignored after shutdown.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as no longer in flight, requeueing it if it was re-added
    /// meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Number of consecutive failures recorded for `key`.
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Schedules `key` to be re-added after its backoff delay.
    ///
    /// Returns the delay, or `None` when the key has exhausted its retries
    /// and was dropped until its next change. Must be called from within a
    /// tokio runtime. Pending timers end at [`WorkQueue::shut_down`].
    pub fn requeue_rate_limited(&self, key: &str) -> Option<Duration> {
        let attempt = {
            let mut state = self.state();
            if state.shutting_down {
                return None;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures = failures.saturating_add(1);
            let attempt = *failures;
            if attempt > self.inner.max_retries {
                state.failures.remove(key);
                drop(state);
                tracing::warn!(
                    queue = %self.inner.name,
                    key,
                    retries = self.inner.max_retries,
                    "dropping key after exhausting retries"
                );
                return None;
            }
            attempt
        };

        let delay = self.inner.backoff.delay_for_attempt(attempt);
        let queue = self.clone();
        let key = key.to_string();
        let shutdown = self.inner.shutdown.clone();
        self.inner.timers.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(key),
                () = shutdown.cancelled() => {},
            }
        });
        Some(delay)
    }

    /// Stops accepting keys and wakes every waiting worker.
    ///
    /// Keys already queued are still handed out; `next` returns `None`
    /// once they are gone.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.timers.close();
        self.inner.notify.notify_waiters();
    }

    /// Requeue timers still running.
    #[must_use]
    pub fn pending_requeues(&self) -> usize {
        self.inner.timers.len()
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no keys are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
