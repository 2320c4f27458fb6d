//! Control-loop launcher.
//!
//! A control loop is a pool of workers sharing one [`WorkQueue`] that is fed
//! by the change feeds of the loop's data sources. The launcher starts the
//! pool under a child of the caller's cancellation token and hands the
//! resulting [`ControlLoopHandle`] to a [`LoopSupervisor`], which tracks it
//! for shutdown only. Loops are fire-and-forget once launched.

pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

pub use self::queue::WorkQueue;
use crate::client::ClientConfig;
use crate::config::{ControllersConfig, KilnConfig, QueueConfig};
use crate::readiness::GateError;
use crate::source::DataSource;

/// Errors from launching a control loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// A loop was requested with no workers.
    #[error("control loop {unit} requires at least one worker")]
    ZeroWorkers {
        /// Unit name.
        unit: String,
    },

    /// A loop for this unit is already running.
    #[error("control loop {unit} is already running")]
    DuplicateLoop {
        /// Unit name.
        unit: String,
    },

    /// The supervisor has been shut down.
    #[error("refusing to launch control loop {unit}: supervisor is shutting down")]
    SupervisorClosed {
        /// Unit name.
        unit: String,
    },
}

/// Errors returned by a [`Reconciler`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Transient failure; the key is requeued with backoff.
    #[error("retryable reconcile failure: {0}")]
    Retry(String),

    /// The key cannot be processed; it is dropped until its next change.
    #[error("permanent reconcile failure: {0}")]
    Permanent(String),
}

/// Per-key reconciliation logic run by control-loop workers.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconciles the object identified by `key`.
    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError>;
}

/// Everything needed to start one control loop.
pub struct LoopSpec {
    /// Unit name, used for logs and supervisor bookkeeping.
    pub unit: String,
    /// Number of workers sharing the queue.
    pub workers: usize,
    /// Sources whose change feeds fill the queue.
    pub sources: Vec<Arc<dyn DataSource>>,
    /// Worker logic.
    pub reconciler: Arc<dyn Reconciler>,
}

impl std::fmt::Debug for LoopSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopSpec")
            .field("unit", &self.unit)
            .field("workers", &self.workers)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// A running control loop.
#[derive(Debug, Clone)]
pub struct ControlLoopHandle {
    unit: Arc<str>,
    workers: usize,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    queue: WorkQueue,
}

impl ControlLoopHandle {
    /// Unit name.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Worker count the loop was started with.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// When the loop was launched.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The loop's cancellation scope.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The loop's shared queue.
    #[must_use]
    pub const fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Cancels the loop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether every task of the loop has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }

    /// Waits until every task of the loop has exited.
    pub async fn stopped(&self) {
        self.tracker.wait().await;
    }
}

#[derive(Debug, Default)]
struct SupervisorState {
    handles: Vec<ControlLoopHandle>,
    closed: bool,
}

/// Tracks launched loops so shutdown can cancel and await them.
///
/// The supervisor never inspects loop results.
#[derive(Debug, Clone, Default)]
pub struct LoopSupervisor {
    state: Arc<Mutex<SupervisorState>>,
}

impl LoopSupervisor {
    /// Creates an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, handle: ControlLoopHandle) -> Result<(), LaunchError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(LaunchError::SupervisorClosed {
                unit: handle.unit.to_string(),
            });
        }
        if state
            .handles
            .iter()
            .any(|h| h.unit == handle.unit && !h.is_stopped())
        {
            return Err(LaunchError::DuplicateLoop {
                unit: handle.unit.to_string(),
            });
        }
        state.handles.retain(|h| h.unit != handle.unit);
        state.handles.push(handle);
        Ok(())
    }

    /// Snapshot of every tracked loop.
    #[must_use]
    pub fn handles(&self) -> Vec<ControlLoopHandle> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .clone()
    }

    /// The tracked loop for `unit`, if it was launched.
    #[must_use]
    pub fn handle(&self, unit: &str) -> Option<ControlLoopHandle> {
        self.handles().into_iter().find(|h| h.unit() == unit)
    }

    /// Worker counts of loops that have not stopped, keyed by unit.
    #[must_use]
    pub fn active_workers(&self) -> HashMap<String, usize> {
        self.handles()
            .into_iter()
            .filter(|h| !h.is_stopped())
            .map(|h| (h.unit.to_string(), h.workers))
            .collect()
    }

    /// Cancels every tracked loop and refuses further launches.
    pub fn cancel_all(&self) {
        let handles = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.handles.clone()
        };
        for handle in &handles {
            handle.cancel();
        }
        info!(loops = handles.len(), "canceled control loops");
    }

    /// Waits up to `grace` for every tracked loop to stop.
    ///
    /// Returns `false` if some loop was still running when `grace` elapsed.
    pub async fn wait_stopped(&self, grace: Duration) -> bool {
        let handles = self.handles();
        let all = futures::future::join_all(handles.iter().map(ControlLoopHandle::stopped));
        if tokio::time::timeout(grace, all).await.is_ok() {
            true
        } else {
            let running: Vec<&str> = handles
                .iter()
                .filter(|h| !h.is_stopped())
                .map(ControlLoopHandle::unit)
                .collect();
            warn!(?running, grace = ?grace, "control loops did not stop within grace period");
            false
        }
    }
}

/// Starts control loops for activation units.
#[derive(Debug, Clone)]
pub struct ControlLoopLauncher {
    client: ClientConfig,
    controllers: ControllersConfig,
    queue: QueueConfig,
    supervisor: LoopSupervisor,
}

impl ControlLoopLauncher {
    /// Creates a launcher with its own supervisor.
    #[must_use]
    pub fn new(client: ClientConfig, config: &KilnConfig) -> Self {
        Self {
            client,
            controllers: config.controllers.clone(),
            queue: config.queue.clone(),
            supervisor: LoopSupervisor::new(),
        }
    }

    /// The supervisor holding every launched loop.
    #[must_use]
    pub const fn supervisor(&self) -> &LoopSupervisor {
        &self.supervisor
    }

    /// A client configuration stamped with `unit`'s identity.
    #[must_use]
    pub fn client_for(&self, unit: &str) -> ClientConfig {
        self.client.with_user_agent(unit)
    }

    /// Configured worker count for `unit`.
    #[must_use]
    pub fn workers_for(&self, unit: &str, unit_default: Option<usize>) -> usize {
        self.controllers.workers_for(unit, unit_default)
    }

    /// Interval of the conjunctive sync poll.
    #[must_use]
    pub const fn sync_poll_interval(&self) -> Duration {
        self.controllers.sync_poll_interval
    }

    /// Waits for every source in `sources` to report synced, polling at the
    /// configured interval.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Canceled`] if `cancel` fires first.
    pub async fn wait_for_sources(
        &self,
        sources: &[Arc<dyn DataSource>],
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        wait_for_sources_synced(sources, self.controllers.sync_poll_interval, cancel).await
    }

    /// Launches the loop described by `spec` under a child of `parent`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] if the spec asks for zero workers, the unit is
    /// already running, or the supervisor has been shut down. Nothing is
    /// spawned in those cases.
    pub fn launch(
        &self,
        spec: LoopSpec,
        parent: &CancellationToken,
    ) -> Result<ControlLoopHandle, LaunchError> {
        if spec.workers == 0 {
            return Err(LaunchError::ZeroWorkers { unit: spec.unit });
        }

        let unit: Arc<str> = Arc::from(spec.unit);
        let cancel = parent.child_token();
        let tracker = TaskTracker::new();
        let queue = WorkQueue::new(unit.as_ref(), &self.queue);
        let handle = ControlLoopHandle {
            unit: Arc::clone(&unit),
            workers: spec.workers,
            started_at: Utc::now(),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            queue: queue.clone(),
        };
        self.supervisor.track(handle.clone())?;

        for source in spec.sources {
            tracker.spawn(
                feed(source, queue.clone(), cancel.clone()).with_current_subscriber(),
            );
        }
        for worker in 0..spec.workers {
            tracker.spawn(
                work(
                    Arc::clone(&unit),
                    worker,
                    queue.clone(),
                    Arc::clone(&spec.reconciler),
                    cancel.clone(),
                )
                .with_current_subscriber(),
            );
        }
        {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                cancel.cancelled().await;
                queue.shut_down();
            });
        }
        tracker.close();

        info!(unit = %unit, workers = spec.workers, "started control loop");
        Ok(handle)
    }
}

async fn feed(source: Arc<dyn DataSource>, queue: WorkQueue, cancel: CancellationToken) {
    let mut changes = source.subscribe();
    for key in source.keys() {
        queue.add(key);
    }
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(key) => queue.add(key),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        queue = queue.name(),
                        source = source.name(),
                        skipped,
                        "change feed lagged, relisting"
                    );
                    for key in source.keys() {
                        queue.add(key);
                    }
                },
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn work(
    unit: Arc<str>,
    worker: usize,
    queue: WorkQueue,
    reconciler: Arc<dyn Reconciler>,
    cancel: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            key = queue.next() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                queue.done(&key);
                break;
            },
            result = reconciler.reconcile(&key) => result,
        };

        match result {
            Ok(()) => queue.forget(&key),
            Err(ReconcileError::Retry(reason)) => {
                if let Some(delay) = queue.requeue_rate_limited(&key) {
                    debug!(unit = %unit, key = %key, %reason, ?delay, "requeued key");
                }
            },
            Err(ReconcileError::Permanent(reason)) => {
                warn!(unit = %unit, key = %key, %reason, "dropping key");
                queue.forget(&key);
            },
        }
        queue.done(&key);
    }
    debug!(unit = %unit, worker, "control loop worker stopped");
}

/// Waits until every source in `sources` reports synced.
///
/// The first check happens immediately, then once per `interval`. A set
/// that is already synced returns `Ok` even when `cancel` has fired.
///
/// # Errors
///
/// Returns [`GateError::Canceled`] naming the sources still unsynced when
/// `cancel` fires.
pub async fn wait_for_sources_synced(
    sources: &[Arc<dyn DataSource>],
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), GateError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        if sources.iter().all(|s| s.has_synced()) {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let pending: Vec<&str> = sources
                    .iter()
                    .filter(|s| !s.has_synced())
                    .map(|s| s.name())
                    .collect();
                return Err(GateError::canceled(pending.join(", ")));
            },
            _ = ticker.tick() => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::source::InMemorySource;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Reconciler for Recorder {
        async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(ReconcileError::Retry("first attempt".into()));
            }
            self.seen.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn launcher() -> ControlLoopLauncher {
        let mut config = KilnConfig::default();
        config.queue.backoff = crate::backoff::BackoffConfig::Fixed {
            delay: Duration::from_millis(5),
        };
        ControlLoopLauncher::new(ClientConfig::new("http://127.0.0.1:1"), &config)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_processes_existing_and_new_keys() {
        let launcher = launcher();
        let source = Arc::new(InMemorySource::new("namespaces"));
        source.upsert("default", "{}");
        let recorder = Arc::new(Recorder::default());
        let root = CancellationToken::new();

        let handle = launcher
            .launch(
                LoopSpec {
                    unit: "namespace-controller".into(),
                    workers: 3,
                    sources: vec![source.clone()],
                    reconciler: recorder.clone(),
                },
                &root,
            )
            .unwrap();
        assert_eq!(handle.workers(), 3);

        eventually(|| recorder.seen.lock().unwrap().len() == 1).await;
        source.upsert("kube-system", "{}");
        eventually(|| recorder.seen.lock().unwrap().len() == 2).await;

        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.stopped())
            .await
            .unwrap();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_retry_requeues_key() {
        let launcher = launcher();
        let source = Arc::new(InMemorySource::new("quotas"));
        source.upsert("q1", "{}");
        let recorder = Arc::new(Recorder {
            fail_first: true,
            ..Recorder::default()
        });
        let root = CancellationToken::new();

        launcher
            .launch(
                LoopSpec {
                    unit: "quota-controller".into(),
                    workers: 1,
                    sources: vec![source],
                    reconciler: recorder.clone(),
                },
                &root,
            )
            .unwrap();

        eventually(|| recorder.seen.lock().unwrap().as_slice() == ["q1"]).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
        root.cancel();
    }

    #[tokio::test]
    async fn test_launch_rejections() {
        let launcher = launcher();
        let root = CancellationToken::new();
        let spec = |workers| LoopSpec {
            unit: "export-controller".into(),
            workers,
            sources: Vec::new(),
            reconciler: Arc::new(Recorder::default()),
        };

        assert_eq!(
            launcher.launch(spec(0), &root).unwrap_err(),
            LaunchError::ZeroWorkers {
                unit: "export-controller".into()
            }
        );

        launcher.launch(spec(1), &root).unwrap();
        assert!(matches!(
            launcher.launch(spec(1), &root),
            Err(LaunchError::DuplicateLoop { .. })
        ));

        launcher.supervisor().cancel_all();
        assert!(launcher.supervisor().wait_stopped(Duration::from_secs(1)).await);
        assert!(matches!(
            launcher.launch(spec(1), &root),
            Err(LaunchError::SupervisorClosed { .. })
        ));
        assert!(launcher.supervisor().active_workers().is_empty());
    }

    #[test]
    fn test_client_for_stamps_unit() {
        let launcher = launcher();
        let a = launcher.client_for("binding-controller");
        let b = launcher.client_for("export-controller");
        assert!(a.user_agent.ends_with("/binding-controller"));
        assert_ne!(a.user_agent, b.user_agent);
    }

    #[tokio::test]
    async fn test_conjunctive_sync_poll() {
        let schemas = Arc::new(InMemorySource::new("schemas"));
        let exports = Arc::new(InMemorySource::new("exports"));
        let sources: Vec<Arc<dyn DataSource>> = vec![schemas.clone(), exports.clone()];
        let cancel = CancellationToken::new();

        let waiter = {
            let sources = sources.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                wait_for_sources_synced(&sources, Duration::from_millis(10), &cancel).await
            })
        };

        schemas.mark_synced();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished(), "one unsynced source keeps the wait open");

        exports.mark_synced();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_conjunctive_sync_poll_canceled() {
        let schemas = Arc::new(InMemorySource::new("schemas"));
        let sources: Vec<Arc<dyn DataSource>> = vec![schemas];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_for_sources_synced(&sources, Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "timed out waiting for schemas to sync");
    }
}
