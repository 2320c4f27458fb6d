//! Activation and pre-shutdown hook registry.
//!
//! The [`LifecycleManager`] is built once during service construction.
//! Units register named activation hooks against it; once the service is
//! accepting requests, [`LifecycleManager::run_activation_hooks`] starts
//! every hook as its own task with a [`HookContext`] carrying the readiness
//! gates and a child of the service's root cancellation token.
//!
//! A hook failing never affects its siblings:
//!
//! - errors caused by cancellation are logged at `info` and reported as
//!   [`HookOutcome::Canceled`]
//! - any other error, including a panic, is logged at `error` and reported
//!   as [`HookOutcome::Faulted`]
//!
//! Pre-shutdown hooks live in a separate namespace, take no context and run
//! concurrently when [`LifecycleManager::run_pre_shutdown_hooks`] is called.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info};

use crate::launcher::LaunchError;
use crate::readiness::{GateError, GateRequirement, SyncGates};

/// Prefix of activation hooks that start a unit's control loop.
pub const ACTIVATION_HOOK_PREFIX: &str = "kiln-start-";

/// Conventional activation hook name for `unit`.
#[must_use]
pub fn activation_hook_name(unit: &str) -> String {
    format!("{ACTIVATION_HOOK_PREFIX}{unit}")
}

/// The two hook namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Runs once after serving starts.
    Activation,
    /// Runs during graceful shutdown.
    PreShutdown,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activation => f.write_str("activation"),
            Self::PreShutdown => f.write_str("pre-shutdown"),
        }
    }
}

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// A hook with this name is already registered in the namespace.
    #[error("{kind} hook {name:?} is already registered")]
    DuplicateName {
        /// Namespace.
        kind: HookKind,
        /// Offending name.
        name: String,
    },

    /// The namespace's phase has begun; the hook would never run.
    #[error("cannot register {kind} hook {name:?}: {kind} phase has already started")]
    AlreadyStarted {
        /// Namespace.
        kind: HookKind,
        /// Rejected name.
        name: String,
    },

    /// Activation hooks were already run.
    #[error("activation hooks have already been run")]
    AlreadyRun,

    /// Internal lock poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

/// Errors returned by hook actions.
#[derive(Debug, Error)]
pub enum HookError {
    /// Waiting on a gate or sync poll was canceled.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// The control loop could not be launched.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The hook observed cancellation on its own.
    #[error("hook canceled")]
    Canceled,

    /// Any other failure.
    #[error("{0}")]
    Failed(String),

    /// The hook panicked.
    #[error("hook panicked: {0}")]
    Panicked(String),
}

impl HookError {
    /// Wraps an arbitrary failure message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether the error stems from cancellation rather than a fault.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Gate(GateError::Canceled { .. })
                | Self::Launch(LaunchError::SupervisorClosed { .. })
                | Self::Canceled
        )
    }
}

/// Tagged outcome of one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// The action returned `Ok`.
    Completed,
    /// The action stopped because of cancellation.
    Canceled {
        /// Cancellation message.
        reason: String,
    },
    /// The action failed or panicked.
    Faulted {
        /// Rendered error.
        error: String,
    },
}

impl HookOutcome {
    /// Short label, used as a metrics label value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Canceled { .. } => "canceled",
            Self::Faulted { .. } => "faulted",
        }
    }
}

/// Execution status of an activation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    /// Registered, not yet started.
    Pending,
    /// Its task is running.
    Running,
    /// Returned `Ok`.
    Completed,
    /// Stopped by cancellation.
    Canceled,
    /// Faulted.
    Failed,
}

impl HookStatus {
    /// Whether the hook has not reached a terminal state.
    #[must_use]
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl From<&HookOutcome> for HookStatus {
    fn from(outcome: &HookOutcome) -> Self {
        match outcome {
            HookOutcome::Completed => Self::Completed,
            HookOutcome::Canceled { .. } => Self::Canceled,
            HookOutcome::Faulted { .. } => Self::Failed,
        }
    }
}

/// Outcomes of a set of hooks, keyed by hook name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    /// Outcome per hook.
    pub outcomes: BTreeMap<String, HookOutcome>,
}

/// Report of the activation phase.
pub type ActivationReport = HookReport;

/// Report of the pre-shutdown phase.
pub type ShutdownReport = HookReport;

impl HookReport {
    /// Outcome of hook `name`.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&HookOutcome> {
        self.outcomes.get(name)
    }

    fn names_where(&self, pred: impl Fn(&HookOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Hooks that completed.
    #[must_use]
    pub fn completed(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, HookOutcome::Completed))
    }

    /// Hooks that were canceled.
    #[must_use]
    pub fn canceled(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, HookOutcome::Canceled { .. }))
    }

    /// Hooks that faulted.
    #[must_use]
    pub fn faulted(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, HookOutcome::Faulted { .. }))
    }

    /// Number of hooks in the report.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether no hooks ran.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// What an activation hook receives.
#[derive(Debug, Clone)]
pub struct HookContext {
    name: Arc<str>,
    gates: SyncGates,
    cancel: CancellationToken,
}

impl HookContext {
    /// The hook's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The service's readiness gates.
    #[must_use]
    pub const fn gates(&self) -> &SyncGates {
        &self.gates
    }

    /// Token that fires when the service shuts down.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits on the gates named by `requirement`.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::Gate`] if the service shuts down first.
    pub async fn wait_for(&self, requirement: GateRequirement) -> Result<(), HookError> {
        Ok(self.gates.wait(requirement, &self.cancel).await?)
    }
}

type ActivationAction =
    Box<dyn FnOnce(HookContext) -> BoxFuture<'static, Result<(), HookError>> + Send>;
type PreShutdownAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), HookError>> + Send>;

struct Registry<A> {
    names: HashSet<String>,
    hooks: Vec<(String, A)>,
    started: bool,
}

impl<A> Default for Registry<A> {
    fn default() -> Self {
        Self {
            names: HashSet::new(),
            hooks: Vec::new(),
            started: false,
        }
    }
}

impl<A> Registry<A> {
    fn insert(&mut self, kind: HookKind, name: String, action: A) -> Result<(), LifecycleError> {
        if self.started {
            return Err(LifecycleError::AlreadyStarted { kind, name });
        }
        if !self.names.insert(name.clone()) {
            return Err(LifecycleError::DuplicateName { kind, name });
        }
        self.hooks.push((name, action));
        Ok(())
    }

    fn take(&mut self) -> Option<Vec<(String, A)>> {
        if self.started {
            return None;
        }
        self.started = true;
        Some(std::mem::take(&mut self.hooks))
    }
}

type Statuses = Arc<Mutex<BTreeMap<String, HookStatus>>>;

fn set_status(statuses: &Statuses, name: &str, status: HookStatus) {
    statuses
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), status);
}

/// Owns the hook registries and the root cancellation token.
pub struct LifecycleManager {
    gates: SyncGates,
    cancel: CancellationToken,
    activation: Mutex<Registry<ActivationAction>>,
    pre_shutdown: Mutex<Registry<PreShutdownAction>>,
    statuses: Statuses,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("gates", &self.gates)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("statuses", &self.hook_statuses())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a manager with a fresh root cancellation token.
    #[must_use]
    pub fn new(gates: SyncGates) -> Self {
        Self::with_cancellation(gates, CancellationToken::new())
    }

    /// Creates a manager rooted at `cancel`.
    #[must_use]
    pub fn with_cancellation(gates: SyncGates, cancel: CancellationToken) -> Self {
        Self {
            gates,
            cancel,
            activation: Mutex::new(Registry::default()),
            pre_shutdown: Mutex::new(Registry::default()),
            statuses: Arc::default(),
        }
    }

    /// The readiness gates handed to every hook.
    #[must_use]
    pub const fn gates(&self) -> &SyncGates {
        &self.gates
    }

    /// The root cancellation token.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fires the root cancellation token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Registers an activation hook.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DuplicateName`] if `name` is taken, leaving
    /// the existing hook in place, and [`LifecycleError::AlreadyStarted`]
    /// once the activation phase has begun.
    pub fn register_activation_hook<F, Fut>(
        &self,
        name: impl Into<String>,
        action: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnOnce(HookContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        let name = name.into();
        let action: ActivationAction = Box::new(move |ctx| action(ctx).boxed());
        self.activation
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned)?
            .insert(HookKind::Activation, name.clone(), action)?;
        set_status(&self.statuses, &name, HookStatus::Pending);
        debug!(activation_hook = %name, "registered activation hook");
        Ok(())
    }

    /// Registers a pre-shutdown hook.
    ///
    /// # Errors
    ///
    /// Same contract as [`LifecycleManager::register_activation_hook`], for
    /// the pre-shutdown namespace.
    pub fn register_pre_shutdown_hook<F, Fut>(
        &self,
        name: impl Into<String>,
        action: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        let name = name.into();
        let action: PreShutdownAction = Box::new(move || action().boxed());
        self.pre_shutdown
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned)?
            .insert(HookKind::PreShutdown, name.clone(), action)?;
        debug!(pre_shutdown_hook = %name, "registered pre-shutdown hook");
        Ok(())
    }

    /// Names of registered activation hooks.
    #[must_use]
    pub fn activation_hooks(&self) -> Vec<String> {
        self.hook_statuses().into_keys().collect()
    }

    /// Status of activation hook `name`.
    #[must_use]
    pub fn hook_status(&self, name: &str) -> Option<HookStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Status of every activation hook.
    #[must_use]
    pub fn hook_statuses(&self) -> BTreeMap<String, HookStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Activation hooks that have not finished.
    #[must_use]
    pub fn pending_activation_hooks(&self) -> Vec<String> {
        self.hook_statuses()
            .into_iter()
            .filter(|(_, status)| status.is_outstanding())
            .map(|(name, _)| name)
            .collect()
    }

    /// Starts every activation hook as its own task.
    ///
    /// Returns immediately; the hooks keep running in the background
    /// whether or not the returned [`ActivationRun`] is awaited. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyRun`] on the second call.
    pub fn run_activation_hooks(&self) -> Result<ActivationRun, LifecycleError> {
        let hooks = self
            .activation
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned)?
            .take()
            .ok_or(LifecycleError::AlreadyRun)?;

        info!(hooks = hooks.len(), "running activation hooks");
        let tasks = hooks
            .into_iter()
            .map(|(name, action)| {
                let name: Arc<str> = Arc::from(name);
                let ctx = HookContext {
                    name: Arc::clone(&name),
                    gates: self.gates.clone(),
                    cancel: self.cancel.child_token(),
                };
                let statuses = Arc::clone(&self.statuses);
                set_status(&statuses, &name, HookStatus::Running);
                let task = tokio::spawn(
                    run_activation_hook(Arc::clone(&name), action, ctx, statuses)
                        .with_current_subscriber(),
                );
                (name, task)
            })
            .collect();
        Ok(ActivationRun { tasks })
    }

    /// Runs every pre-shutdown hook concurrently and waits for all of them.
    ///
    /// A second call runs nothing and returns an empty report.
    pub async fn run_pre_shutdown_hooks(&self) -> ShutdownReport {
        let hooks = match self.pre_shutdown.lock() {
            Ok(mut registry) => registry.take(),
            Err(_) => {
                error!("pre-shutdown registry lock poisoned");
                None
            },
        };
        let Some(hooks) = hooks else {
            debug!("pre-shutdown hooks already ran");
            return ShutdownReport::default();
        };

        info!(hooks = hooks.len(), "running pre-shutdown hooks");
        let runs = hooks.into_iter().map(|(name, action)| async move {
            let result = isolate(async move { action().await }).await;
            let outcome = classify(result, false);
            log_outcome(HookKind::PreShutdown, &name, &outcome);
            (name, outcome)
        });
        let outcomes = futures::future::join_all(runs).await;

        HookReport {
            outcomes: outcomes.into_iter().collect(),
        }
    }
}

async fn run_activation_hook(
    name: Arc<str>,
    action: ActivationAction,
    ctx: HookContext,
    statuses: Statuses,
) -> HookOutcome {
    let cancel = ctx.cancellation_token().clone();
    let result = isolate(async move { action(ctx).await }).await;
    let outcome = classify(result, cancel.is_cancelled());
    log_outcome(HookKind::Activation, &name, &outcome);
    set_status(&statuses, &name, HookStatus::from(&outcome));
    outcome
}

async fn isolate<F>(fut: F) -> Result<(), HookError>
where
    F: Future<Output = Result<(), HookError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HookError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// A non-panic error returned once `canceled` is set counts as cancellation.
fn classify(result: Result<(), HookError>, canceled: bool) -> HookOutcome {
    match result {
        Ok(()) => HookOutcome::Completed,
        Err(err @ HookError::Panicked(_)) => HookOutcome::Faulted {
            error: err.to_string(),
        },
        Err(err) if canceled || err.is_cancellation() => HookOutcome::Canceled {
            reason: err.to_string(),
        },
        Err(err) => HookOutcome::Faulted {
            error: err.to_string(),
        },
    }
}

fn log_outcome(kind: HookKind, name: &str, outcome: &HookOutcome) {
    match (kind, outcome) {
        (HookKind::Activation, HookOutcome::Completed) => {
            info!(activation_hook = %name, "activation hook completed");
        },
        (HookKind::Activation, HookOutcome::Canceled { reason }) => {
            info!(activation_hook = %name, %reason, "activation hook canceled");
        },
        (HookKind::Activation, HookOutcome::Faulted { error }) => {
            error!(activation_hook = %name, %error, "activation hook failed");
        },
        (HookKind::PreShutdown, HookOutcome::Completed) => {
            info!(pre_shutdown_hook = %name, "pre-shutdown hook completed");
        },
        (HookKind::PreShutdown, HookOutcome::Canceled { reason }) => {
            info!(pre_shutdown_hook = %name, %reason, "pre-shutdown hook canceled");
        },
        (HookKind::PreShutdown, HookOutcome::Faulted { error }) => {
            error!(pre_shutdown_hook = %name, %error, "pre-shutdown hook failed");
        },
    }
}

/// Handle to a started activation phase.
///
/// Dropping it leaves the hooks running.
#[derive(Debug)]
pub struct ActivationRun {
    tasks: Vec<(Arc<str>, JoinHandle<HookOutcome>)>,
}

impl ActivationRun {
    /// Number of hooks started.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no hooks were registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every hook and collects their outcomes.
    pub async fn join(self) -> ActivationReport {
        let mut report = HookReport::default();
        for (name, task) in self.tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(err) => HookOutcome::Faulted {
                    error: format!("hook task aborted: {err}"),
                },
            };
            report.outcomes.insert(name.to_string(), outcome);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    // =========================================================================
    // Registration
    // =========================================================================

    #[test]
    fn test_duplicate_name_rejected_and_first_kept() {
        let manager = LifecycleManager::new(SyncGates::new());
        manager
            .register_activation_hook("a", |_ctx| async { Ok(()) })
            .unwrap();
        let err = manager
            .register_activation_hook("a", |_ctx| async { Err(HookError::failed("second")) })
            .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::DuplicateName {
                kind: HookKind::Activation,
                name: "a".into()
            }
        );
        assert_eq!(manager.activation_hooks(), vec!["a".to_string()]);
    }

    #[test]
    fn test_namespaces_are_independent() {
        let manager = LifecycleManager::new(SyncGates::new());
        manager
            .register_activation_hook("quota", |_ctx| async { Ok(()) })
            .unwrap();
        manager
            .register_pre_shutdown_hook("quota", || async { Ok(()) })
            .unwrap();
        assert!(matches!(
            manager.register_pre_shutdown_hook("quota", || async { Ok(()) }),
            Err(LifecycleError::DuplicateName {
                kind: HookKind::PreShutdown,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_registration_after_start_rejected() {
        let manager = LifecycleManager::new(SyncGates::new());
        let run = manager.run_activation_hooks().unwrap();
        assert!(run.is_empty());

        assert!(matches!(
            manager.register_activation_hook("late", |_ctx| async { Ok(()) }),
            Err(LifecycleError::AlreadyStarted { .. })
        ));
        assert!(matches!(
            manager.run_activation_hooks(),
            Err(LifecycleError::AlreadyRun)
        ));
    }

    // =========================================================================
    // Activation
    // =========================================================================

    #[tokio::test]
    async fn test_fault_and_panic_are_isolated() {
        let manager = LifecycleManager::new(SyncGates::new());
        manager
            .register_activation_hook("ok", |_ctx| async { Ok(()) })
            .unwrap();
        manager
            .register_activation_hook("fails", |_ctx| async { Err(HookError::failed("boom")) })
            .unwrap();
        manager
            .register_activation_hook("panics", |_ctx| async { panic!("kaboom") })
            .unwrap();

        let report = manager.run_activation_hooks().unwrap().join().await;

        assert_eq!(report.completed(), vec!["ok"]);
        assert_eq!(report.faulted(), vec!["fails", "panics"]);
        assert_eq!(
            report.outcome("panics"),
            Some(&HookOutcome::Faulted {
                error: "hook panicked: kaboom".into()
            })
        );
        assert_eq!(manager.hook_status("fails"), Some(HookStatus::Failed));
        assert_eq!(manager.hook_status("ok"), Some(HookStatus::Completed));
        assert!(manager.pending_activation_hooks().is_empty());
    }

    #[tokio::test]
    async fn test_gate_wait_then_cancel_is_not_a_fault() {
        let manager = LifecycleManager::new(SyncGates::new());
        manager
            .register_activation_hook("waits", |ctx| async move {
                ctx.wait_for(GateRequirement::Required).await
            })
            .unwrap();

        let run = manager.run_activation_hooks().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pending_activation_hooks(), vec!["waits".to_string()]);

        manager.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), run.join())
            .await
            .unwrap();
        assert_eq!(report.canceled(), vec!["waits"]);
        assert_eq!(manager.hook_status("waits"), Some(HookStatus::Canceled));
    }

    #[tokio::test]
    async fn test_errors_after_shutdown_are_cancellations() {
        let manager = LifecycleManager::new(SyncGates::new());
        manager
            .register_activation_hook("store-client", |ctx| async move {
                ctx.cancellation_token().cancelled().await;
                Err(HookError::failed("store connection closed"))
            })
            .unwrap();
        manager
            .register_activation_hook("late-launch", |ctx| async move {
                ctx.cancellation_token().cancelled().await;
                Err(HookError::Launch(LaunchError::SupervisorClosed {
                    unit: "quota-controller".into(),
                }))
            })
            .unwrap();
        manager
            .register_activation_hook("panics-on-stop", |ctx| async move {
                ctx.cancellation_token().cancelled().await;
                panic!("stop handler bug")
            })
            .unwrap();

        let run = manager.run_activation_hooks().unwrap();
        manager.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), run.join())
            .await
            .unwrap();

        assert_eq!(report.canceled(), vec!["late-launch", "store-client"]);
        assert_eq!(report.faulted(), vec!["panics-on-stop"]);
        assert_eq!(manager.hook_status("late-launch"), Some(HookStatus::Canceled));
    }

    #[test]
    fn test_closed_supervisor_classified_as_cancellation() {
        let closed = HookError::Launch(LaunchError::SupervisorClosed {
            unit: "quota-controller".into(),
        });
        assert!(closed.is_cancellation());
        assert!(matches!(
            classify(Err(closed), false),
            HookOutcome::Canceled { .. }
        ));
        assert!(matches!(
            classify(Err(HookError::failed("boom")), false),
            HookOutcome::Faulted { .. }
        ));
    }

    #[tokio::test]
    async fn test_hooks_receive_named_context() {
        let manager = LifecycleManager::new(SyncGates::new());
        let name = activation_hook_name("namespace-controller");
        manager
            .register_activation_hook(name.clone(), |ctx| async move {
                if ctx.name() == "kiln-start-namespace-controller" {
                    Ok(())
                } else {
                    Err(HookError::failed(format!("wrong name {}", ctx.name())))
                }
            })
            .unwrap();

        let report = manager.run_activation_hooks().unwrap().join().await;
        assert_eq!(report.outcome(&name), Some(&HookOutcome::Completed));
    }

    // =========================================================================
    // Pre-shutdown
    // =========================================================================

    #[tokio::test]
    async fn test_pre_shutdown_hooks_run_once() {
        let manager = LifecycleManager::new(SyncGates::new());
        let calls = Arc::new(AtomicUsize::new(0));
        for name in ["close-admission", "flush"] {
            let calls = Arc::clone(&calls);
            manager
                .register_pre_shutdown_hook(name, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        manager
            .register_pre_shutdown_hook("broken", || async { panic!("nope") })
            .unwrap();

        let report = manager.run_pre_shutdown_hooks().await;
        assert_eq!(report.completed(), vec!["close-admission", "flush"]);
        assert_eq!(report.faulted(), vec!["broken"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(manager.run_pre_shutdown_hooks().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            manager.register_pre_shutdown_hook("late", || async { Ok(()) }),
            Err(LifecycleError::AlreadyStarted { .. })
        ));
    }
}
