//! One-shot readiness gates.
//!
//! A [`ReadinessGate`] starts pending and transitions to signaled at most
//! once. The transition is broadcast to every waiter, including waiters that
//! subscribe after the fact, and there is no reset.
//!
//! The service owns two independent gates bundled as [`SyncGates`]:
//!
//! - `required`: every mandatory data source has completed its initial load
//! - `optional`: every optional data source has completed its initial load
//!
//! Units declare which of them they need through [`GateRequirement`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors returned while waiting on a gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    /// The cancellation token fired before the gate was signaled.
    #[error("timed out waiting for {gate} to sync")]
    Canceled {
        /// Human-readable name of what was being waited on.
        gate: String,
    },
}

impl GateError {
    pub(crate) fn canceled(gate: impl Into<String>) -> Self {
        Self::Canceled { gate: gate.into() }
    }
}

/// A one-shot, idempotent broadcast signal.
///
/// Cloning a gate yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    name: Arc<str>,
    tx: Arc<watch::Sender<bool>>,
}

impl ReadinessGate {
    /// Creates a pending gate.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            name: Arc::from(name.into()),
            tx: Arc::new(tx),
        }
    }

    /// The gate's name, used in error messages and logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transitions the gate to signaled.
    ///
    /// Returns `true` for the call that performed the transition and `false`
    /// for every later call.
    pub fn signal(&self) -> bool {
        let transitioned = self.tx.send_if_modified(|signaled| {
            if *signaled {
                false
            } else {
                *signaled = true;
                true
            }
        });
        if transitioned {
            tracing::debug!(gate = %self.name, "readiness gate signaled");
        }
        transitioned
    }

    /// Whether the gate has been signaled.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the gate is signaled or `cancel` fires.
    ///
    /// An already-signaled gate returns immediately, even when `cancel` has
    /// also fired.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Canceled`] if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), GateError> {
        if self.is_signaled() {
            return Ok(());
        }
        let rx = self.tx.subscribe();
        tokio::select! {
            biased;
            signaled = signaled(rx) => {
                if signaled {
                    Ok(())
                } else {
                    Err(GateError::canceled(self.name.as_ref()))
                }
            }
            () = cancel.cancelled() => Err(GateError::canceled(self.name.as_ref())),
        }
    }
}

async fn signaled(mut rx: watch::Receiver<bool>) -> bool {
    rx.wait_for(|signaled| *signaled).await.is_ok()
}

/// Which gates an activation unit must observe before it launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateRequirement {
    /// Only the mandatory-sources gate.
    #[default]
    Required,
    /// Both the mandatory and the optional-sources gate.
    RequiredAndOptional,
}

/// The service's pair of data-source gates.
#[derive(Debug, Clone)]
pub struct SyncGates {
    /// Signaled once mandatory sources have synced.
    pub required: ReadinessGate,
    /// Signaled once optional sources have synced.
    pub optional: ReadinessGate,
}

impl Default for SyncGates {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncGates {
    /// Creates both gates in the pending state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            required: ReadinessGate::new("required sources"),
            optional: ReadinessGate::new("optional sources"),
        }
    }

    /// Waits on the gate(s) named by `requirement`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Canceled`] if `cancel` fires before every gate
    /// in the requirement is signaled.
    pub async fn wait(
        &self,
        requirement: GateRequirement,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        self.required.wait(cancel).await?;
        if requirement == GateRequirement::RequiredAndOptional {
            self.optional.wait(cancel).await?;
        }
        Ok(())
    }

    /// Whether every gate in `requirement` is signaled.
    #[must_use]
    pub fn is_satisfied(&self, requirement: GateRequirement) -> bool {
        match requirement {
            GateRequirement::Required => self.required.is_signaled(),
            GateRequirement::RequiredAndOptional => {
                self.required.is_signaled() && self.optional.is_signaled()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_signal_transitions_once() {
        let gate = ReadinessGate::new("test");
        assert!(!gate.is_signaled());
        assert!(gate.signal());
        assert!(gate.is_signaled());
        assert!(!gate.signal());
        assert!(gate.is_signaled());
    }

    #[tokio::test]
    async fn test_early_and_late_waiters_observe_signal() {
        let gate = ReadinessGate::new("test");
        let cancel = CancellationToken::new();

        let early = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(&cancel).await })
        };

        tokio::task::yield_now().await;
        gate.signal();

        assert_eq!(early.await.unwrap(), Ok(()));
        // A waiter joining after the transition returns immediately.
        assert_eq!(gate.wait(&cancel).await, Ok(()));
    }

    #[tokio::test]
    async fn test_cancellation_before_signal() {
        let gate = ReadinessGate::new("required sources");
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(&cancel).await })
        };

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();

        assert_eq!(err, GateError::canceled("required sources"));
        assert_eq!(
            err.to_string(),
            "timed out waiting for required sources to sync"
        );
    }

    #[tokio::test]
    async fn test_signaled_gate_wins_over_cancellation() {
        let gate = ReadinessGate::new("test");
        let cancel = CancellationToken::new();
        gate.signal();
        cancel.cancel();
        assert_eq!(gate.wait(&cancel).await, Ok(()));
    }

    #[tokio::test]
    async fn test_sync_gates_are_independent() {
        let gates = SyncGates::new();
        let cancel = CancellationToken::new();

        gates.required.signal();
        assert!(gates.is_satisfied(GateRequirement::Required));
        assert!(!gates.is_satisfied(GateRequirement::RequiredAndOptional));
        assert_eq!(gates.wait(GateRequirement::Required, &cancel).await, Ok(()));

        let both = {
            let gates = gates.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gates
                    .wait(GateRequirement::RequiredAndOptional, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!both.is_finished());

        gates.optional.signal();
        assert_eq!(both.await.unwrap(), Ok(()));
    }
}
