//! Instance lifecycle states.

use std::fmt;

use crate::error::InstanceError;

/// Lifecycle state of one fleet instance.
///
/// ```text
/// created -> starting -> ready -> running -> stopping -> stopped
///               |          |         |
///               +----------+---------+-----> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Directories and ports are reserved.
    Created,
    /// The process or task has been started.
    Starting,
    /// Credentials loaded and the readiness probe passed.
    Ready,
    /// Every instance of the fleet is ready.
    Running,
    /// Teardown has begun.
    Stopping,
    /// The process or task has exited after teardown.
    Stopped,
    /// Never became ready, or exited on its own.
    Failed,
}

impl InstanceState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting)
                | (Self::Starting | Self::Ready | Self::Running, Self::Failed)
                | (Self::Starting, Self::Ready)
                | (Self::Ready, Self::Running | Self::Stopping)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }

    /// Returns `next` if the transition is legal.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::InvalidTransition`] otherwise.
    pub fn transition(self, next: Self) -> Result<Self, InstanceError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InstanceError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [InstanceState; 7] = [
        InstanceState::Created,
        InstanceState::Starting,
        InstanceState::Ready,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::Failed,
    ];

    #[test]
    fn test_happy_path() {
        let mut state = InstanceState::Created;
        for next in [
            InstanceState::Starting,
            InstanceState::Ready,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ] {
            state = state.transition(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for from in [InstanceState::Stopped, InstanceState::Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(matches!(
            InstanceState::Created.transition(InstanceState::Ready),
            Err(InstanceError::InvalidTransition {
                from: InstanceState::Created,
                to: InstanceState::Ready,
            })
        ));
        assert!(!InstanceState::Created.can_transition_to(InstanceState::Failed));
        assert!(!InstanceState::Stopping.can_transition_to(InstanceState::Failed));
    }
}
