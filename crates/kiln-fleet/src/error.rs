//! Error types for fleet orchestration.

use std::path::PathBuf;
use std::time::Duration;

use kiln_core::credentials::CredentialError;
use thiserror::Error;

use crate::fleet::Fleet;
use crate::state::InstanceState;

/// Errors concerning a single instance.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The process could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// Program that was run.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The process started but reported no pid.
    #[error("spawned process has no pid")]
    MissingPid,

    /// A state change that the lifecycle does not allow.
    #[error("invalid instance state transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: InstanceState,
        /// Requested state.
        to: InstanceState,
    },

    /// In-process mode was requested but no server was provided.
    #[error("instance {name} runs in-process but the fleet has no in-process server")]
    NoInProcessServer {
        /// Instance name.
        name: String,
    },

    /// Client configuration was requested before credentials were loaded.
    #[error("credentials for instance {name} have not been loaded yet")]
    CredentialsNotLoaded {
        /// Instance name.
        name: String,
    },

    /// Credentials never became usable.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// The readiness probe never succeeded.
    #[error("instance {name} not ready after {waited:?}: {last_error}")]
    Probe {
        /// Instance name.
        name: String,
        /// Time spent probing.
        waited: Duration,
        /// Last probe result.
        last_error: String,
    },

    /// An HTTP request to the instance failed.
    #[error("request to {url} failed: {source}")]
    Http {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The instance did not exit within the stop timeout.
    #[error("instance {name} still running {waited:?} after termination was requested")]
    StopTimeout {
        /// Instance name.
        name: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The process or task exited before teardown.
    #[error("instance {name} exited unexpectedly: {reason}")]
    Exited {
        /// Instance name.
        name: String,
        /// Exit status or task error.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another live instance already uses this directory.
    #[error("directory {0} is already used by another instance")]
    DirectoryInUse(PathBuf),

    /// No free port could be reserved.
    #[error("failed to reserve a free port: {0}")]
    NoFreePort(#[source] std::io::Error),

    /// Sending the termination signal failed.
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        /// Process group id.
        pgid: u32,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// An artifact could not be collected.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// A lock guarding instance state was poisoned.
    #[error("instance lock poisoned")]
    LockPoisoned,
}

impl InstanceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors writing an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The object has no name.
    #[error("artifact has an empty name")]
    EmptyName,

    /// Rendering the object failed.
    #[error("failed to render artifact: {0}")]
    Render(#[from] serde_yaml::Error),

    /// Writing the file failed.
    #[error("failed to write artifact {path}: {source}")]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The producer failed.
    #[error("artifact producer failed: {0}")]
    Producer(#[source] anyhow::Error),
}

/// Errors from fleet setup and teardown.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Two configs share a name.
    #[error("duplicate instance name {0}")]
    DuplicateInstance(String),

    /// A config is incomplete.
    #[error("invalid config for instance {name}: {reason}")]
    InvalidConfig {
        /// Instance name.
        name: String,
        /// What is missing.
        reason: String,
    },

    /// Creating or starting an instance failed.
    #[error("instance {name}: {source}")]
    Instance {
        /// Instance name.
        name: String,
        /// Underlying error.
        #[source]
        source: InstanceError,
    },

    /// At least one instance never became ready.
    ///
    /// Carries the fleet so the logs of every instance stay available.
    #[error("fleet setup failed: {}", format_failures(.failures))]
    SetupFailed {
        /// Failures by instance name.
        failures: Vec<(String, InstanceError)>,
        /// The fleet, still owning every instance.
        fleet: Box<Fleet>,
    },

    /// Teardown reported problems.
    #[error("fleet teardown failed: {}", format_failures(.failures))]
    Teardown {
        /// Failures by instance name.
        failures: Vec<(String, InstanceError)>,
    },
}

fn format_failures(failures: &[(String, InstanceError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
