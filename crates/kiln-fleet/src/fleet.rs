//! Starting, readying and tearing down a set of instances together.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use kiln_core::ReadinessGate;
use tracing::{error, info, warn};

use crate::artifacts::{Artifact, ArtifactProducer};
use crate::command::ServerCommand;
use crate::error::{ArtifactError, FleetError, InstanceError};
use crate::instance::{InProcessServer, InstanceConfig, ServiceInstance};
use crate::logs::LogFilter;
use crate::state::InstanceState;

/// Run every instance in-process.
pub const IN_PROCESS_ENV: &str = "KILN_FLEET_IN_PROCESS";

/// Echo every instance's logs to stdout.
pub const LOG_TO_CONSOLE_ENV: &str = "KILN_FLEET_LOG_TO_CONSOLE";

/// Credential and probe budget per instance.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// How long teardown waits for each instance to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Fleet-wide settings.
#[derive(Clone)]
pub struct FleetOptions {
    /// Forces in-process mode for every instance.
    pub in_process: bool,
    /// Forces console logs for every instance.
    pub log_to_console: bool,
    /// How subprocesses are started.
    pub command: ServerCommand,
    /// Server used by in-process instances.
    pub in_process_server: Option<Arc<dyn InProcessServer>>,
    /// Budget for credentials plus readiness probe, per instance.
    pub ready_timeout: Duration,
    /// Budget for each instance to exit at teardown.
    pub stop_timeout: Duration,
    /// Signaled once when every instance is ready.
    pub ready_signal: Option<ReadinessGate>,
    /// Noise removed from failure reports.
    pub log_filter: LogFilter,
}

impl fmt::Debug for FleetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetOptions")
            .field("in_process", &self.in_process)
            .field("log_to_console", &self.log_to_console)
            .field("command", &self.command)
            .field("has_in_process_server", &self.in_process_server.is_some())
            .field("ready_timeout", &self.ready_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            in_process: false,
            log_to_console: false,
            command: ServerCommand::CargoRun,
            in_process_server: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            ready_signal: None,
            log_filter: LogFilter::default(),
        }
    }
}

impl FleetOptions {
    /// Options read from [`IN_PROCESS_ENV`], [`LOG_TO_CONSOLE_ENV`] and
    /// [`crate::command::SERVER_BIN_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            in_process: env_flag(IN_PROCESS_ENV),
            log_to_console: env_flag(LOG_TO_CONSOLE_ENV),
            command: ServerCommand::from_env(),
            ..Self::default()
        }
    }

    /// Sets the server used in in-process mode.
    #[must_use]
    pub fn with_in_process_server(mut self, server: impl InProcessServer) -> Self {
        self.in_process_server = Some(Arc::new(server));
        self
    }

    /// Sets the subprocess command.
    #[must_use]
    pub fn with_command(mut self, command: ServerCommand) -> Self {
        self.command = command;
        self
    }

    /// Sets the gate signaled when the whole fleet is ready.
    #[must_use]
    pub fn with_ready_signal(mut self, gate: ReadinessGate) -> Self {
        self.ready_signal = Some(gate);
        self
    }

    /// Sets the readiness budget.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// A set of running instances owned by one test scope.
///
/// [`Fleet::shutdown`] collects artifacts and metrics and stops every
/// instance. Dropping a fleet that was not shut down sends the termination
/// signal to every instance without waiting.
pub struct Fleet {
    instances: Vec<Arc<ServiceInstance>>,
    options: FleetOptions,
    producers: Mutex<Vec<(usize, ArtifactProducer)>>,
}

impl fmt::Debug for Fleet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fleet")
            .field(
                "instances",
                &self
                    .instances
                    .iter()
                    .map(|i| (i.name(), i.state()))
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Fleet {
    /// Creates and starts every instance, then waits for all of them to
    /// become ready or fail.
    ///
    /// A failing instance does not cut the wait short for its siblings.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::DuplicateInstance`] or
    /// [`FleetError::InvalidConfig`] before anything starts,
    /// [`FleetError::Instance`] if an instance cannot be created, and
    /// [`FleetError::SetupFailed`], carrying the fleet, if any instance could
    /// not be started or did not become ready.
    pub async fn start(
        options: FleetOptions,
        configs: Vec<InstanceConfig>,
    ) -> Result<Self, FleetError> {
        validate(&options, &configs)?;
        let started = Instant::now();

        let mut instances = Vec::with_capacity(configs.len());
        for mut config in configs {
            config.run_in_process |= options.in_process;
            config.log_to_console |= options.log_to_console;
            let instance = ServiceInstance::create(&config, options.log_filter.clone())
                .map_err(|source| FleetError::Instance {
                    name: config.name.clone(),
                    source,
                })?;
            instances.push(Arc::new(instance));
        }
        let fleet = Self {
            instances,
            options,
            producers: Mutex::new(Vec::new()),
        };

        info!(instances = fleet.instances.len(), "starting kiln servers");
        let mut failures: Vec<(String, InstanceError)> = Vec::new();
        let mut launched = Vec::with_capacity(fleet.instances.len());
        for instance in &fleet.instances {
            match instance.start(&fleet.options.command, fleet.options.in_process_server.as_ref()) {
                Ok(()) => launched.push(instance),
                Err(e) => failures.push((instance.name().to_string(), e)),
            }
        }

        let timeout = fleet.options.ready_timeout;
        let results = join_all(launched.iter().map(|i| i.wait_ready(timeout))).await;

        for instance in &launched {
            if instance.state() == InstanceState::Ready {
                if let Err(e) = instance.scrape_metrics().await {
                    warn!(instance = %instance.name(), error = %e, "failed to scrape metrics");
                }
            }
        }

        failures.extend(
            launched
                .iter()
                .zip(results)
                .filter_map(|(instance, result)| {
                    result.err().map(|e| (instance.name().to_string(), e))
                }),
        );
        if !failures.is_empty() {
            error!(
                failed = failures.len(),
                "fleet setup failed: one or more servers did not start or become ready"
            );
            return Err(FleetError::SetupFailed {
                failures,
                fleet: Box::new(fleet),
            });
        }

        for instance in &fleet.instances {
            instance
                .mark_running()
                .map_err(|source| FleetError::Instance {
                    name: instance.name().to_string(),
                    source,
                })?;
        }
        if let Some(gate) = &fleet.options.ready_signal {
            gate.signal();
        }
        info!(elapsed = ?started.elapsed(), "started kiln servers");
        Ok(fleet)
    }

    /// Every instance, in config order.
    #[must_use]
    pub fn instances(&self) -> &[Arc<ServiceInstance>] {
        &self.instances
    }

    /// The instance called `name`.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&Arc<ServiceInstance>> {
        self.instances.iter().find(|i| i.name() == name)
    }

    /// Registers a snapshot producer for `instance`, run at teardown before
    /// the instance stops.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::InvalidConfig`] for an unknown instance.
    pub fn artifact<F, Fut>(&self, instance: &str, producer: F) -> Result<(), FleetError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Artifact>> + Send + 'static,
    {
        let index = self
            .instances
            .iter()
            .position(|i| i.name() == instance)
            .ok_or_else(|| FleetError::InvalidConfig {
                name: instance.to_string(),
                reason: "no such instance".into(),
            })?;
        let producer: ArtifactProducer = Box::new(move || producer().boxed());
        self.producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((index, producer));
        Ok(())
    }

    /// Collects artifacts and metrics, then terminates every instance and
    /// waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Teardown`] listing every problem; teardown of
    /// the remaining instances continues past each one.
    pub async fn shutdown(self) -> Result<(), FleetError> {
        let mut failures = Vec::new();

        let producers =
            std::mem::take(&mut *self.producers.lock().unwrap_or_else(PoisonError::into_inner));
        for (index, producer) in producers {
            let Some(instance) = self.instances.get(index) else {
                continue;
            };
            let result = match producer().await {
                Ok(artifact) => artifact.write_to(&instance.snapshot_dir()).map(|_| ()),
                Err(e) => Err(ArtifactError::Producer(e)),
            };
            if let Err(e) = result {
                warn!(instance = %instance.name(), error = %e, "failed to collect artifact");
                failures.push((instance.name().to_string(), e.into()));
            }
        }

        for instance in &self.instances {
            if matches!(instance.state(), InstanceState::Ready | InstanceState::Running) {
                if let Err(e) = instance.scrape_metrics().await {
                    warn!(instance = %instance.name(), error = %e, "failed to gather metrics");
                }
            }
        }

        let timeout = self.options.stop_timeout;
        let results = join_all(self.instances.iter().map(|i| i.stop(timeout))).await;
        for (instance, result) in self.instances.iter().zip(results) {
            if let Err(e) = result {
                error!(instance = %instance.name(), error = %e, "failed to stop kiln-server");
                failures.push((instance.name().to_string(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Teardown { failures })
        }
    }
}

fn validate(options: &FleetOptions, configs: &[InstanceConfig]) -> Result<(), FleetError> {
    let mut names = HashSet::new();
    for config in configs {
        let invalid = |reason: &str| FleetError::InvalidConfig {
            name: config.name.clone(),
            reason: reason.to_string(),
        };
        if config.name.is_empty() {
            return Err(invalid("missing name"));
        }
        if !names.insert(config.name.as_str()) {
            return Err(FleetError::DuplicateInstance(config.name.clone()));
        }
        if config.artifact_root.as_os_str().is_empty() {
            return Err(invalid("missing artifact root"));
        }
        if config.data_root.as_os_str().is_empty() {
            return Err(invalid("missing data root"));
        }
        if (config.run_in_process || options.in_process) && options.in_process_server.is_none() {
            return Err(invalid("in-process mode without an in-process server"));
        }
    }
    Ok(())
}
