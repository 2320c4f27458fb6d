//! One service instance of a fleet.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use kiln_core::credentials::{
    CredentialDocument, CredentialLoader, BASE_CONTEXT, SHARD_BASE_CONTEXT,
};
use kiln_core::ClientConfig;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use crate::command::ServerCommand;
use crate::error::InstanceError;
use crate::logs::{LogFilter, LogSink};
use crate::ports::{DirectoryClaim, PortAllocator, PortReservation};
use crate::spawn::{spawn, terminate_group};
use crate::state::InstanceState;

/// Name of the credential document inside an instance's data directory.
pub const CREDENTIALS_FILE_NAME: &str = "admin.credentials";

/// Write-ahead log segment size handed to every instance.
pub const TEST_WAL_SIZE_BYTES: u64 = 5 * 1000;

/// Interval between readiness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the server inside the test process.
///
/// Receives exactly the argument list a subprocess would get and must
/// return once `shutdown` fires.
pub trait InProcessServer: Send + Sync + 'static {
    /// Runs one server until `shutdown` fires.
    fn run(
        &self,
        args: Vec<String>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> InProcessServer for F
where
    F: Fn(Vec<String>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(
        &self,
        args: Vec<String>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(args, shutdown))
    }
}

/// Requested shape of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Unique name within the fleet.
    pub name: String,
    /// Root under which `kiln/<name>` holds logs, audit and metrics.
    pub artifact_root: PathBuf,
    /// Root under which `kiln/<name>` holds the server's state.
    pub data_root: PathBuf,
    /// Value of `--feature-gates`.
    pub feature_gates: String,
    /// Extra server arguments, appended last.
    pub args: Vec<String>,
    /// Run inside the test process instead of as a subprocess.
    pub run_in_process: bool,
    /// Echo logs to stdout with a name prefix.
    pub log_to_console: bool,
}

impl InstanceConfig {
    /// Config with both roots set and no extras.
    pub fn new(
        name: impl Into<String>,
        artifact_root: impl Into<PathBuf>,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact_root: artifact_root.into(),
            data_root: data_root.into(),
            feature_gates: String::new(),
            args: Vec::new(),
            run_in_process: false,
            log_to_console: false,
        }
    }

    /// Appends extra server arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets `--feature-gates`.
    #[must_use]
    pub fn with_feature_gates(mut self, gates: impl Into<String>) -> Self {
        self.feature_gates = gates.into();
        self
    }

    /// Runs the instance in-process.
    #[must_use]
    pub const fn in_process(mut self, enabled: bool) -> Self {
        self.run_in_process = enabled;
        self
    }

    /// Streams logs to stdout.
    #[must_use]
    pub const fn with_console_logs(mut self, enabled: bool) -> Self {
        self.log_to_console = enabled;
        self
    }
}

/// Ports reserved for one instance.
#[derive(Debug)]
pub struct InstancePorts {
    /// `--secure-port`.
    pub secure: PortReservation,
    /// `--embedded-store-client-port`.
    pub store_client: PortReservation,
    /// `--embedded-store-peer-port`.
    pub store_peer: PortReservation,
}

impl InstancePorts {
    fn reserve() -> Result<Self, InstanceError> {
        Ok(Self {
            secure: PortAllocator.reserve()?,
            store_client: PortAllocator.reserve()?,
            store_peer: PortAllocator.reserve()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Launched {
    Process { pgid: u32 },
    InProcess,
}

/// A fleet member: directories, ports, process or task, captured logs and,
/// once loaded, its credentials.
#[derive(Debug)]
pub struct ServiceInstance {
    name: String,
    args: Vec<String>,
    artifact_root: PathBuf,
    artifact_dir: PathBuf,
    data_dir: PathBuf,
    credentials_path: PathBuf,
    ports: InstancePorts,
    _claims: [DirectoryClaim; 2],
    state: Arc<Mutex<InstanceState>>,
    credentials: RwLock<Option<CredentialDocument>>,
    logs: LogSink,
    filter: LogFilter,
    cancel: CancellationToken,
    exit: Arc<watch::Sender<Option<String>>>,
    launched: Mutex<Option<Launched>>,
    run_in_process: bool,
}

impl ServiceInstance {
    /// Creates directories, reserves ports and opens the log file.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] if a directory cannot be created or
    /// claimed, or no port can be reserved.
    pub fn create(config: &InstanceConfig, filter: LogFilter) -> Result<Self, InstanceError> {
        let artifact_dir = config.artifact_root.join("kiln").join(&config.name);
        let data_dir = config.data_root.join("kiln").join(&config.name);
        for dir in [&artifact_dir, &data_dir] {
            std::fs::create_dir_all(dir).map_err(|e| InstanceError::io(dir, e))?;
        }
        let claims = [
            DirectoryClaim::claim(&artifact_dir)?,
            DirectoryClaim::claim(&data_dir)?,
        ];
        let ports = InstancePorts::reserve()?;

        let credentials_path = data_dir.join(CREDENTIALS_FILE_NAME);
        let mut args = vec![
            "--root-directory".to_string(),
            data_dir.display().to_string(),
            format!("--secure-port={}", ports.secure.port()),
            format!("--embedded-store-client-port={}", ports.store_client.port()),
            format!("--embedded-store-peer-port={}", ports.store_peer.port()),
            format!("--embedded-store-wal-size-bytes={TEST_WAL_SIZE_BYTES}"),
            format!("--credentials-path={}", credentials_path.display()),
            format!("--feature-gates={}", config.feature_gates),
            "--audit-log-path".to_string(),
            artifact_dir.join("kiln.audit").display().to_string(),
        ];
        args.extend(config.args.iter().cloned());

        let log_path = artifact_dir.join("kiln.log");
        let logs = LogSink::create(&log_path, config.log_to_console.then_some(config.name.as_str()))
            .map_err(|e| InstanceError::io(&log_path, e))?;
        let (exit, _) = watch::channel(None);

        Ok(Self {
            name: config.name.clone(),
            args,
            artifact_root: config.artifact_root.clone(),
            artifact_dir,
            data_dir,
            credentials_path,
            ports,
            _claims: claims,
            state: Arc::new(Mutex::new(InstanceState::Created)),
            credentials: RwLock::new(None),
            logs,
            filter,
            cancel: CancellationToken::new(),
            exit: Arc::new(exit),
            launched: Mutex::new(None),
            run_in_process: config.run_in_process,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full server argument list.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// `<artifact_root>/kiln/<name>`.
    #[must_use]
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Where artifact snapshots for this instance go.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.artifact_root
            .join("artifacts")
            .join("kiln")
            .join(&self.name)
    }

    /// `<data_root>/kiln/<name>`.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the credential document the server writes.
    #[must_use]
    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    /// Reserved ports.
    #[must_use]
    pub const fn ports(&self) -> &InstancePorts {
        &self.ports
    }

    /// Whether the instance runs in-process.
    #[must_use]
    pub const fn is_in_process(&self) -> bool {
        self.run_in_process
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything the instance printed so far.
    #[must_use]
    pub fn logs(&self) -> String {
        self.logs.contents()
    }

    /// [`ServiceInstance::logs`] without known-benign noise.
    #[must_use]
    pub fn filtered_logs(&self) -> String {
        self.filter.filter(&self.logs.contents())
    }

    /// The loaded credential document.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::CredentialsNotLoaded`] before the instance
    /// became ready.
    pub fn raw_credentials(&self) -> Result<CredentialDocument, InstanceError> {
        self.credentials
            .read()
            .map_err(|_| InstanceError::LockPoisoned)?
            .clone()
            .ok_or_else(|| InstanceError::CredentialsNotLoaded {
                name: self.name.clone(),
            })
    }

    /// Client configuration for `context`, with client-side throttling off.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::CredentialsNotLoaded`] before the instance
    /// became ready, or [`InstanceError::Credentials`] for an unknown
    /// context.
    pub fn client_config(&self, context: &str) -> Result<ClientConfig, InstanceError> {
        Ok(self
            .raw_credentials()?
            .client_config(context)?
            .with_qps(None))
    }

    /// Base context configuration tagged with `user_agent`.
    ///
    /// # Errors
    ///
    /// See [`ServiceInstance::client_config`].
    pub fn base_config(&self, user_agent: &str) -> Result<ClientConfig, InstanceError> {
        Ok(self.client_config(BASE_CONTEXT)?.with_user_agent(user_agent))
    }

    /// Shard context configuration tagged with `user_agent`.
    ///
    /// # Errors
    ///
    /// See [`ServiceInstance::client_config`].
    pub fn shard_config(&self, user_agent: &str) -> Result<ClientConfig, InstanceError> {
        Ok(self
            .client_config(SHARD_BASE_CONTEXT)?
            .with_user_agent(user_agent))
    }

    fn transition(&self, next: InstanceState) -> Result<(), InstanceError> {
        let mut state = self.state.lock().map_err(|_| InstanceError::LockPoisoned)?;
        *state = state.transition(next)?;
        debug!(instance = %self.name, state = %next, "instance state changed");
        Ok(())
    }

    fn exit_reason(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the server as a subprocess in its own process group, or as an
    /// in-process task when configured so.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] if the instance was already started or the
    /// process cannot be spawned. A spawn failure leaves the instance
    /// [`InstanceState::Failed`].
    pub fn start(
        &self,
        command: &ServerCommand,
        in_process: Option<&Arc<dyn InProcessServer>>,
    ) -> Result<(), InstanceError> {
        self.transition(InstanceState::Starting)?;
        let launched = match (self.run_in_process, in_process) {
            (true, Some(server)) => Ok(self.start_in_process(server.as_ref())),
            (true, None) => Err(InstanceError::NoInProcessServer {
                name: self.name.clone(),
            }),
            (false, _) => self.start_process(command),
        };
        match launched {
            Ok(launched) => {
                *self.launched.lock().map_err(|_| InstanceError::LockPoisoned)? = Some(launched);
                Ok(())
            },
            Err(err) => {
                self.mark_failed();
                error!(instance = %self.name, error = %err, "failed to start kiln-server");
                Err(err)
            },
        }
    }

    fn mark_failed(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition_to(InstanceState::Failed) {
            *state = InstanceState::Failed;
        }
    }

    fn start_process(&self, command: &ServerCommand) -> Result<Launched, InstanceError> {
        let (program, args) = command.command_line(&self.args);
        info!(
            instance = %self.name,
            command = %program.display(),
            args = ?args,
            "starting kiln-server"
        );
        let mut spawned = spawn(&program, &args)?;
        if let Some(stdout) = spawned.child.stdout.take() {
            tokio::spawn(self.logs.clone().pump(stdout));
        }
        if let Some(stderr) = spawned.child.stderr.take() {
            tokio::spawn(self.logs.clone().pump(stderr));
        }

        let monitor = self.monitor();
        let mut child = spawned.child;
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            };
            monitor.exited(reason);
        });
        Ok(Launched::Process { pgid: spawned.pid })
    }

    fn start_in_process(&self, server: &dyn InProcessServer) -> Launched {
        info!(instance = %self.name, "starting kiln-server in-process");
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let run = server
            .run(self.args.clone(), self.cancel.clone())
            .with_subscriber(subscriber);
        let task = tokio::spawn(run);

        let monitor = self.monitor();
        tokio::spawn(async move {
            let reason = match task.await {
                Ok(Ok(())) => "server returned".to_string(),
                Ok(Err(e)) => format!("server failed: {e:#}"),
                Err(e) => format!("server task failed: {e}"),
            };
            monitor.exited(reason);
        });
        Launched::InProcess
    }

    fn monitor(&self) -> ExitMonitor {
        ExitMonitor {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            exit: Arc::clone(&self.exit),
            logs: self.logs.clone(),
            filter: self.filter.clone(),
        }
    }

    /// Waits for credentials and a successful readiness probe.
    ///
    /// On failure the instance is marked failed.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] if credentials never load, the probe never
    /// passes within `timeout`, or the instance exits first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), InstanceError> {
        let result = self.until_exit(self.load_and_probe(timeout)).await;
        match &result {
            Ok(()) => {
                self.transition(InstanceState::Ready)?;
                info!(instance = %self.name, "kiln-server ready");
            },
            Err(err) => {
                self.mark_failed();
                error!(instance = %self.name, error = %err, "kiln-server never became ready");
            },
        }
        result
    }

    async fn load_and_probe(&self, timeout: Duration) -> Result<(), InstanceError> {
        let started = Instant::now();
        let document = CredentialLoader::new(PROBE_INTERVAL, timeout)
            .load_document(&self.credentials_path, BASE_CONTEXT, &self.cancel)
            .await?;
        {
            let mut credentials = self
                .credentials
                .write()
                .map_err(|_| InstanceError::LockPoisoned)?;
            if credentials.is_none() {
                *credentials = Some(document);
            }
        }

        let config = self.shard_config(&format!("kiln-fleet/{}", self.name))?;
        let client = http_client(&config)?;
        let url = config.url("readyz");
        let deadline = started + timeout;
        loop {
            let last_error = match probe(&client, &config, &url).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if Instant::now() >= deadline {
                return Err(InstanceError::Probe {
                    name: self.name.clone(),
                    waited: started.elapsed(),
                    last_error,
                });
            }
            debug!(instance = %self.name, error = %last_error, "not ready yet");
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    async fn until_exit<T>(
        &self,
        work: impl Future<Output = Result<T, InstanceError>>,
    ) -> Result<T, InstanceError> {
        let mut exit = self.exit.subscribe();
        tokio::select! {
            result = work => result,
            _ = exit.wait_for(Option::is_some) => Err(InstanceError::Exited {
                name: self.name.clone(),
                reason: self.exit_reason().unwrap_or_default(),
            }),
        }
    }

    /// Marks a ready instance as part of a running fleet.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::InvalidTransition`] unless the instance is
    /// ready.
    pub fn mark_running(&self) -> Result<(), InstanceError> {
        self.transition(InstanceState::Running)
    }

    /// Fetches `/metrics` and writes it to `<artifact_dir>/metrics.prom`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] if credentials are missing, the request
    /// fails, or the file cannot be written.
    pub async fn scrape_metrics(&self) -> Result<PathBuf, InstanceError> {
        let config = self.base_config(&format!("kiln-fleet/{}/metrics", self.name))?;
        let client = http_client(&config)?;
        let url = config.url("metrics");
        let mut request = client.get(&url);
        if let Some(token) = &config.token {
            request = request.bearer_auth(token);
        }
        let body = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| InstanceError::Http {
                url: url.clone(),
                source,
            })?
            .text()
            .await
            .map_err(|source| InstanceError::Http { url, source })?;
        let path = self.artifact_dir.join("metrics.prom");
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| InstanceError::io(&path, e))?;
        Ok(path)
    }

    /// Requests termination and waits up to `timeout` for the exit.
    ///
    /// Subprocesses receive SIGTERM on their whole process group; in-process
    /// instances are canceled. A forced kill is never sent.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::StopTimeout`] if the instance is still
    /// running after `timeout`, or the signaling error.
    pub async fn stop(&self, timeout: Duration) -> Result<(), InstanceError> {
        let stopping = {
            let mut state = self.state.lock().map_err(|_| InstanceError::LockPoisoned)?;
            if state.can_transition_to(InstanceState::Stopping) {
                *state = InstanceState::Stopping;
                true
            } else {
                false
            }
        };
        self.request_termination()?;

        let started = Instant::now();
        let launched = *self.launched.lock().map_err(|_| InstanceError::LockPoisoned)?;
        if launched.is_some() {
            let mut exit = self.exit.subscribe();
            if tokio::time::timeout(timeout, exit.wait_for(Option::is_some))
                .await
                .is_err()
            {
                return Err(InstanceError::StopTimeout {
                    name: self.name.clone(),
                    waited: started.elapsed(),
                });
            }
        }
        if stopping {
            self.transition(InstanceState::Stopped)?;
        }
        info!(instance = %self.name, waited = ?started.elapsed(), "kiln-server stopped");
        Ok(())
    }

    /// Cancels the instance and signals its process group without waiting.
    ///
    /// # Errors
    ///
    /// Returns the signaling error.
    pub fn request_termination(&self) -> Result<(), InstanceError> {
        self.cancel.cancel();
        let launched = *self.launched.lock().map_err(|_| InstanceError::LockPoisoned)?;
        if let Some(Launched::Process { pgid }) = launched {
            if self.exit_reason().is_none() {
                terminate_group(pgid)?;
            }
        }
        Ok(())
    }
}

/// Observes the end of an instance's process or task.
struct ExitMonitor {
    name: String,
    state: Arc<Mutex<InstanceState>>,
    cancel: CancellationToken,
    exit: Arc<watch::Sender<Option<String>>>,
    logs: LogSink,
    filter: LogFilter,
}

impl ExitMonitor {
    fn exited(self, reason: String) {
        let expected = self.cancel.is_cancelled();
        if !expected {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.can_transition_to(InstanceState::Failed) {
                *state = InstanceState::Failed;
            }
            drop(state);
            error!(
                instance = %self.name,
                reason = %reason,
                "kiln-server exited unexpectedly, logs:\n{}",
                self.filter.filter(&self.logs.contents())
            );
        } else {
            debug!(instance = %self.name, reason = %reason, "kiln-server exited");
        }
        self.exit.send_replace(Some(reason));
    }
}

fn http_client(config: &ClientConfig) -> Result<reqwest::Client, InstanceError> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|source| InstanceError::Http {
            url: config.server.clone(),
            source,
        })
}

async fn probe(client: &reqwest::Client, config: &ClientConfig, url: &str) -> Result<(), String> {
    let mut request = client.get(url);
    if let Some(token) = &config.token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("{status}: {}", body.trim()))
}

impl Drop for ServiceInstance {
    fn drop(&mut self) {
        if self.exit_reason().is_none() {
            if let Err(e) = self.request_termination() {
                warn!(instance = %self.name, error = %e, "failed to terminate kiln-server on drop");
            }
        }
    }
}
