//! Service startup and shutdown sequencing.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_core::credentials::{
    ContextEntry, CredentialDocument, NamedContext, BASE_CONTEXT, SHARD_BASE_CONTEXT,
};
use kiln_core::launcher::ControlLoopLauncher;
use kiln_core::{ClientConfig, KilnConfig, LifecycleManager, SyncGates};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

use crate::feature_gates::Feature;
use crate::http::{self, AppState, AuditLog};
use crate::metrics::{HookPhase, ServerMetrics};
use crate::options::ServerOptions;
use crate::sources::SourceSet;
use crate::store::EmbeddedStore;
use crate::units::{register_units, QuotaAdmission};

/// Parses `args` (without the program name) and runs the service until
/// `shutdown` fires.
///
/// # Errors
///
/// Returns an error for unparsable arguments or any startup failure.
pub async fn run_from_args<I, T>(args: I, shutdown: CancellationToken) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let options = ServerOptions::try_from_args(args).context("invalid arguments")?;
    run(options, shutdown).await
}

/// Runs the service until `shutdown` fires.
///
/// On shutdown the pre-shutdown hooks run first, then every control loop is
/// canceled and given the configured grace period, and only then does the
/// HTTP listener stop.
///
/// # Errors
///
/// Returns an error if startup fails or the HTTP server stops on its own.
pub async fn run(options: ServerOptions, shutdown: CancellationToken) -> Result<()> {
    let config = match &options.config {
        Some(path) => KilnConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => KilnConfig::default(),
    };

    std::fs::create_dir_all(&options.root_directory).with_context(|| {
        format!(
            "failed to create root directory {}",
            options.root_directory.display()
        )
    })?;
    let store = EmbeddedStore::open(
        &options.root_directory,
        options.bind_address,
        options.embedded_store_client_port,
        options.embedded_store_peer_port,
        options.embedded_store_wal_size_bytes,
    )
    .context("failed to start embedded store")?;

    let listener =
        tokio::net::TcpListener::bind(SocketAddr::new(options.bind_address, options.secure_port))
            .await
            .context("failed to bind secure port")?;
    let addr = listener.local_addr().context("failed to read bound address")?;
    let token = uuid::Uuid::new_v4().simple().to_string();

    let gates = SyncGates::new();
    let lifecycle = Arc::new(LifecycleManager::new(gates.clone()));
    let metrics = ServerMetrics::new().context("failed to create metrics")?;
    let admission = QuotaAdmission::default();
    let sources = SourceSet::new(options.feature_gates.enabled(Feature::CacheReplication));
    let launcher = ControlLoopLauncher::new(
        ClientConfig::new(format!("http://{addr}")).with_token(token.clone()),
        &config,
    );
    register_units(
        &lifecycle,
        &launcher,
        &sources,
        &options.feature_gates,
        options.is_root_shard(),
        &metrics,
        &admission,
    )
    .context("failed to register control loops")?;

    let audit = match options.audit_log_path.as_deref() {
        Some(path) => Some(
            AuditLog::open(path)
                .await
                .context("failed to open audit log")?,
        ),
        None => None,
    };
    let state = Arc::new(AppState {
        token: token.clone(),
        lifecycle: Arc::clone(&lifecycle),
        supervisor: launcher.supervisor().clone(),
        metrics: metrics.clone(),
        admission,
        audit,
    });

    let http_shutdown = CancellationToken::new();
    let app = http::router(state, &options.shard_name);
    let mut server_task = tokio::spawn({
        let http_shutdown = http_shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await
        }
        .with_current_subscriber()
    });
    info!(
        addr = %addr,
        shard = %options.shard_name,
        store = %store.data_dir().display(),
        "kiln-server listening"
    );

    let credentials_path = options.credentials_path();
    write_credentials(&credentials_path, addr, &options.shard_name, &token)?;
    info!(path = %credentials_path.display(), "wrote credentials");

    let activation = lifecycle
        .run_activation_hooks()
        .context("failed to start activation hooks")?;
    let activation_task = tokio::spawn({
        let metrics = metrics.clone();
        async move {
            let report = activation.join().await;
            metrics.record_hooks(HookPhase::Activation, &report);
            info!(
                completed = report.completed().len(),
                canceled = report.canceled().len(),
                faulted = report.faulted().len(),
                "activation hooks finished"
            );
        }
        .with_current_subscriber()
    });

    sources.spawn_initial_load(options.root_directory.join("seed"));
    let sync_task = tokio::spawn({
        let interval = config.controllers.sync_poll_interval;
        let cancel = lifecycle.cancellation_token().clone();
        async move {
            if let Err(e) = sources.signal_when_synced(&gates, interval, &cancel).await {
                warn!(error = %e, "data sources never synced");
            }
        }
        .with_current_subscriber()
    });

    let early_exit = tokio::select! {
        () = shutdown.cancelled() => None,
        result = &mut server_task => Some(result),
    };
    info!("shutting down");

    let report = lifecycle.run_pre_shutdown_hooks().await;
    metrics.record_hooks(HookPhase::PreShutdown, &report);
    for name in report.faulted() {
        warn!(hook = name, "pre-shutdown hook faulted");
    }

    lifecycle.cancel();
    launcher.supervisor().cancel_all();
    if !launcher
        .supervisor()
        .wait_stopped(config.controllers.shutdown_grace)
        .await
    {
        warn!("continuing shutdown with control loops still running");
    }
    if let Err(e) = sync_task.await {
        error!(error = %e, "sync watcher task failed");
    }
    if let Err(e) = activation_task.await {
        error!(error = %e, "activation task failed");
    }

    http_shutdown.cancel();
    let served = match early_exit {
        Some(result) => {
            result.context("HTTP server task failed")??;
            anyhow::bail!("HTTP server stopped before shutdown was requested");
        },
        None => server_task.await.context("HTTP server task failed")?,
    };
    served.context("HTTP server error")?;
    drop(store);
    info!("kiln-server stopped");
    Ok(())
}

fn write_credentials(path: &Path, addr: SocketAddr, shard: &str, token: &str) -> Result<()> {
    let context = |server: String| ContextEntry {
        server,
        token: Some(token.to_string()),
    };
    let document = CredentialDocument {
        current_context: BASE_CONTEXT.to_string(),
        contexts: vec![
            NamedContext {
                name: BASE_CONTEXT.to_string(),
                context: context(format!("http://{addr}")),
            },
            NamedContext {
                name: SHARD_BASE_CONTEXT.to_string(),
                context: context(format!("http://{addr}/shards/{shard}")),
            },
        ],
    };
    document
        .write_atomic(path)
        .with_context(|| format!("failed to write credentials to {}", path.display()))
}
