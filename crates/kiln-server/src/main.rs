//! kiln-server binary.

use std::fs::OpenOptions;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_server::ServerOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let options = ServerOptions::parse();
    init_tracing(&options)?;

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone())?;
    kiln_server::run(options, shutdown).await
}

/// Logs to `--log-file` when given, stdout otherwise. An unparsable
/// `--log-level` falls back to `info`.
fn init_tracing(options: &ServerOptions) -> Result<()> {
    let filter = EnvFilter::try_new(&options.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let file = options
        .log_file
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))
        })
        .transpose()?;

    let stdout_layer = file.is_none().then(fmt::layer);
    let file_layer = file.map(|file| fmt::layer().with_writer(file).with_ansi(false));
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Cancels `shutdown` on the first SIGTERM or SIGINT.
fn cancel_on_signal(shutdown: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!(signal = name, "shutting down");
        shutdown.cancel();
    });
    Ok(())
}
