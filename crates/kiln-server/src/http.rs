//! HTTP surface: liveness, readiness and metrics, plus the audit log.
//!
//! | Path | Auth | Purpose |
//! |------|------|---------|
//! | `/livez` | none | process is up |
//! | `/readyz` | bearer | gates signaled, hooks settled, admission open |
//! | `/metrics` | bearer | Prometheus text exposition |
//!
//! Every route is also served under `/shards/<shard>`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{MatchedPath, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use kiln_core::launcher::LoopSupervisor;
use kiln_core::lifecycle::HookStatus;
use kiln_core::LifecycleManager;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::metrics::ServerMetrics;
use crate::units::QuotaAdmission;

/// Prometheus text exposition content type.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Append-only JSON-lines request log.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    ts: chrono::DateTime<chrono::Utc>,
    method: &'a str,
    path: &'a str,
    status: u16,
    user_agent: Option<&'a str>,
}

impl AuditLog {
    /// Opens `path` for appending, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Appends one line. The write is flushed before returning, so a line
    /// is on disk once its request has been answered.
    async fn record(&self, record: &AuditRecord<'_>) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode audit record");
                return;
            },
        };
        line.push(b'\n');
        let mut file = self.file.lock().await;
        let written = match file.write_all(&line).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "failed to write audit record");
        }
    }
}

/// State shared by every handler.
#[derive(Debug)]
pub struct AppState {
    /// Bearer token required by authenticated routes.
    pub token: String,
    /// Lifecycle manager whose gates and hooks back `/readyz`.
    pub lifecycle: Arc<LifecycleManager>,
    /// Running control loops.
    pub supervisor: LoopSupervisor,
    /// Exported collectors.
    pub metrics: ServerMetrics,
    /// Quota admission switch.
    pub admission: QuotaAdmission,
    /// Request log, if enabled.
    pub audit: Option<AuditLog>,
}

/// Builds the router for `shard`.
pub fn router(state: Arc<AppState>, shard: &str) -> Router {
    Router::new()
        .merge(routes())
        .nest(&format!("/shards/{shard}"), routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            audit_middleware,
        ))
        .with_state(state)
}

fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/livez", get(livez_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|provided| provided.as_bytes().ct_eq(token.as_bytes()).into())
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "unauthorized\n").into_response()
}

async fn livez_handler() -> &'static str {
    "ok"
}

async fn readyz_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, &state.token) {
        return unauthorized();
    }
    let verbose = query.contains_key("verbose");
    let report = ReadinessReport::collect(&state);
    let status = if report.ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    if report.ready() && !verbose {
        return (status, "ok").into_response();
    }
    (status, report.render(verbose)).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.token) {
        return unauthorized();
    }
    state
        .metrics
        .set_active_workers(&state.supervisor.active_workers());
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}

async fn audit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |m| m.as_str().to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = next.run(req).await;
    let status = response.status().as_u16();

    state.metrics.http_request_completed(&route, status);
    if let Some(audit) = &state.audit {
        audit
            .record(&AuditRecord {
                ts: chrono::Utc::now(),
                method: &method,
                path: &path,
                status,
                user_agent: user_agent.as_deref(),
            })
            .await;
    }
    response
}

/// Result of the readiness checks.
#[derive(Debug)]
struct ReadinessReport {
    checks: Vec<(&'static str, Result<(), String>)>,
    failed_hooks: Vec<(String, HookStatus)>,
}

impl ReadinessReport {
    fn collect(state: &AppState) -> Self {
        let gates = state.lifecycle.gates();
        let gate_check = |signaled: bool| {
            if signaled {
                Ok(())
            } else {
                Err("not synced".to_string())
            }
        };
        let pending = state.lifecycle.pending_activation_hooks();
        let hooks = if pending.is_empty() {
            Ok(())
        } else {
            Err(format!("waiting on {}", pending.join(", ")))
        };
        let admission = if state.admission.is_open() {
            Ok(())
        } else {
            Err("closed".to_string())
        };

        let failed_hooks = state
            .lifecycle
            .hook_statuses()
            .into_iter()
            .filter(|(_, status)| matches!(status, HookStatus::Failed | HookStatus::Canceled))
            .collect();

        Self {
            checks: vec![
                ("required-sources", gate_check(gates.required.is_signaled())),
                ("optional-sources", gate_check(gates.optional.is_signaled())),
                ("activation-hooks", hooks),
                ("quota-admission", admission),
            ],
            failed_hooks,
        }
    }

    fn ready(&self) -> bool {
        self.checks.iter().all(|(_, result)| result.is_ok())
    }

    fn render(&self, verbose: bool) -> String {
        let mut body = String::new();
        for (name, result) in &self.checks {
            match result {
                Ok(()) => {
                    let _ = writeln!(body, "[+]{name} ok");
                },
                Err(reason) => {
                    let _ = writeln!(body, "[-]{name} failed: {reason}");
                },
            }
        }
        if verbose {
            for (hook, status) in &self.failed_hooks {
                let _ = writeln!(body, "[!]{hook} {status:?}");
            }
        }
        if self.ready() {
            body.push_str("readyz check passed\n");
        } else {
            body.push_str("readyz check failed\n");
        }
        body
    }
}
