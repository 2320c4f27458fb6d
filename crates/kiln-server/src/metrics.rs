//! Prometheus metrics for the service.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `kiln_hooks_total` | Counter | `phase`, `outcome` |
//! | `kiln_reconciles_total` | Counter | `unit`, `result` |
//! | `kiln_control_loop_workers` | Gauge | `unit` |
//! | `kiln_http_requests_total` | Counter | `route`, `status` |

use std::collections::HashMap;
use std::fmt;

use kiln_core::lifecycle::HookReport;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Metrics failures.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Building, registering or gathering a collector failed.
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// Which hook phase a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Hooks run once serving starts.
    Activation,
    /// Hooks run before the process exits.
    PreShutdown,
}

impl HookPhase {
    const fn label(self) -> &'static str {
        match self {
            Self::Activation => "activation",
            Self::PreShutdown => "pre-shutdown",
        }
    }
}

/// Every collector the service exports, plus the registry they live in.
///
/// Cheap to clone; clones share the underlying collectors.
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,
    hooks: IntCounterVec,
    reconciles: IntCounterVec,
    workers: IntGaugeVec,
    http_requests: IntCounterVec,
}

impl fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMetrics").finish_non_exhaustive()
    }
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, MetricsError> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl ServerMetrics {
    /// Registers every collector with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if a collector is malformed.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let hooks = counter(
            &registry,
            "kiln_hooks_total",
            "Lifecycle hooks finished, by phase and outcome",
            &["phase", "outcome"],
        )?;
        let reconciles = counter(
            &registry,
            "kiln_reconciles_total",
            "Reconcile calls by unit and result",
            &["unit", "result"],
        )?;
        let http_requests = counter(
            &registry,
            "kiln_http_requests_total",
            "HTTP requests by matched route and status",
            &["route", "status"],
        )?;
        let workers = IntGaugeVec::new(
            Opts::new("kiln_control_loop_workers", "Workers of running control loops"),
            &["unit"],
        )?;
        registry.register(Box::new(workers.clone()))?;

        Ok(Self {
            registry,
            hooks,
            reconciles,
            workers,
            http_requests,
        })
    }

    /// Counts every outcome in `report`.
    pub fn record_hooks(&self, phase: HookPhase, report: &HookReport) {
        for outcome in report.outcomes.values() {
            self.hooks
                .with_label_values(&[phase.label(), outcome.as_str()])
                .inc();
        }
    }

    /// Hooks of `phase` recorded with `outcome`.
    #[must_use]
    pub fn hook_count(&self, phase: HookPhase, outcome: &str) -> u64 {
        self.hooks.with_label_values(&[phase.label(), outcome]).get()
    }

    /// Counts one reconcile call.
    pub fn reconcile_completed(&self, unit: &str, result: &str) {
        self.reconciles.with_label_values(&[unit, result]).inc();
    }

    /// Reconcile calls recorded for `unit` with `result`.
    #[must_use]
    pub fn reconcile_count(&self, unit: &str, result: &str) -> u64 {
        self.reconciles.with_label_values(&[unit, result]).get()
    }

    /// Replaces the worker gauge with `active`.
    pub fn set_active_workers(&self, active: &HashMap<String, usize>) {
        self.workers.reset();
        for (unit, workers) in active {
            self.workers
                .with_label_values(&[unit.as_str()])
                .set(i64::try_from(*workers).unwrap_or(i64::MAX));
        }
    }

    /// Counts one HTTP request. `route` is the matched route template, so
    /// the label set stays bounded.
    pub fn http_request_completed(&self, route: &str, status: u16) {
        let status = status.to_string();
        self.http_requests
            .with_label_values(&[route, status.as_str()])
            .inc();
    }

    /// Everything registered, in the text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if gathering fails.
    pub fn render(&self) -> Result<String, MetricsError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::lifecycle::HookOutcome;

    use super::*;

    #[test]
    fn test_hook_outcomes_counted_per_phase() {
        let metrics = ServerMetrics::new().unwrap();

        let mut report = HookReport::default();
        report
            .outcomes
            .insert("kiln-start-a".into(), HookOutcome::Completed);
        report.outcomes.insert(
            "kiln-start-b".into(),
            HookOutcome::Faulted {
                error: "boom".into(),
            },
        );
        metrics.record_hooks(HookPhase::Activation, &report);

        assert_eq!(metrics.hook_count(HookPhase::Activation, "completed"), 1);
        assert_eq!(metrics.hook_count(HookPhase::Activation, "faulted"), 1);
        assert_eq!(metrics.hook_count(HookPhase::PreShutdown, "completed"), 0);
    }

    #[test]
    fn test_worker_gauge_is_replaced() {
        let metrics = ServerMetrics::new().unwrap();

        metrics.set_active_workers(&HashMap::from([("namespace-controller".to_string(), 10)]));
        let output = metrics.render().unwrap();
        assert!(output.contains("kiln_control_loop_workers{unit=\"namespace-controller\"} 10"));

        metrics.set_active_workers(&HashMap::new());
        assert!(!metrics.render().unwrap().contains("unit=\"namespace-controller\""));
    }

    #[test]
    fn test_clones_share_collectors() {
        let metrics = ServerMetrics::new().unwrap();
        let clone = metrics.clone();
        clone.reconcile_completed("quota-controller", "success");
        clone.reconcile_completed("quota-controller", "success");
        assert_eq!(metrics.reconcile_count("quota-controller", "success"), 2);
        assert!(format!("{metrics:?}").starts_with("ServerMetrics"));
    }
}
