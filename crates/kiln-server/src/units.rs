//! The service's control-loop units and their activation hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::launcher::{ControlLoopLauncher, LoopSpec, ReconcileError, Reconciler};
use kiln_core::lifecycle::{activation_hook_name, HookError, LifecycleError, LifecycleManager};
use kiln_core::{ClientConfig, GateRequirement};
use tracing::{debug, info};

use crate::feature_gates::{Feature, FeatureGates};
use crate::metrics::ServerMetrics;
use crate::sources::SourceSet;

/// Source names a binding or export controller must see synced together.
const API_SOURCES: &[&str] = &["schemas", "exports", "bindings"];

/// Static description of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitDef {
    /// Unit name.
    pub name: &'static str,
    /// Worker count unless the configuration overrides it.
    pub default_workers: usize,
    /// Gates the hook waits on.
    pub requirement: GateRequirement,
    /// Sources feeding the loop's queue.
    pub sources: &'static [&'static str],
    /// Sources that must all be synced before launch, beyond the gates.
    pub wait_for: &'static [&'static str],
    /// Feature the unit depends on.
    pub feature: Option<Feature>,
    /// Whether the root shard skips it.
    pub skip_on_root_shard: bool,
}

/// Every unit the service knows about.
pub const UNITS: &[UnitDef] = &[
    UnitDef {
        name: "namespace-controller",
        default_workers: 10,
        requirement: GateRequirement::Required,
        sources: &["namespaces"],
        wait_for: &[],
        feature: None,
        skip_on_root_shard: false,
    },
    UnitDef {
        name: "workspace-scheduler",
        default_workers: 2,
        requirement: GateRequirement::Required,
        sources: &["workspaces"],
        wait_for: &[],
        feature: None,
        skip_on_root_shard: false,
    },
    UnitDef {
        name: "binding-controller",
        default_workers: 2,
        requirement: GateRequirement::Required,
        sources: &["bindings"],
        wait_for: API_SOURCES,
        feature: None,
        skip_on_root_shard: false,
    },
    UnitDef {
        name: "export-controller",
        default_workers: 2,
        requirement: GateRequirement::Required,
        sources: &["exports"],
        wait_for: API_SOURCES,
        feature: None,
        skip_on_root_shard: false,
    },
    UnitDef {
        name: "quota-controller",
        default_workers: 2,
        requirement: GateRequirement::Required,
        sources: &["quotas"],
        wait_for: &[],
        feature: None,
        skip_on_root_shard: false,
    },
    UnitDef {
        name: "identity-controller",
        default_workers: 1,
        requirement: GateRequirement::Required,
        sources: &["identities"],
        wait_for: &[],
        feature: None,
        skip_on_root_shard: true,
    },
    UnitDef {
        name: "replication-controller",
        default_workers: 2,
        requirement: GateRequirement::RequiredAndOptional,
        sources: &["replicated-schemas", "replicated-exports"],
        wait_for: &[],
        feature: Some(Feature::CacheReplication),
        skip_on_root_shard: false,
    },
];

/// Name of the pre-shutdown hook that stops quota admission.
pub const QUOTA_ADMISSION_HOOK: &str = "quota-admission";

/// Shared on/off switch for quota admission.
#[derive(Debug, Clone)]
pub struct QuotaAdmission {
    open: Arc<AtomicBool>,
}

impl Default for QuotaAdmission {
    fn default() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl QuotaAdmission {
    /// Whether new quota requests are admitted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Stops admitting quota requests.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Reconciler that counts every key it sees.
struct CountingReconciler {
    unit: &'static str,
    client: ClientConfig,
    metrics: ServerMetrics,
}

#[async_trait]
impl Reconciler for CountingReconciler {
    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        debug!(
            unit = self.unit,
            key = %key,
            user_agent = %self.client.user_agent,
            "reconciled"
        );
        self.metrics.reconcile_completed(self.unit, "success");
        Ok(())
    }
}

/// Units that run on this shard with these features.
#[must_use]
pub fn enabled_units(features: &FeatureGates, root_shard: bool) -> Vec<&'static UnitDef> {
    UNITS
        .iter()
        .filter(|unit| unit.feature.map_or(true, |f| features.enabled(f)))
        .filter(|unit| !(unit.skip_on_root_shard && root_shard))
        .collect()
}

/// Registers one activation hook per enabled unit, plus the quota
/// admission pre-shutdown hook.
///
/// # Errors
///
/// Returns the first registration error.
pub fn register_units(
    lifecycle: &LifecycleManager,
    launcher: &ControlLoopLauncher,
    sources: &SourceSet,
    features: &FeatureGates,
    root_shard: bool,
    metrics: &ServerMetrics,
    admission: &QuotaAdmission,
) -> Result<(), LifecycleError> {
    for unit in enabled_units(features, root_shard) {
        let launcher = launcher.clone();
        let sources = sources.clone();
        let metrics = metrics.clone();
        lifecycle.register_activation_hook(activation_hook_name(unit.name), move |ctx| async move {
            ctx.wait_for(unit.requirement).await?;

            if !unit.wait_for.is_empty() {
                let required = sources.resolve(unit.wait_for).map_err(|name| {
                    HookError::failed(format!("{} waits on unknown source {name}", unit.name))
                })?;
                launcher
                    .wait_for_sources(&required, ctx.cancellation_token())
                    .await?;
            }

            let feeds = sources.resolve(unit.sources).map_err(|name| {
                HookError::failed(format!("{} reads unknown source {name}", unit.name))
            })?;
            let workers = launcher.workers_for(unit.name, Some(unit.default_workers));
            let reconciler = CountingReconciler {
                unit: unit.name,
                client: launcher.client_for(unit.name),
                metrics,
            };
            launcher.launch(
                LoopSpec {
                    unit: unit.name.to_string(),
                    workers,
                    sources: feeds,
                    reconciler: Arc::new(reconciler),
                },
                ctx.cancellation_token(),
            )?;
            info!(unit = unit.name, workers, "control loop started");
            Ok(())
        })?;
    }

    let admission = admission.clone();
    lifecycle.register_pre_shutdown_hook(QUOTA_ADMISSION_HOOK, move || async move {
        admission.close();
        info!("quota admission closed");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(units: &[&UnitDef]) -> Vec<&'static str> {
        units.iter().map(|u| u.name).collect()
    }

    #[test]
    fn test_root_shard_skips_identity_controller() {
        let units = enabled_units(&FeatureGates::default(), true);
        assert!(!names(&units).contains(&"identity-controller"));
        assert!(!names(&units).contains(&"replication-controller"));

        let units = enabled_units(&FeatureGates::default(), false);
        assert!(names(&units).contains(&"identity-controller"));
    }

    #[test]
    fn test_cache_replication_adds_replication_controller() {
        let features = FeatureGates::default().with(Feature::CacheReplication, true);
        let units = enabled_units(&features, true);
        let replication = units
            .iter()
            .find(|u| u.name == "replication-controller")
            .unwrap();
        assert_eq!(replication.requirement, GateRequirement::RequiredAndOptional);
    }

    #[test]
    fn test_every_unit_source_exists() {
        let sources = SourceSet::new(true);
        for unit in UNITS {
            assert!(sources.resolve(unit.sources).is_ok(), "{}", unit.name);
            assert!(sources.resolve(unit.wait_for).is_ok(), "{}", unit.name);
        }
    }

    #[test]
    fn test_quota_admission_closes() {
        let admission = QuotaAdmission::default();
        assert!(admission.is_open());
        admission.clone().close();
        assert!(!admission.is_open());
    }
}
