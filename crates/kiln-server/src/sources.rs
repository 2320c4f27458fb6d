//! The service's data sources and the watcher that signals the sync gates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::launcher::wait_for_sources_synced;
use kiln_core::readiness::{GateError, SyncGates};
use kiln_core::source::{DataSource, InMemorySource};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

/// Sources every shard loads.
pub const MANDATORY_SOURCES: &[&str] = &[
    "namespaces",
    "workspaces",
    "schemas",
    "exports",
    "bindings",
    "quotas",
    "identities",
];

/// Sources loaded only with `CacheReplication`.
pub const OPTIONAL_SOURCES: &[&str] = &["replicated-schemas", "replicated-exports"];

/// The named data sources of one service.
#[derive(Debug, Clone)]
pub struct SourceSet {
    mandatory: BTreeMap<&'static str, Arc<InMemorySource>>,
    optional: BTreeMap<&'static str, Arc<InMemorySource>>,
}

impl SourceSet {
    /// Creates unsynced sources; optional ones only if `with_optional`.
    #[must_use]
    pub fn new(with_optional: bool) -> Self {
        let build = |names: &[&'static str]| {
            names
                .iter()
                .map(|name| (*name, Arc::new(InMemorySource::new(*name))))
                .collect()
        };
        Self {
            mandatory: build(MANDATORY_SOURCES),
            optional: if with_optional {
                build(OPTIONAL_SOURCES)
            } else {
                BTreeMap::new()
            },
        }
    }

    /// Looks up a source by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<InMemorySource>> {
        self.mandatory
            .get(name)
            .or_else(|| self.optional.get(name))
            .cloned()
    }

    /// Looks up several sources as trait objects, failing on the first
    /// unknown name.
    ///
    /// # Errors
    ///
    /// Returns the unknown name.
    pub fn resolve(&self, names: &[&str]) -> Result<Vec<Arc<dyn DataSource>>, String> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .map(|s| s as Arc<dyn DataSource>)
                    .ok_or_else(|| (*name).to_string())
            })
            .collect()
    }

    fn all(&self) -> impl Iterator<Item = &Arc<InMemorySource>> {
        self.mandatory.values().chain(self.optional.values())
    }

    fn as_dyn(sources: &BTreeMap<&'static str, Arc<InMemorySource>>) -> Vec<Arc<dyn DataSource>> {
        sources
            .values()
            .map(|s| Arc::clone(s) as Arc<dyn DataSource>)
            .collect()
    }

    /// Starts the initial load of every source.
    ///
    /// Each source reads `<seed_dir>/<name>.yaml` (a map of key to value)
    /// if present and then reports synced. Namespaces always contain
    /// `default` and `kiln-system`.
    pub fn spawn_initial_load(&self, seed_dir: PathBuf) {
        for source in self.all() {
            let source = Arc::clone(source);
            let seed_dir = seed_dir.clone();
            tokio::spawn(async move {
                if source.name() == "namespaces" {
                    source.upsert("default", "{}");
                    source.upsert("kiln-system", "{}");
                }
                match load_seed(&seed_dir, source.name()).await {
                    Ok(items) => {
                        for (key, value) in items {
                            source.upsert(key, value);
                        }
                    },
                    Err(err) => {
                        warn!(
                            source = source.name(),
                            error = %err,
                            "ignoring unreadable seed file"
                        );
                    },
                }
                source.mark_synced();
                debug!(source = source.name(), items = source.len(), "initial load complete");
            }
            .with_current_subscriber());
        }
    }

    /// Signals `gates.required` once every mandatory source has synced and
    /// `gates.optional` once every optional source has. Without optional
    /// sources both are signaled together.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Canceled`] if `cancel` fires first.
    pub async fn signal_when_synced(
        &self,
        gates: &SyncGates,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        wait_for_sources_synced(&Self::as_dyn(&self.mandatory), interval, cancel).await?;
        gates.required.signal();
        info!("required data sources synced");

        if !self.optional.is_empty() {
            wait_for_sources_synced(&Self::as_dyn(&self.optional), interval, cancel).await?;
            info!("optional data sources synced");
        }
        gates.optional.signal();
        Ok(())
    }
}

async fn load_seed(dir: &Path, name: &str) -> Result<BTreeMap<String, String>, String> {
    let path = dir.join(format!("{name}.yaml"));
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => {
            serde_yaml::from_str(&content).map_err(|e| format!("{}: {e}", path.display()))
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(format!("{}: {err}", path.display())),
    }
}
