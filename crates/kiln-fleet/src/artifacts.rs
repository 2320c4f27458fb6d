//! Artifact snapshots written at teardown.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::ArtifactError;

/// An object snapshot to be written as YAML.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// API group; empty means `core`.
    pub group: String,
    /// Object kind.
    pub kind: String,
    /// Object name.
    pub name: String,
    /// Logical scope (e.g. workspace path), if any.
    pub scope: Option<String>,
    /// Namespace, if any.
    pub namespace: Option<String>,
    /// Object body.
    pub body: serde_yaml::Value,
}

impl Artifact {
    /// Snapshot of `object` with the given identity.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Render`] if `object` cannot be represented
    /// as YAML.
    pub fn new<T: Serialize>(
        group: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        object: &T,
    ) -> Result<Self, ArtifactError> {
        Ok(Self {
            group: group.into(),
            kind: kind.into(),
            name: name.into(),
            scope: None,
            namespace: None,
            body: serde_yaml::to_value(object)?,
        })
    }

    /// Sets the logical scope.
    #[must_use]
    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Relative file path: `[<scope>/][<namespace>/]<group>_<kind>-<name>.yaml`.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for part in [&self.scope, &self.namespace].into_iter().flatten() {
            if !part.is_empty() {
                path.push(sanitize(part));
            }
        }
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        path.push(sanitize(&format!("{group}_{}-{}.yaml", self.kind, self.name)));
        path
    }

    /// Writes the snapshot under `dir` and returns the file path.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] if the name is empty or writing fails.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ArtifactError> {
        if self.name.is_empty() {
            return Err(ArtifactError::EmptyName);
        }
        let path = dir.join(self.relative_path());
        let rendered = serde_yaml::to_string(&self.body)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ArtifactError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, rendered).map_err(|source| ArtifactError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// Colons are invalid in file names on some filesystems.
fn sanitize(part: &str) -> String {
    part.replace(':', "_")
}

/// Deferred artifact producer, run once at teardown.
pub type ArtifactProducer =
    Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Artifact>> + Send>;

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_relative_path_layout() {
        let body = BTreeMap::from([("spec", "x")]);
        let artifact = Artifact::new("", "ConfigMap", "settings", &body)
            .unwrap()
            .in_scope("root:org:team")
            .in_namespace("default");
        assert_eq!(
            artifact.relative_path(),
            PathBuf::from("root_org_team/default/core_ConfigMap-settings.yaml")
        );

        let artifact = Artifact::new("tenancy.kiln.dev", "Workspace", "a:b", &body).unwrap();
        assert_eq!(
            artifact.relative_path(),
            PathBuf::from("tenancy.kiln.dev_Workspace-a_b.yaml")
        );
    }

    #[test]
    fn test_write_to_creates_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifact =
            Artifact::new("apis.kiln.dev", "Export", "billing", &BTreeMap::from([("a", 1)]))
                .unwrap()
                .in_scope("root");
        let path = artifact.write_to(dir.path()).unwrap();
        assert!(path.ends_with("root/apis.kiln.dev_Export-billing.yaml"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a: 1\n");
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = Artifact::new("", "Thing", "", &1).unwrap();
        assert!(matches!(artifact.write_to(dir.path()), Err(ArtifactError::EmptyName)));
    }
}
