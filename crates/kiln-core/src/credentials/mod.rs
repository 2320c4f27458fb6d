//! Multi-context credential documents.
//!
//! A running service writes a credential document next to its data so that
//! clients can find it:
//!
//! ```yaml
//! current-context: base
//! contexts:
//!   - name: base
//!     context:
//!       server: http://127.0.0.1:6443
//!       token: 2f6c...
//!   - name: shard-base
//!     context:
//!       server: http://127.0.0.1:6443
//!       token: 2f6c...
//! ```
//!
//! [`CredentialLoader`] waits for such a document to appear.

mod loader;

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::loader::{CredentialLoader, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
use crate::client::ClientConfig;

/// Context addressing the service as a whole.
pub const BASE_CONTEXT: &str = "base";

/// Context addressing the shard the service runs.
pub const SHARD_BASE_CONTEXT: &str = "shard-base";

/// Errors from reading, selecting, or waiting for credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The file does not exist yet.
    #[error("credential file {} does not exist", path.display())]
    NotFound {
        /// Path that was read.
        path: PathBuf,
    },

    /// The file could not be read or written.
    #[error("credential file {}: {source}", path.display())]
    Io {
        /// Path that was accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for this schema.
    #[error("invalid credential document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The requested context is absent.
    #[error("credential context {context:?} not found")]
    MissingContext {
        /// Requested context name.
        context: String,
    },

    /// The document parsed but is inconsistent.
    #[error("invalid credential document: {0}")]
    Invalid(String),

    /// No usable document appeared in time.
    #[error("timed out after {waited:?} waiting for credentials at {}", path.display())]
    Timeout {
        /// Path that was polled.
        path: PathBuf,
        /// Total time spent waiting.
        waited: Duration,
    },

    /// The wait was canceled.
    #[error("canceled while waiting for credentials at {}", path.display())]
    Canceled {
        /// Path that was polled.
        path: PathBuf,
    },
}

impl CredentialError {
    /// Whether the file simply has not been written yet.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is a plain timeout with no more specific cause.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Connection details stored under one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContextEntry {
    /// Base URL of the service.
    pub server: String,
    /// Bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A named context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name.
    pub name: String,
    /// Connection details.
    pub context: ContextEntry,
}

/// A parsed credential document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialDocument {
    /// Context used when none is named.
    #[serde(default)]
    pub current_context: String,
    /// Every context in the document.
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
}

impl CredentialDocument {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Parse`] for malformed YAML and
    /// [`CredentialError::Invalid`] for inconsistent contents.
    pub fn from_yaml(content: &str) -> Result<Self, CredentialError> {
        let document: Self = serde_yaml::from_str(content)?;
        document.validate()?;
        Ok(document)
    }

    /// Reads and parses the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] if the file is absent, otherwise
    /// any error from reading or [`CredentialDocument::from_yaml`].
    pub fn from_file(path: &Path) -> Result<Self, CredentialError> {
        let content = std::fs::read_to_string(path).map_err(|e| CredentialError::io(path, e))?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<(), CredentialError> {
        if self.contexts.is_empty() {
            return Err(CredentialError::Invalid("no contexts defined".to_string()));
        }
        let mut seen = HashSet::new();
        for named in &self.contexts {
            if !seen.insert(named.name.as_str()) {
                return Err(CredentialError::Invalid(format!(
                    "duplicate context {:?}",
                    named.name
                )));
            }
            if named.context.server.is_empty() {
                return Err(CredentialError::Invalid(format!(
                    "context {:?} has no server",
                    named.name
                )));
            }
        }
        if !self.current_context.is_empty() && !seen.contains(self.current_context.as_str()) {
            return Err(CredentialError::Invalid(format!(
                "current context {:?} is not defined",
                self.current_context
            )));
        }
        Ok(())
    }

    /// Looks up a context by name.
    #[must_use]
    pub fn context(&self, name: &str) -> Option<&ContextEntry> {
        self.contexts
            .iter()
            .find(|named| named.name == name)
            .map(|named| &named.context)
    }

    /// Builds a client configuration for context `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::MissingContext`] if there is no such
    /// context.
    pub fn client_config(&self, name: &str) -> Result<ClientConfig, CredentialError> {
        let entry = self
            .context(name)
            .ok_or_else(|| CredentialError::MissingContext {
                context: name.to_string(),
            })?;
        let config = ClientConfig::new(entry.server.clone());
        Ok(match &entry.token {
            Some(token) => config.with_token(token.clone()),
            None => config,
        })
    }

    /// Renders the document as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Parse`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, CredentialError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the document to `path` so readers never observe a partial
    /// file. Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if any filesystem step fails.
    pub fn write_atomic(&self, path: &Path) -> Result<(), CredentialError> {
        let rendered = self.to_yaml()?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| CredentialError::io(dir, e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| CredentialError::io(dir, e))?;
        tmp.write_all(rendered.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| CredentialError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| CredentialError::io(path, e.error))?;
        Ok(())
    }
}
