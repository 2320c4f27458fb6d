//! Polling credential loader.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CredentialDocument, CredentialError};
use crate::client::ClientConfig;

/// Default interval between attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default total wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Waits for a credential document to become readable.
///
/// A missing file means the producer has not written it yet and is retried
/// silently. Any other failure is remembered, and once the timeout elapses
/// the most recent such failure is returned instead of a bare timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialLoader {
    interval: Duration,
    timeout: Duration,
}

impl Default for CredentialLoader {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT)
    }
}

impl CredentialLoader {
    /// Creates a loader with explicit timing.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Polls `path` until it holds a valid document that defines `context`.
    ///
    /// The first attempt happens immediately.
    ///
    /// # Errors
    ///
    /// Returns the last non-missing-file error seen if the timeout elapses,
    /// [`CredentialError::Timeout`] if the file never appeared, or
    /// [`CredentialError::Canceled`] if `cancel` fires first.
    pub async fn load_document(
        &self,
        path: &Path,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<CredentialDocument, CredentialError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last_error: Option<CredentialError> = None;

        loop {
            match attempt(path, context).await {
                Ok(document) => return Ok(document),
                Err(err) if err.is_not_found() => {},
                Err(err) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %err,
                        "credentials not usable yet"
                    );
                    last_error = Some(err);
                },
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(last_error.unwrap_or_else(|| CredentialError::Timeout {
                    path: path.to_path_buf(),
                    waited: now - started,
                }));
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(CredentialError::Canceled { path: path.to_path_buf() });
                },
                () = tokio::time::sleep(self.interval.min(deadline - now)) => {},
            }
        }
    }

    /// Like [`CredentialLoader::load_document`], returning the selected
    /// context's client configuration.
    ///
    /// # Errors
    ///
    /// See [`CredentialLoader::load_document`].
    pub async fn load(
        &self,
        path: &Path,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<ClientConfig, CredentialError> {
        self.load_document(path, context, cancel)
            .await?
            .client_config(context)
    }
}

async fn attempt(path: &Path, context: &str) -> Result<CredentialDocument, CredentialError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CredentialError::io(path, e))?;
    let document = CredentialDocument::from_yaml(&content)?;
    document.client_config(context)?;
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = "current-context: base
contexts:
  - name: base
    context:
      server: http://127.0.0.1:6443
      token: t
";

    fn fast() -> CredentialLoader {
        CredentialLoader::new(Duration::from_millis(10), Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_file_appearing_later_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("admin.credentials");

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                CredentialDocument::from_yaml(DOCUMENT)
                    .unwrap()
                    .write_atomic(&path)
                    .unwrap();
            })
        };

        let config = fast()
            .load(&path, "base", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(config.token.as_deref(), Some("t"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_absent_file_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = fast()
            .load(&dir.path().join("absent"), "base", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_malformed_file_surfaces_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("admin.credentials");
        std::fs::write(&path, "contexts: [").unwrap();

        let err = fast()
            .load(&path, "base", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Parse(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_missing_context_surfaces() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("admin.credentials");
        std::fs::write(&path, DOCUMENT).unwrap();

        let err = fast()
            .load(&path, "shard-base", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::MissingContext { .. }));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CredentialLoader::default()
            .load(&dir.path().join("absent"), "base", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Canceled { .. }));
    }
}
