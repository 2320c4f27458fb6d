//! Shared connection configuration handed to control loops.

use serde::{Deserialize, Serialize};

/// User agent every client starts from before a unit stamps its own name.
pub const DEFAULT_USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));

/// Connection settings for talking to the service.
///
/// Units never share one instance: each gets a copy tagged through
/// [`ClientConfig::with_user_agent`] so requests can be attributed to the
/// unit that issued them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the service, e.g. `http://127.0.0.1:6443`.
    pub server: String,

    /// Bearer token, if the endpoint requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Client-side request rate limit. `None` disables throttling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qps: Option<u32>,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl ClientConfig {
    /// Creates an unauthenticated config for `server`.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: None,
            user_agent: default_user_agent(),
            qps: None,
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the client-side rate limit.
    #[must_use]
    pub const fn with_qps(mut self, qps: Option<u32>) -> Self {
        self.qps = qps;
        self
    }

    /// Returns a copy whose user agent carries `tag` as a suffix
    /// (`kiln/0.1.0/namespace-controller`).
    #[must_use]
    pub fn with_user_agent(&self, tag: &str) -> Self {
        let mut copy = self.clone();
        copy.user_agent = format!("{}/{tag}", self.user_agent);
        copy
    }

    /// Joins `path` onto the server URL.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.server.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
