//! Client configuration and fixed backend routes.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Backend origin used when `TRADEDESK_BACKEND_URL` is unset.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Versioned prefix every API call is made under.
pub const API_PREFIX: &str = "/api/v1";

/// Fixed per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Route the user is sent to when the session cannot be renewed.
pub const LOGIN_ROUTE: &str = "/login";

/// Session refresh endpoint, relative to the API base.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Liveness endpoint. Lives on the backend origin, outside the API prefix.
pub const HEALTH_PATH: &str = "/health";

pub const BACKEND_URL_ENV: &str = "TRADEDESK_BACKEND_URL";
pub const SESSION_FILE_ENV: &str = "TRADEDESK_SESSION_FILE";

/// Settings for an [`ApiClient`](crate::ApiClient).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Backend origin, e.g. `http://localhost:8000`
    pub backend_url: String,
    /// Prefix joined onto the origin for API calls
    pub api_prefix: String,
    /// Request timeout
    pub timeout: Duration,
    /// Login route reported when the session expires
    pub login_route: String,
    /// File backing the session store (`None` keeps it in memory)
    pub session_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            api_prefix: API_PREFIX.to_string(),
            timeout: REQUEST_TIMEOUT,
            login_route: LOGIN_ROUTE.to_string(),
            session_file: None,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// `TRADEDESK_BACKEND_URL` sets the backend origin and
    /// `TRADEDESK_SESSION_FILE` the session file; the session file otherwise
    /// defaults to `~/.tradedesk/session.json`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let backend_url = non_empty(BACKEND_URL_ENV)
            .map(|url| url.trim().to_string())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let session_file = non_empty(SESSION_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_session_path);

        Self {
            backend_url,
            session_file: Some(session_file),
            ..Self::default()
        }
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_login_route(mut self, route: impl Into<String>) -> Self {
        self.login_route = route.into();
        self
    }

    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    /// Keep session data in memory only.
    pub fn in_memory(mut self) -> Self {
        self.session_file = None;
        self
    }

    /// Origin without a trailing slash.
    pub fn origin(&self) -> &str {
        self.backend_url.trim_end_matches('/')
    }

    /// Base URL all API paths are joined onto.
    pub fn api_base(&self) -> String {
        format!(
            "{}{}",
            self.origin(),
            normalize_path(self.api_prefix.trim_end_matches('/'))
        )
    }

    /// Absolute URL for an API path.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base(), normalize_path(path))
    }

    /// Absolute URL of the liveness endpoint.
    pub fn health_url(&self) -> String {
        format!("{}{}", self.origin(), HEALTH_PATH)
    }
}

/// Default session file: `~/.tradedesk/session.json`.
pub fn default_session_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".tradedesk/session.json"))
        .unwrap_or_else(|| PathBuf::from("session.json"))
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
