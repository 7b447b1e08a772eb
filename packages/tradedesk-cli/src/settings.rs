//! CLI settings file and argument parsing helpers.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tradedesk_core::config::{default_session_path, DEFAULT_BACKEND_URL};
use tradedesk_core::Config;

/// Contents of `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend origin, e.g. `https://api.tradedesk.example`
    pub backend_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Session store file
    pub session_file: Option<PathBuf>,
    /// Inactivity before a session counts as expired, in minutes
    pub session_timeout_minutes: Option<u64>,
}

impl Settings {
    /// Platform config location, e.g. `~/.config/tradedesk/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tradedesk", "tradedesk")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load settings from `path`, or from the default location.
    ///
    /// A missing default file yields empty settings; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from_path(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }

    /// Session inactivity timeout.
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_minutes.map(minutes)
    }

    /// Build the client configuration.
    ///
    /// Values given on the command line (or through their environment
    /// variables) win over the settings file.
    pub fn to_config(&self, backend_url: Option<String>, session_file: Option<PathBuf>) -> Config {
        let backend_url = backend_url
            .or_else(|| self.backend_url.clone())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let session_file = session_file
            .or_else(|| self.session_file.clone())
            .unwrap_or_else(default_session_path);

        let mut config = Config::default()
            .with_backend_url(backend_url)
            .with_session_file(session_file);
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Duration of `count` minutes, capped instead of overflowing.
pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

/// Parse a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("expected NAME:VALUE, got {raw:?}");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("header name is empty in {raw:?}");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Parse a `key=value` query argument.
pub fn parse_query(raw: &str) -> Result<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected KEY=VALUE, got {raw:?}");
    };
    if key.is_empty() {
        bail!("query key is empty in {raw:?}");
    }
    Ok((key.to_string(), value.to_string()))
}
