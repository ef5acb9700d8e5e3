//! Archive configuration
//!
//! Resolution order (later wins):
//! 1. Built-in defaults
//! 2. `[archive]` table of `~/.chatgrep/config.toml`
//! 3. `CHATGREP_URL` environment variable
//! 4. Command-line flags (applied by the binary)

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Archive queried when nothing else is configured.
pub const DEFAULT_URL: &str = "http://localhost:8025";

/// Environment variable overriding the archive URL.
pub const URL_ENV: &str = "CHATGREP_URL";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings for talking to one log archive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL of the archive
    #[serde(default = "default_url")]
    pub url: String,
    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Connect timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_user_agent() -> String {
    format!("chatgrep/{} (log-searcher)", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    archive: ArchiveConfig,
}

impl ArchiveConfig {
    /// `~/.chatgrep/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".chatgrep")
            .join("config.toml")
    }

    /// Parse the `[archive]` table out of a config file's contents.
    pub fn from_toml(content: &str) -> Result<Self> {
        let parsed: ConfigFile = toml::from_str(content)?;
        parsed.archive.validated()
    }

    /// Load from `path`, falling back to defaults when the file is missing.
    ///
    /// # Errors
    /// Returns `Error::Io` if the file exists but cannot be read, and
    /// `Error::Toml`/`Error::Config` if its contents are invalid.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        debug!("Loaded config from {:?}", path);
        Self::from_toml(&content)
    }

    /// Load the default file, then apply environment overrides.
    pub fn load_default() -> Result<Self> {
        Ok(Self::load(&Self::default_path())?.with_env_overrides())
    }

    /// Apply `CHATGREP_URL` if it is set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(URL_ENV) {
            if !url.is_empty() {
                debug!("Using archive URL from {}", URL_ENV);
                self.url = url;
            }
        }
        self
    }

    fn validated(self) -> Result<Self> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "archive url must be http(s): {:?}",
                self.url
            )));
        }
        Ok(self)
    }
}
