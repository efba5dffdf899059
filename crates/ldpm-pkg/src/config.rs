//! Client configuration (`config.toml`).
//!
//! Values come from, in increasing priority: built-in defaults, the TOML file,
//! then `LDPM_*` environment variables. The CLI applies its own flags last.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Registry used when nothing else is configured.
pub const DEFAULT_REGISTRY: &str = "https://registry.standardanalytics.io";

/// Configuration filename inside the platform config directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding [`Config::registry`].
pub const REGISTRY_ENV: &str = "LDPM_REGISTRY";

/// Environment variable overriding [`Config::cache_dir`].
pub const CACHE_DIR_ENV: &str = "LDPM_CACHE_DIR";

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by the registry client, the resolver and the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Base URL of the registry.
    pub registry: String,
    /// Directory holding the durable package cache.
    pub cache_dir: PathBuf,
    /// User agent for HTTP requests.
    pub user_agent: String,
    /// HTTP timeout in seconds.
    pub timeout_secs: u64,
    /// Upper bound on registry fetches in flight at once.
    pub max_concurrent_fetches: usize,
    /// JSON-LD `@context` attached to rendered catalogs.
    pub context_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            cache_dir: default_cache_dir(),
            user_agent: format!("ldpm/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 60,
            max_concurrent_fetches: 8,
            context_url: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LDPM_REGISTRY` and `LDPM_CACHE_DIR` from the process environment.
    #[must_use]
    pub fn from_env(self) -> Self {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    #[must_use]
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(registry) = lookup(REGISTRY_ENV).filter(|v| !v.is_empty()) {
            self.registry = registry;
        }
        if let Some(cache_dir) = lookup(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(cache_dir);
        }
        self
    }

    /// Check values that would otherwise fail deep inside a fetch.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.registry.starts_with("http://") || self.registry.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "registry '{}' must be an http(s) URL",
                self.registry
            )));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "max-concurrent-fetches must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeout-secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Registry base URL without a trailing slash.
    #[must_use]
    pub fn registry_url(&self) -> &str {
        self.registry.trim_end_matches('/')
    }

    /// The JSON-LD context for catalogs, derived from the registry if unset.
    #[must_use]
    pub fn context_url(&self) -> String {
        self.context_url
            .clone()
            .unwrap_or_else(|| format!("{}/contexts/datapackage.jsonld", self.registry_url()))
    }

    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ldpm").join(CONFIG_FILE))
    }
}

/// Platform cache directory for ldpm, falling back to a relative `.cache`.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("ldpm")
}
