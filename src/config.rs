//! Configuration file parser for `rookery.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FetcherConfig, DEFAULT_USER_AGENT};
use crate::util::UrlPolicy;
use crate::worker::WorkerConfig;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Struct
// ============================================================================

/// Process configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,

    /// Seconds between automatic refreshes. 0 = manual refresh only.
    /// A `refresh_rate` stored in the settings table takes precedence.
    pub refresh_interval_secs: u64,

    /// Maximum feeds fetched at the same time.
    pub worker_pool_size: usize,

    /// Bound on a whole feed request, redirects and body included.
    pub request_timeout_secs: u64,

    /// Bound on each favicon request.
    pub favicon_timeout_secs: u64,

    pub max_redirects: usize,

    pub max_feed_size_bytes: usize,

    pub user_agent: String,

    /// SEC: refuse feeds on loopback, private and link-local addresses.
    pub block_private_hosts: bool,

    /// Icons kept in memory for serving.
    pub icon_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("rookery.db"),
            refresh_interval_secs: 30 * 60,
            worker_pool_size: 4,
            request_timeout_secs: 30,
            favicon_timeout_secs: 10,
            max_redirects: 10,
            max_feed_size_bytes: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            block_private_hosts: false,
            icon_cache_size: 256,
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "database_path",
        "refresh_interval_secs",
        "worker_pool_size",
        "request_timeout_secs",
        "favicon_timeout_secs",
        "max_redirects",
        "max_feed_size_bytes",
        "user_agent",
        "block_private_hosts",
        "icon_cache_size",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse TOML config content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::debug!(
            database = %config.database_path.display(),
            refresh_interval_secs = config.refresh_interval_secs,
            workers = config.worker_pool_size,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn url_policy(&self) -> UrlPolicy {
        if self.block_private_hosts {
            UrlPolicy::strict()
        } else {
            UrlPolicy::default()
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_redirects: self.max_redirects,
            max_body_bytes: self.max_feed_size_bytes,
            user_agent: self.user_agent.clone(),
            url_policy: self.url_policy(),
        }
    }

    /// Worker settings, with the refresh interval given separately since a
    /// stored setting may override the file.
    pub fn worker_config(&self, refresh_interval: Duration) -> WorkerConfig {
        WorkerConfig {
            pool_size: self.worker_pool_size,
            refresh_interval,
            fetcher: self.fetcher_config(),
            favicon_timeout: Duration::from_secs(self.favicon_timeout_secs),
            icon_cache_size: self.icon_cache_size,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("rookery_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rookery.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.refresh_interval_secs, 1800);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_redirects, 10);
        assert!(!config.block_private_hosts);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/rookery_test_nonexistent_config.toml");
        assert_eq!(Config::load(path).unwrap(), Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n  \n  ");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let config = Config::parse("worker_pool_size = 8\n").unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.refresh_interval_secs, 1800);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/rookery/feeds.db"
refresh_interval_secs = 600
worker_pool_size = 2
request_timeout_secs = 15
favicon_timeout_secs = 5
max_redirects = 3
max_feed_size_bytes = 1048576
user_agent = "test-agent"
block_private_hosts = true
icon_cache_size = 16
"#;
        let (dir, path) = write_config("full", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/rookery/feeds.db"));
        assert_eq!(config.refresh_interval_secs, 600);

        let worker = config.worker_config(Duration::from_secs(60));
        assert_eq!(worker.pool_size, 2);
        assert_eq!(worker.refresh_interval, Duration::from_secs(60));
        assert_eq!(worker.favicon_timeout, Duration::from_secs(5));
        assert_eq!(worker.icon_cache_size, 16);
        assert_eq!(worker.fetcher.timeout, Duration::from_secs(15));
        assert_eq!(worker.fetcher.max_redirects, 3);
        assert_eq!(worker.fetcher.max_body_bytes, 1_048_576);
        assert_eq!(worker.fetcher.user_agent, "test-agent");
        assert_eq!(worker.fetcher.url_policy, UrlPolicy::strict());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::parse("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::parse("worker_pool_size = 3\nworkers = 9\n").unwrap();
        assert_eq!(config.worker_pool_size, 3);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::parse("worker_pool_size = \"many\"\n").is_err());
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
