use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Time-related constants
// =============================================================================

/// Timeout for metadata fetch operations in milliseconds (30 seconds)
pub const FETCH_TIMEOUT_MS: u64 = 30_000;

/// Timeout for artifact downloads and checkouts in milliseconds (2 minutes)
pub const DOWNLOAD_TIMEOUT_MS: u64 = 120_000;

/// Base delay between retries of a retryable fetch (linear backoff)
pub const RETRY_BACKOFF_MS: u64 = 200;

// =============================================================================
// Resource limits
// =============================================================================

/// Number of concurrent fetches allowed per resolve/install
pub const DEFAULT_WORKERS: usize = 8;

/// Number of additional attempts after a retryable fetch failure
pub const DEFAULT_RETRIES: u32 = 2;

// =============================================================================
// Project layout
// =============================================================================

pub const MANIFEST_FILE: &str = "depot.toml";
pub const LOCK_FILE: &str = "depot.lock";
pub const MODULES_DIR: &str = "depot_modules";

/// Schema version written into every lock file
pub const LOCKFILE_VERSION: u32 = 1;

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.depot.dev";

/// Top-level configuration loaded from `config.json`
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub registry: RegistryConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    /// Short names expanded before a package spec is parsed (`http` -> `depot-http`)
    pub aliases: BTreeMap<String, String>,
}

/// Registry endpoint configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    pub url: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REGISTRY_URL.to_string(),
        }
    }
}

/// Network behavior shared by every source
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub workers: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: FETCH_TIMEOUT_MS,
            download_timeout_ms: DOWNLOAD_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based), growing linearly
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Worker pool size, never zero
    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }
}

/// Artifact cache configuration
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Overrides the machine-global cache root
    pub dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when the file does not exist.
    /// `DEPOT_REGISTRY` overrides the registry URL.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                serde_json::from_str::<Config>(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if let Ok(url) = std::env::var("DEPOT_REGISTRY")
            && !url.is_empty()
        {
            config.registry.url = url;
        }

        Ok(config)
    }

    /// Cache root: explicit config, then `DEPOT_CACHE_DIR`, then the XDG cache directory
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache.dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("DEPOT_CACHE_DIR")
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        cache_dir()
    }
}

/// Returns the path to the configuration file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depot")
        .join("config.json")
}

/// Returns the machine-global cache directory.
/// Uses $XDG_CACHE_HOME/depot if XDG_CACHE_HOME is set,
/// otherwise falls back to ~/.cache/depot,
/// or ./.depot-cache if neither is available.
pub fn cache_dir() -> PathBuf {
    cache_dir_with_env(std::env::var("XDG_CACHE_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the data directory for depot.
/// Uses $XDG_DATA_HOME/depot if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/depot,
/// or ./depot if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    data_dir().join("depot.log")
}

fn cache_dir_with_env(xdg_cache_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    match xdg_cache_home
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".cache")))
    {
        Some(dir) => dir.join("depot"),
        None => PathBuf::from(".depot-cache"),
    }
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("depot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_from_partial_object_uses_defaults_for_missing_fields() {
        let result = serde_json::from_value::<Config>(json!({
            "fetch": {
                "timeoutMs": 1000
            }
        }))
        .unwrap();

        assert_eq!(result.fetch.timeout_ms, 1000);
        assert_eq!(result.fetch.retries, DEFAULT_RETRIES);
        assert_eq!(result.registry, RegistryConfig::default());
        assert!(result.aliases.is_empty());
    }

    #[test]
    fn config_from_full_object_parses_all_fields() {
        let result = serde_json::from_value::<Config>(json!({
            "registry": { "url": "http://localhost:4873" },
            "fetch": {
                "timeoutMs": 5000,
                "downloadTimeoutMs": 9000,
                "retries": 0,
                "workers": 2
            },
            "cache": { "dir": "/tmp/depot-cache" },
            "aliases": { "http": "depot-http" }
        }))
        .unwrap();

        assert_eq!(
            result,
            Config {
                registry: RegistryConfig {
                    url: "http://localhost:4873".to_string()
                },
                fetch: FetchConfig {
                    timeout_ms: 5000,
                    download_timeout_ms: 9000,
                    retries: 0,
                    retry_backoff_ms: RETRY_BACKOFF_MS,
                    workers: 2,
                },
                cache: CacheConfig {
                    dir: Some(PathBuf::from("/tmp/depot-cache"))
                },
                aliases: BTreeMap::from([("http".to_string(), "depot-http".to_string())]),
            }
        );
    }

    #[test]
    fn load_returns_defaults_when_file_is_missing() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(&temp_dir.path().join("config.json")).unwrap();

        assert_eq!(config.fetch, FetchConfig::default());
    }

    #[test]
    fn load_reports_invalid_json() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn workers_is_never_zero() {
        let fetch = FetchConfig {
            workers: 0,
            ..FetchConfig::default()
        };
        assert_eq!(fetch.workers(), 1);
    }

    #[test]
    fn cache_dir_with_env_uses_xdg_cache_home_when_set() {
        let path = cache_dir_with_env(
            Some("/tmp/test-cache".to_string()),
            Some(PathBuf::from("/home/user")),
        );

        assert_eq!(path, PathBuf::from("/tmp/test-cache/depot"));
    }

    #[test]
    fn cache_dir_with_env_falls_back_to_home_cache() {
        let path = cache_dir_with_env(None, Some(PathBuf::from("/home/user")));

        assert_eq!(path, PathBuf::from("/home/user/.cache/depot"));
    }

    #[test]
    fn cache_dir_with_env_falls_back_to_current_dir_when_no_dirs_available() {
        let path = cache_dir_with_env(None, None);
        assert_eq!(path, PathBuf::from(".depot-cache"));
    }

    #[test]
    fn data_dir_with_env_uses_xdg_data_home_when_set() {
        let path = data_dir_with_env(
            Some("/tmp/test-data".to_string()),
            Some(PathBuf::from("/home/user")),
        );

        assert_eq!(path, PathBuf::from("/tmp/test-data/depot"));
    }

    #[test]
    fn data_dir_with_env_falls_back_to_home_local_share() {
        let path = data_dir_with_env(None, Some(PathBuf::from("/home/user")));

        assert_eq!(path, PathBuf::from("/home/user/.local/share/depot"));
    }
}
