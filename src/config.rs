//! Server configuration loaded from `FLUXGATE_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of cached assignments.
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Default interval between background snapshot refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind host (from FLUXGATE_HOST)
    pub host: String,
    /// HTTP port (from FLUXGATE_PORT)
    pub port: u16,
    /// SQLite database file (from FLUXGATE_DATABASE). `None` uses the platform data dir.
    pub database_path: Option<PathBuf>,
    /// Environment id or name used when a request names none (from FLUXGATE_DEFAULT_ENVIRONMENT)
    pub default_environment: Option<String>,
    /// Assignment cache size; 0 disables caching (from FLUXGATE_CACHE_CAPACITY)
    pub cache_capacity: usize,
    /// Background refresh period; zero disables it (from FLUXGATE_REFRESH_INTERVAL_SECS)
    pub refresh_interval: Duration,
    /// API key guarding the admin API (from FLUXGATE_ADMIN_API_KEY)
    pub admin_api_key: Option<String>,
    /// Allowed CORS origins, comma-separated (from FLUXGATE_CORS_ORIGINS)
    pub cors_origins: Option<Vec<String>>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back
    /// to defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                    None
                }
            }
        };

        Self {
            host: lookup("FLUXGATE_HOST").unwrap_or(defaults.host),
            port: parsed("FLUXGATE_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(defaults.port),
            database_path: lookup("FLUXGATE_DATABASE").map(PathBuf::from),
            default_environment: lookup("FLUXGATE_DEFAULT_ENVIRONMENT")
                .filter(|s| !s.trim().is_empty()),
            cache_capacity: parsed("FLUXGATE_CACHE_CAPACITY")
                .map(|v| v as usize)
                .unwrap_or(defaults.cache_capacity),
            refresh_interval: parsed("FLUXGATE_REFRESH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
            admin_api_key: lookup("FLUXGATE_ADMIN_API_KEY").filter(|s| !s.is_empty()),
            cors_origins: lookup("FLUXGATE_CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect()),
        }
    }

    /// Local development defaults: no auth, no background refresh.
    pub fn for_testing() -> Self {
        Self {
            refresh_interval: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            database_path: None,
            default_environment: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            admin_api_key: None,
            cors_origins: None,
        }
    }
}
