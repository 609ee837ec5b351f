// Sync server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Individual modules receive their settings from here rather
// than reading the environment themselves.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Raw updates appended to a document's log before the persistence binding
/// consolidates them into one full-state record.
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 400;

/// Core sync server configuration.
///
/// Constructed via [`SyncConfig::from_env`] which reads environment variables
/// and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for bearer credentials.
    pub jwt_secret: String,
    /// Path of the sqlite update-log database.
    pub update_log_path: PathBuf,
    /// Raw updates per document before compaction.
    pub compaction_threshold: u64,
    /// Log filter directive (e.g. `info`, `apiforge_syncd=debug`).
    pub log_filter: String,
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `APIFORGE_SYNCD_HOST` | `0.0.0.0` |
    /// | `APIFORGE_SYNCD_PORT` | `8080` |
    /// | `APIFORGE_SYNCD_JWT_SECRET` | dev-only placeholder |
    /// | `APIFORGE_SYNCD_UPDATE_LOG_PATH` | `apiforge-update-log.db` |
    /// | `APIFORGE_SYNCD_COMPACTION_THRESHOLD` | `400` |
    /// | `APIFORGE_SYNCD_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("APIFORGE_SYNCD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("APIFORGE_SYNCD_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("APIFORGE_SYNCD_JWT_SECRET")
            .unwrap_or_else(|_| "apiforge_local_development_jwt_secret_32_chars".into());

        let update_log_path = env("APIFORGE_SYNCD_UPDATE_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("apiforge-update-log.db"));

        let compaction_threshold = env("APIFORGE_SYNCD_COMPACTION_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|threshold| *threshold > 0)
            .unwrap_or(DEFAULT_COMPACTION_THRESHOLD);

        let log_filter = env("APIFORGE_SYNCD_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, jwt_secret, update_log_path, compaction_threshold, log_filter }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "apiforge_local_development_jwt_secret_32_chars"
    }
}
