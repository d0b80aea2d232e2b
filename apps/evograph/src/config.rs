//! # Configuration Module
//!
//! `evograph.toml` parsing plus `EVOGRAPH_*` environment overrides.
//!
//! ## Sections
//!
//! - `[server]` host, port, rate limit, CORS origins, API key
//! - `[storage]` backend (`memory` or `redb`) and database path
//! - `[runtime]` timeouts, snapshot cadence and retry policy
//! - `[conceptual]` dimensions, metric, weights and clustering
//! - `[logging]` output format and filter
//!
//! ## Environment Variables
//!
//! - `EVOGRAPH_API_KEY`: If set, requires Bearer token authentication
//! - `EVOGRAPH_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all
//! - `EVOGRAPH_RATE_LIMIT`: Requests per second (0 to disable)
//! - `EVOGRAPH_LOG_FORMAT`: `text` or `json`
//!
//! Environment values win over the file.

use crate::dispatch::RetryPolicy;
use evograph_core::{
    ClusterConfig, ConceptualSpace, EvographError, MetricRegistry, RedbEventStore, Session,
    SnapshotPolicy, StorageBackend,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file created by `evograph init`.
pub const CONFIG_FILE_NAME: &str = "evograph.toml";

/// Default rate limit, requests per second.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Default request body limit (2 MB).
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Requests per second, 0 disables rate limiting.
    pub rate_limit: u32,
    pub body_limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_origins: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rate_limit: DEFAULT_RATE_LIMIT,
            body_limit: DEFAULT_BODY_LIMIT,
            cors_origins: None,
            api_key: None,
        }
    }
}

impl ServerConfig {
    /// Overlay `EVOGRAPH_API_KEY`, `EVOGRAPH_CORS_ORIGINS` and
    /// `EVOGRAPH_RATE_LIMIT`.
    ///
    /// An empty API key disables authentication; an unparsable rate limit
    /// is ignored with a warning.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("EVOGRAPH_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(origins) = std::env::var("EVOGRAPH_CORS_ORIGINS") {
            self.cors_origins = Some(origins);
        }
        if let Ok(raw) = std::env::var("EVOGRAPH_RATE_LIMIT") {
            match raw.parse() {
                Ok(rps) => self.rate_limit = rps,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid EVOGRAPH_RATE_LIMIT"),
            }
        }
        self.api_key = self.api_key.filter(|k| !k.is_empty());
        self
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which event store backs the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    #[default]
    Redb,
}

impl std::str::FromStr for BackendKind {
    type Err = EvographError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "redb" => Ok(Self::Redb),
            other => Err(EvographError::Validation(format!(
                "unknown backend '{}': use memory or redb",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redb => write!(f, "redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: PathBuf::from("evograph.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Upper bound on one store append. Past it the outcome is unknown.
    pub append_timeout_ms: u64,
    /// Upper bound on one projection catch-up round.
    pub projection_timeout_ms: u64,
    /// Snapshot cadence in events, 0 disables snapshots.
    pub snapshot_every: u64,
    pub retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            append_timeout_ms: 5_000,
            projection_timeout_ms: 2_000,
            snapshot_every: evograph_core::primitives::DEFAULT_SNAPSHOT_EVERY,
            retry: RetryPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    #[must_use]
    pub fn projection_timeout(&self) -> Duration {
        Duration::from_millis(self.projection_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConceptualConfig {
    pub dimensions: usize,
    pub metric: String,
    /// Per-axis weights, required by `weighted_euclidean`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f32>>,
    pub epsilon: f32,
    pub min_points: usize,
}

impl Default for ConceptualConfig {
    fn default() -> Self {
        let clustering = ClusterConfig::default();
        Self {
            dimensions: 3,
            metric: "euclidean".to_string(),
            weights: None,
            epsilon: clustering.epsilon,
            min_points: clustering.min_points,
        }
    }
}

impl ConceptualConfig {
    /// Resolve the metric by name and validate it against the dimensions.
    pub fn space(&self) -> Result<ConceptualSpace, EvographError> {
        let metric = MetricRegistry::new().resolve(&self.metric, self.weights.as_deref())?;
        ConceptualSpace::new(self.dimensions, metric)
    }

    pub fn clustering(&self) -> Result<ClusterConfig, EvographError> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(EvographError::Validation(format!(
                "conceptual.epsilon must be a positive number, got {}",
                self.epsilon
            )));
        }
        if self.min_points == 0 {
            return Err(EvographError::Validation(
                "conceptual.min_points must be at least 1".to_string(),
            ));
        }
        Ok(ClusterConfig {
            epsilon: self.epsilon,
            min_points: self.min_points,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `text` or `json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// `tracing_subscriber::EnvFilter` directive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

// =============================================================================
// EVOGRAPH CONFIG
// =============================================================================

/// Complete application configuration.
///
/// Every section is optional; a missing file means all defaults.
///
/// # Example
///
/// ```toml
/// [storage]
/// backend = "redb"
/// path = "evograph.db"
///
/// [conceptual]
/// dimensions = 2
/// metric = "weighted_euclidean"
/// weights = [1.0, 0.5]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvographConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub conceptual: ConceptualConfig,
    pub logging: LoggingConfig,
}

impl EvographConfig {
    /// Parse TOML text and validate it eagerly.
    pub fn from_toml_str(content: &str) -> Result<Self, EvographError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EvographError::Validation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn from_file(path: &Path) -> Result<Self, EvographError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EvographError::IoError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if given, otherwise `evograph.toml` in the working
    /// directory if present, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, EvographError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(CONFIG_FILE_NAME);
                if default_path.is_file() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Check every section that can fail later at startup.
    pub fn validate(&self) -> Result<(), EvographError> {
        self.conceptual.space()?;
        self.conceptual.clustering()?;
        if let Some(format) = self.logging.format.as_deref()
            && format != "text"
            && format != "json"
        {
            return Err(EvographError::Validation(format!(
                "logging.format must be text or json, got '{}'",
                format
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::every(self.runtime.snapshot_every)
    }

    /// Open the configured store and bring projections up to date.
    pub fn open_session(&self) -> Result<Session, EvographError> {
        let backend = match self.storage.backend {
            BackendKind::Memory => StorageBackend::default(),
            BackendKind::Redb => {
                StorageBackend::Persistent(RedbEventStore::open(&self.storage.path)?)
            }
        };
        let session = Session::with_backend(
            backend,
            self.conceptual.space()?,
            self.conceptual.clustering()?,
        )
        .with_snapshot_policy(self.snapshot_policy());
        let replayed = session.catch_up()?;
        tracing::debug!(
            backend = %self.storage.backend,
            replayed,
            "Session opened"
        );
        Ok(session)
    }

    /// Commented default config written by `evograph init`.
    #[must_use]
    pub fn default_toml() -> &'static str {
        r#"# Evograph configuration

[server]
host = "127.0.0.1"
port = 8080
# Requests per second, 0 disables rate limiting
rate_limit = 100
body_limit = 2097152
# cors_origins = "http://localhost:3000"
# api_key = "change-me"          # or EVOGRAPH_API_KEY

[storage]
# "memory" (volatile) or "redb" (durable)
backend = "redb"
path = "evograph.db"

[runtime]
append_timeout_ms = 5000
projection_timeout_ms = 2000
# Snapshot every N events, 0 disables
snapshot_every = 100

[runtime.retry]
max_retries = 3
base_delay_ms = 25
max_delay_ms = 1000

[conceptual]
dimensions = 3
# euclidean, manhattan, chebyshev or weighted_euclidean
metric = "euclidean"
# weights = [1.0, 1.0, 1.0]
epsilon = 1.0
min_points = 3

[logging]
# format = "json"
# filter = "evograph=debug,evograph_core=debug"
"#
    }

    /// Write the default config unless the file exists and `force` is off.
    pub fn write_default(path: &Path, force: bool) -> Result<(), EvographError> {
        if path.exists() && !force {
            return Err(EvographError::Validation(format!(
                "Config file '{}' already exists. Use --force to overwrite.",
                path.display()
            )));
        }
        std::fs::write(path, Self::default_toml()).map_err(|e| {
            EvographError::IoError(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_matches_defaults() {
        let parsed = EvographConfig::from_toml_str(EvographConfig::default_toml())
            .expect("template parses");
        assert_eq!(parsed, EvographConfig::default());
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let parsed = EvographConfig::from_toml_str("").expect("parse");
        assert_eq!(parsed, EvographConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let parsed = EvographConfig::from_toml_str(
            "[storage]\nbackend = \"memory\"\n\n[runtime.retry]\nmax_retries = 7\n",
        )
        .expect("parse");
        assert_eq!(parsed.storage.backend, BackendKind::Memory);
        assert_eq!(parsed.runtime.retry.max_retries, 7);
        assert_eq!(parsed.server.port, 8080);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = EvographConfig::from_toml_str("[server]\nprot = 1\n");
        assert!(matches!(result, Err(EvographError::Validation(_))));
    }

    #[test]
    fn test_cosine_rejected_at_load() {
        let result = EvographConfig::from_toml_str("[conceptual]\nmetric = \"cosine\"\n");
        assert!(matches!(result, Err(EvographError::InvalidMetric { .. })));
    }

    #[test]
    fn test_weighted_metric_needs_matching_weights() {
        let ok = EvographConfig::from_toml_str(
            "[conceptual]\ndimensions = 2\nmetric = \"weighted_euclidean\"\nweights = [1.0, 2.0]\n",
        );
        assert!(ok.is_ok());

        let short = EvographConfig::from_toml_str(
            "[conceptual]\ndimensions = 3\nmetric = \"weighted_euclidean\"\nweights = [1.0, 2.0]\n",
        );
        assert!(short.is_err());
    }

    #[test]
    fn test_bad_clustering_rejected() {
        assert!(EvographConfig::from_toml_str("[conceptual]\nepsilon = 0.0\n").is_err());
        assert!(EvographConfig::from_toml_str("[conceptual]\nmin_points = 0\n").is_err());
    }

    #[test]
    fn test_bad_log_format_rejected() {
        assert!(EvographConfig::from_toml_str("[logging]\nformat = \"xml\"\n").is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("memory".parse::<BackendKind>().ok(), Some(BackendKind::Memory));
        assert_eq!("redb".parse::<BackendKind>().ok(), Some(BackendKind::Redb));
        assert!("file".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_open_memory_session() {
        let mut config = EvographConfig::default();
        config.storage.backend = BackendKind::Memory;
        let session = config.open_session().expect("session");
        assert!(!session.is_persistent());
    }

    #[test]
    fn test_open_redb_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EvographConfig::default();
        config.storage.path = dir.path().join("test.db");
        let session = config.open_session().expect("session");
        assert!(session.is_persistent());
    }

    #[test]
    fn test_write_default_refuses_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        EvographConfig::write_default(&path, false).expect("first write");
        assert!(EvographConfig::write_default(&path, false).is_err());
        EvographConfig::write_default(&path, true).expect("forced write");
        let loaded = EvographConfig::load(Some(&path)).expect("load");
        assert_eq!(loaded, EvographConfig::default());
    }
}
