//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Identifier included in logs and metrics labels
    #[serde(default = "default_service_id")]
    pub id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { id: default_service_id() }
    }
}

fn default_service_id() -> String {
    "neighborhood-watch".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_evaluation_url")]
    pub url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { url: default_evaluation_url(), timeout_ms: default_http_timeout_ms() }
    }
}

fn default_evaluation_url() -> String {
    "http://localhost:3000/api/geofence/evaluate".to_string()
}

fn default_http_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_url")]
    pub url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { url: default_token_url(), timeout_ms: default_http_timeout_ms() }
    }
}

fn default_token_url() -> String {
    "http://localhost:3000/api/mapbox-token".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodingConfig {
    #[serde(default = "default_geocoding_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    /// Default proximity bias as [lng, lat]
    #[serde(default)]
    pub proximity: Option<[f64; 2]>,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoding_base_url(),
            timeout_ms: default_http_timeout_ms(),
            proximity: None,
        }
    }
}

fn default_geocoding_base_url() -> String {
    "https://api.mapbox.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_high_accuracy")]
    pub high_accuracy: bool,
    /// Per-sample timeout
    #[serde(default = "default_watch_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum age of a cached platform fix
    #[serde(default = "default_maximum_age_ms")]
    pub maximum_age_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            high_accuracy: default_high_accuracy(),
            timeout_ms: default_watch_timeout_ms(),
            maximum_age_ms: default_maximum_age_ms(),
        }
    }
}

fn default_high_accuracy() -> bool {
    true
}

fn default_watch_timeout_ms() -> u64 {
    10_000
}

fn default_maximum_age_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory for the durable store
    #[serde(default = "default_cache_dir")]
    pub dir: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_geocode_ttl_days")]
    pub geocode_ttl_days: u64,
    #[serde(default = "default_reverse_capacity")]
    pub reverse_capacity: usize,
    #[serde(default = "default_reverse_ttl_secs")]
    pub reverse_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            token_ttl_secs: default_token_ttl_secs(),
            geocode_ttl_days: default_geocode_ttl_days(),
            reverse_capacity: default_reverse_capacity(),
            reverse_ttl_secs: default_reverse_ttl_secs(),
        }
    }
}

fn default_cache_dir() -> String {
    "cache".to_string()
}

fn default_token_ttl_secs() -> u64 {
    SECS_PER_DAY
}

fn default_geocode_ttl_days() -> u64 {
    30
}

fn default_reverse_capacity() -> usize {
    100
}

fn default_reverse_ttl_secs() -> u64 {
    60 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub geocoding: GeocodingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_id: String,
    evaluation_url: String,
    evaluation_timeout_ms: u64,
    token_url: String,
    token_timeout_ms: u64,
    geocoding_base_url: String,
    geocoding_timeout_ms: u64,
    geocoding_proximity: Option<(f64, f64)>,
    watch_high_accuracy: bool,
    watch_timeout_ms: u64,
    watch_maximum_age_ms: u64,
    cache_dir: PathBuf,
    token_ttl_secs: u64,
    geocode_ttl_days: u64,
    reverse_capacity: usize,
    reverse_ttl_secs: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            service_id: toml_config.service.id,
            evaluation_url: toml_config.evaluation.url,
            evaluation_timeout_ms: toml_config.evaluation.timeout_ms,
            token_url: toml_config.token.url,
            token_timeout_ms: toml_config.token.timeout_ms,
            geocoding_base_url: toml_config.geocoding.base_url,
            geocoding_timeout_ms: toml_config.geocoding.timeout_ms,
            geocoding_proximity: toml_config.geocoding.proximity.map(|[lng, lat]| (lng, lat)),
            watch_high_accuracy: toml_config.watch.high_accuracy,
            watch_timeout_ms: toml_config.watch.timeout_ms,
            watch_maximum_age_ms: toml_config.watch.maximum_age_ms,
            cache_dir: PathBuf::from(toml_config.cache.dir),
            token_ttl_secs: toml_config.cache.token_ttl_secs,
            geocode_ttl_days: toml_config.cache.geocode_ttl_days,
            reverse_capacity: toml_config.cache.reverse_capacity,
            reverse_ttl_secs: toml_config.cache.reverse_ttl_secs,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Determine config file path from an explicit argument or the environment
    pub fn resolve_config_path(arg: Option<&str>) -> String {
        if let Some(path) = arg {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn evaluation_url(&self) -> &str {
        &self.evaluation_url
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    pub fn geocoding_base_url(&self) -> &str {
        &self.geocoding_base_url
    }

    pub fn geocoding_timeout(&self) -> Duration {
        Duration::from_millis(self.geocoding_timeout_ms)
    }

    /// Default proximity bias as (lng, lat)
    pub fn geocoding_proximity(&self) -> Option<(f64, f64)> {
        self.geocoding_proximity
    }

    pub fn watch_high_accuracy(&self) -> bool {
        self.watch_high_accuracy
    }

    pub fn watch_timeout_ms(&self) -> u64 {
        self.watch_timeout_ms
    }

    pub fn watch_maximum_age_ms(&self) -> u64 {
        self.watch_maximum_age_ms
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn geocode_ttl(&self) -> Duration {
        Duration::from_secs(self.geocode_ttl_days * SECS_PER_DAY)
    }

    pub fn reverse_capacity(&self) -> usize {
        self.reverse_capacity
    }

    pub fn reverse_ttl(&self) -> Duration {
        Duration::from_secs(self.reverse_ttl_secs)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
