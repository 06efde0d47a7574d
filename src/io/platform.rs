//! Platform location APIs
//!
//! The host platform supplies permission state and position samples. These
//! traits are the only surface the services touch.

use crate::domain::types::{LocationSample, PermissionState};
use crate::infra::config::Config;
use crate::infra::error::SensorError;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Options for a continuous position subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub enable_high_accuracy: bool,
    /// Per-sample timeout
    pub timeout_ms: u64,
    /// The platform may answer from a fix at most this old
    pub maximum_age_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { enable_high_accuracy: true, timeout_ms: 10_000, maximum_age_ms: 30_000 }
    }
}

impl WatchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enable_high_accuracy: config.watch_high_accuracy(),
            timeout_ms: config.watch_timeout_ms(),
            maximum_age_ms: config.watch_maximum_age_ms(),
        }
    }
}

pub type SensorReading = Result<LocationSample, SensorError>;

/// A live position subscription handed out by the sensor
#[derive(Debug)]
pub struct SensorWatch {
    /// Platform-side identifier used to clear the watch
    pub id: u64,
    pub readings: mpsc::Receiver<SensorReading>,
}

#[async_trait]
pub trait PermissionApi: Send + Sync {
    /// Current state without prompting the user
    async fn query(&self) -> PermissionState;

    /// Resolve a `prompt` state by triggering an actual location request
    async fn prompt(&self) -> PermissionState;

    /// Register for permission-change notifications
    fn subscribe(&self) -> watch::Receiver<PermissionState>;
}

pub trait LocationSensor: Send + Sync {
    fn watch_position(&self, options: &WatchOptions) -> Result<SensorWatch, SensorError>;

    fn clear_watch(&self, id: u64);
}
