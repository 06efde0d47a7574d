//! Error taxonomy
//!
//! None of these are fatal to the host: permission and watch failures become
//! user-visible notices, evaluation and token failures are logged and the last
//! known-good state is kept, and corrupt cache data is downgraded to a miss.

use thiserror::Error;

/// Failures starting or running the location watch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    /// User declined or the platform forbids location access
    #[error("location permission denied")]
    PermissionDenied,

    /// Sensor or transport error on the subscription
    #[error("location watch failed: {0}")]
    WatchFailure(String),
}

/// Errors reported by the platform location sensor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("position unavailable")]
    PositionUnavailable,

    #[error("timed out waiting for a position")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl From<SensorError> for TrackingError {
    fn from(e: SensorError) -> Self {
        match e {
            SensorError::PermissionDenied => TrackingError::PermissionDenied,
            other => TrackingError::WatchFailure(other.to_string()),
        }
    }
}

/// Network or server failure on the geofence evaluation call
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("evaluation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("evaluation endpoint returned status {0}")]
    Status(u16),

    #[error("malformed evaluation response: {0}")]
    Decode(String),
}

/// Token endpoint unavailable or malformed
#[derive(Error, Debug)]
pub enum TokenFetchError {
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint returned status {0}")]
    Status(u16),

    #[error("token response missing `token` field")]
    MissingToken,
}

/// Persisted cache data could not be read back
#[derive(Error, Debug)]
pub enum CacheReadError {
    #[error("corrupt cache data: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("cache store unreadable: {0}")]
    Store(#[from] StoreError),
}

/// Storage backend failure
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Forward or reverse geocoding failure
#[derive(Error, Debug)]
pub enum GeocodingError {
    #[error(transparent)]
    Token(#[from] TokenFetchError),

    #[error("geocoding request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("geocoding provider returned status {0}")]
    Status(u16),

    #[error("malformed geocoding response: {0}")]
    Decode(String),

    #[error("invalid geocoding url: {0}")]
    Url(String),
}
