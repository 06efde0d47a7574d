//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `platform` - Permission and location sensor traits supplied by the host
//! - `simulated` - Scripted platform used for replay runs and tests
//! - `evaluation` - HTTP client for the geofence evaluation endpoint
//! - `token` - Access token fetch and caching provider
//! - `geocoding` - Forward and reverse geocoding with cache tiers
//! - `notify_channel` - Typed channel for user-visible events
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod evaluation;
pub mod geocoding;
pub mod notify_channel;
pub mod platform;
pub mod prometheus;
pub mod simulated;
pub mod token;

// Re-export commonly used types
pub use evaluation::{EvaluationClient, HttpEvaluationClient};
pub use geocoding::GeocodingClient;
pub use notify_channel::{
    create_notification_channel, NotificationSender, NotificationSink, TrackingNotice, UserEvent,
};
pub use platform::{LocationSensor, PermissionApi, WatchOptions};
pub use simulated::{ScriptedPermissions, ScriptedSensor};
pub use token::{AccessTokenProvider, HttpTokenSource, TokenSource};
