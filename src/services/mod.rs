//! Services - tracking state and notification sequencing
//!
//! This module contains the core business logic services:
//! - `permission` - Location permission queries and change subscription
//! - `watch_controller` - Location watch lifecycle and per-sample evaluation
//! - `evaluator` - Sequenced geofence evaluation and membership state
//! - `dispatcher` - Timed, cancellable notification envelope sequences

pub mod dispatcher;
pub mod evaluator;
pub mod permission;
pub mod watch_controller;

// Re-export commonly used types
pub use dispatcher::NotificationDispatchSequencer;
pub use evaluator::{EvaluationOutcome, GeofenceEvaluator};
pub use permission::{PermissionNegotiator, PermissionSubscription};
pub use watch_controller::{LocationWatchController, WatchDeps, WatchState};
