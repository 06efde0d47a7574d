//! Domain models - location, membership and notification types
//!
//! This module contains the canonical data types used throughout the system:
//! - `LocationSample` - a fix from the platform sensor
//! - `GeofenceEvaluationResult` - membership and deals for one sample
//! - `NotificationEnvelope` - a scheduled user-visible notification
//! - `GeocodeResult` / `ReverseGeocodeResult` - geocoding lookups

pub mod notification;
pub mod types;

pub use notification::{plan_envelopes, EnvelopeKind, EnvelopePayload, NotificationEnvelope};
pub use types::{
    epoch_ms, DealSummary, GeofenceEvaluationResult, LocationSample, NeighborhoodMembership,
    PermissionState,
};
