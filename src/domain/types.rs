//! Shared types for location tracking and geofence evaluation

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// A single fix from the platform location sensor. Immutable once captured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "accuracy")]
    pub accuracy_meters: f64,
    /// Epoch milliseconds at which the platform captured the fix
    #[serde(default)]
    pub captured_at: u64,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64) -> Self {
        Self { latitude, longitude, accuracy_meters, captured_at: epoch_ms() }
    }
}

/// Device location-permission state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    #[default]
    Unknown,
    Prompt,
    Granted,
    Denied,
}

impl PermissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionState::Unknown => "unknown",
            PermissionState::Prompt => "prompt",
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
        }
    }
}

/// Opaque identifier for an active sampling subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct WatchId(pub Uuid);

impl WatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The neighborhood the user is currently considered to be inside
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborhoodMembership {
    #[serde(rename = "id")]
    pub neighborhood_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A nearby offer, read-only, sourced from the evaluation response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub venue_name: String,
    #[serde(default)]
    pub deal_type: String,
}

/// Request body for the remote geofence evaluation call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

impl From<&LocationSample> for EvaluationRequest {
    fn from(sample: &LocationSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy: sample.accuracy_meters,
        }
    }
}

/// Response of one geofence evaluation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvaluationResult {
    #[serde(default)]
    pub current_neighborhood: Option<NeighborhoodMembership>,
    #[serde(default)]
    pub entered_new_neighborhood: bool,
    #[serde(default)]
    pub deals: Vec<DealSummary>,
    #[serde(default)]
    pub notifications_triggered: u32,
}

impl GeofenceEvaluationResult {
    /// True when this result should start a notification sequence
    pub fn should_notify(&self) -> bool {
        self.entered_new_neighborhood && !self.deals.is_empty()
    }
}

/// Precision of a forward geocoding hit, inferred from the provider's place type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeocodeAccuracy {
    Rooftop,
    Parcel,
    Neighborhood,
    Locality,
}

impl GeocodeAccuracy {
    pub fn from_place_type(place_type: &str) -> Self {
        match place_type {
            "poi" => GeocodeAccuracy::Rooftop,
            "address" => GeocodeAccuracy::Parcel,
            "neighborhood" => GeocodeAccuracy::Neighborhood,
            _ => GeocodeAccuracy::Locality,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodeAccuracy::Rooftop => "rooftop",
            GeocodeAccuracy::Parcel => "parcel",
            GeocodeAccuracy::Neighborhood => "neighborhood",
            GeocodeAccuracy::Locality => "locality",
        }
    }
}

/// Coordinates resolved for a venue name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeResult {
    pub lat: f64,
    pub lng: f64,
    pub place_name: String,
    pub accuracy: GeocodeAccuracy,
}

/// Place resolved for a coordinate pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseGeocodeResult {
    pub city: String,
    pub state: String,
    pub country: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metro_area: Option<String>,
}
