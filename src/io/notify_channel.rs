//! Typed channel for user-visible events
//!
//! Provides a non-blocking way to hand envelopes and notices to whatever renders
//! them. Uses a bounded mpsc channel to prevent unbounded memory growth.

use crate::domain::notification::NotificationEnvelope;
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Non-blocking notices about the tracking feature itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum TrackingNotice {
    TrackingEnabled,
    TrackingDisabled,
    PermissionDenied,
    /// Sensor trouble on an active watch, or a watch that failed to open
    LocationWarning(String),
}

impl TrackingNotice {
    pub fn message(&self) -> String {
        match self {
            TrackingNotice::TrackingEnabled => "Location tracking enabled".to_string(),
            TrackingNotice::TrackingDisabled => "Location tracking disabled".to_string(),
            TrackingNotice::PermissionDenied => {
                "Location permission denied. Enable it to get nearby deals.".to_string()
            }
            TrackingNotice::LocationWarning(detail) => format!("Location issue: {detail}"),
        }
    }
}

/// Messages delivered to the UI side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UserEvent {
    Envelope(NotificationEnvelope),
    Notice { notice: TrackingNotice },
}

/// Receiver side of user-visible events
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, envelope: NotificationEnvelope);
    fn notice(&self, notice: TrackingNotice);
}

/// Sender handle for user events
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, events are dropped.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<UserEvent>,
    metrics: Arc<Metrics>,
}

impl NotificationSender {
    pub fn new(tx: mpsc::Sender<UserEvent>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    fn send(&self, event: UserEvent) {
        // Use try_send to avoid blocking - drop if channel full
        if self.tx.try_send(event).is_err() {
            self.metrics.record_user_event_dropped();
            debug!("user_event_dropped");
        }
    }
}

impl NotificationSink for NotificationSender {
    fn deliver(&self, envelope: NotificationEnvelope) {
        self.send(UserEvent::Envelope(envelope));
    }

    fn notice(&self, notice: TrackingNotice) {
        self.send(UserEvent::Notice { notice });
    }
}

/// Create a new notification channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_notification_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (NotificationSender, mpsc::Receiver<UserEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (NotificationSender::new(tx, metrics), rx)
}
