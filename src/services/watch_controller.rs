//! Location watch lifecycle
//!
//! Owns at most one live sensor subscription. `start` negotiates permission
//! and opens the watch; every sample is evaluated on its own task so a slow
//! evaluation never holds up the sensor. Sensor errors and evaluation failures
//! are reported and the watch keeps running until `stop` or `teardown`.
//!
//! States: Idle -> Requesting -> Active -> Stopped. A denied request returns to
//! the state it started from.

use crate::domain::types::{PermissionState, WatchId};
use crate::infra::error::{SensorError, TrackingError};
use crate::infra::metrics::Metrics;
use crate::io::notify_channel::{NotificationSink, TrackingNotice};
use crate::io::platform::{LocationSensor, SensorReading, WatchOptions};
use crate::services::dispatcher::NotificationDispatchSequencer;
use crate::services::evaluator::{EvaluationOutcome, GeofenceEvaluator};
use crate::services::permission::PermissionNegotiator;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Requesting,
    Active,
    Stopped,
}

impl WatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchState::Idle => "idle",
            WatchState::Requesting => "requesting",
            WatchState::Active => "active",
            WatchState::Stopped => "stopped",
        }
    }
}

/// The live subscription: our id, the platform's id, and the sample loop
struct WatchHandle {
    id: WatchId,
    sensor_watch_id: u64,
    task: JoinHandle<()>,
}

struct ControllerInner {
    state: WatchState,
    handle: Option<WatchHandle>,
}

/// Collaborators the controller drives
pub struct WatchDeps {
    pub negotiator: Arc<PermissionNegotiator>,
    pub sensor: Arc<dyn LocationSensor>,
    pub evaluator: Arc<GeofenceEvaluator>,
    pub dispatcher: Arc<NotificationDispatchSequencer>,
    pub sink: Arc<dyn NotificationSink>,
    pub metrics: Arc<Metrics>,
}

pub struct LocationWatchController {
    negotiator: Arc<PermissionNegotiator>,
    sensor: Arc<dyn LocationSensor>,
    evaluator: Arc<GeofenceEvaluator>,
    dispatcher: Arc<NotificationDispatchSequencer>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    options: WatchOptions,
    inner: Mutex<ControllerInner>,
}

impl LocationWatchController {
    pub fn new(deps: WatchDeps, options: WatchOptions) -> Self {
        Self {
            negotiator: deps.negotiator,
            sensor: deps.sensor,
            evaluator: deps.evaluator,
            dispatcher: deps.dispatcher,
            sink: deps.sink,
            metrics: deps.metrics,
            options,
            inner: Mutex::new(ControllerInner { state: WatchState::Idle, handle: None }),
        }
    }

    /// Begin watching; succeeds immediately if a watch is already live
    pub async fn start(&self) -> Result<WatchId, TrackingError> {
        let mut inner = self.inner.lock().await;
        self.reap_closed(&mut inner);
        if let Some(handle) = &inner.handle {
            debug!(watch_id = %handle.id, "location_watch_already_active");
            return Ok(handle.id);
        }

        let resume_state = inner.state;
        inner.state = WatchState::Requesting;
        self.negotiator.observe();

        if !self.negotiator.request().await {
            inner.state = resume_state;
            warn!("location_permission_denied");
            self.sink.notice(TrackingNotice::PermissionDenied);
            return Err(TrackingError::PermissionDenied);
        }

        let sensor_watch = match self.sensor.watch_position(&self.options) {
            Ok(sensor_watch) => sensor_watch,
            Err(e) => {
                inner.state = resume_state;
                let err = TrackingError::from(e);
                warn!(error = %err, "location_watch_open_failed");
                self.sink.notice(notice_for(&err));
                return Err(err);
            }
        };

        let id = WatchId::new();
        let sample_loop = SampleLoop {
            watch_id: id,
            evaluator: self.evaluator.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
        };
        let task = tokio::spawn(
            sample_loop.run(sensor_watch.readings, self.negotiator.subscribe_state()),
        );

        inner.handle = Some(WatchHandle { id, sensor_watch_id: sensor_watch.id, task });
        inner.state = WatchState::Active;

        info!(
            watch_id = %id,
            high_accuracy = %self.options.enable_high_accuracy,
            timeout_ms = %self.options.timeout_ms,
            maximum_age_ms = %self.options.maximum_age_ms,
            "location_watch_started"
        );
        self.sink.notice(TrackingNotice::TrackingEnabled);
        Ok(id)
    }

    /// Release the watch, forget the current neighborhood and cancel its pending
    /// envelopes; no-op when not watching
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        self.reap_closed(&mut inner);
        let Some(handle) = inner.handle.take() else {
            debug!(state = %inner.state.as_str(), "location_watch_stop_ignored");
            return;
        };

        handle.task.abort();
        self.sensor.clear_watch(handle.sensor_watch_id);
        inner.state = WatchState::Stopped;
        self.evaluator.clear_membership();
        let cancelled = self.dispatcher.cancel_pending();

        info!(watch_id = %handle.id, cancelled_envelopes = %cancelled, "location_watch_stopped");
        self.sink.notice(TrackingNotice::TrackingDisabled);
    }

    /// Drop a handle whose sample loop ended because the platform closed the watch
    fn reap_closed(&self, inner: &mut ControllerInner) {
        if !inner.handle.as_ref().is_some_and(|h| h.task.is_finished()) {
            return;
        }
        if let Some(handle) = inner.handle.take() {
            self.sensor.clear_watch(handle.sensor_watch_id);
            inner.state = WatchState::Stopped;
            self.evaluator.clear_membership();
            info!(watch_id = %handle.id, "location_watch_closed_by_platform");
        }
    }

    /// Stop, cancel pending envelopes and drop the permission subscription
    pub async fn teardown(&self) {
        self.stop().await;
        let cancelled = self.dispatcher.cancel_pending();
        self.negotiator.unsubscribe();
        info!(cancelled_envelopes = %cancelled, "location_watch_teardown");
    }

    pub async fn state(&self) -> WatchState {
        let mut inner = self.inner.lock().await;
        self.reap_closed(&mut inner);
        inner.state
    }

    pub async fn watch_id(&self) -> Option<WatchId> {
        let mut inner = self.inner.lock().await;
        self.reap_closed(&mut inner);
        inner.handle.as_ref().map(|h| h.id)
    }

    pub fn evaluator(&self) -> &Arc<GeofenceEvaluator> {
        &self.evaluator
    }
}

impl Drop for LocationWatchController {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.get_mut().handle.take() {
            handle.task.abort();
            self.sensor.clear_watch(handle.sensor_watch_id);
            debug!(watch_id = %handle.id, "location_watch_released_on_drop");
        }
    }
}

fn notice_for(err: &TrackingError) -> TrackingNotice {
    match err {
        TrackingError::PermissionDenied => TrackingNotice::PermissionDenied,
        TrackingError::WatchFailure(detail) => TrackingNotice::LocationWarning(detail.clone()),
    }
}

struct SampleLoop {
    watch_id: WatchId,
    evaluator: Arc<GeofenceEvaluator>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
}

impl SampleLoop {
    async fn run(
        self,
        mut readings: mpsc::Receiver<SensorReading>,
        mut permission: watch::Receiver<PermissionState>,
    ) {
        // Dropping the set on abort cancels evaluations still in flight
        let mut evaluations = JoinSet::new();
        let mut permission_open = true;

        loop {
            tokio::select! {
                reading = readings.recv() => {
                    match reading {
                        Some(Ok(sample)) => {
                            self.metrics.record_sample();
                            let evaluator = self.evaluator.clone();
                            evaluations.spawn(async move { evaluator.evaluate(&sample).await });
                        }
                        Some(Err(e)) => self.on_sensor_error(e),
                        None => {
                            info!(watch_id = %self.watch_id, "sensor_watch_closed");
                            break;
                        }
                    }
                }
                changed = permission.changed(), if permission_open => {
                    if changed.is_err() {
                        permission_open = false;
                        continue;
                    }
                    if *permission.borrow_and_update() == PermissionState::Denied {
                        warn!(watch_id = %self.watch_id, "location_permission_revoked");
                        self.sink.notice(TrackingNotice::PermissionDenied);
                    }
                }
                Some(joined) = evaluations.join_next(), if !evaluations.is_empty() => {
                    match joined {
                        Ok(Ok(EvaluationOutcome::Stale { sequence, last_applied })) => {
                            debug!(watch_id = %self.watch_id, sequence = %sequence, last_applied = %last_applied, "evaluation_superseded");
                        }
                        Ok(Ok(EvaluationOutcome::Applied { .. })) => {}
                        Ok(Err(e)) => warn!(watch_id = %self.watch_id, error = %e, "evaluation_failed"),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => warn!(watch_id = %self.watch_id, error = %e, "evaluation_task_failed"),
                    }
                }
            }
        }

        // Let in-flight evaluations finish once the sensor side is gone
        while let Some(joined) = evaluations.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(watch_id = %self.watch_id, error = %e, "evaluation_failed");
            }
        }
    }

    fn on_sensor_error(&self, error: SensorError) {
        self.metrics.record_sensor_error();
        warn!(watch_id = %self.watch_id, error = %error, "location_sensor_error");
        self.sink.notice(notice_for(&TrackingError::from(error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{
        EvaluationRequest, GeofenceEvaluationResult, LocationSample, NeighborhoodMembership,
    };
    use crate::infra::error::EvaluationError;
    use crate::io::evaluation::EvaluationClient;
    use crate::io::notify_channel::{create_notification_channel, UserEvent};
    use crate::io::simulated::{ScriptedPermissions, ScriptedSensor};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedClient;

    #[async_trait]
    impl EvaluationClient for FixedClient {
        async fn evaluate(
            &self,
            _request: &EvaluationRequest,
        ) -> Result<GeofenceEvaluationResult, EvaluationError> {
            Ok(GeofenceEvaluationResult {
                current_neighborhood: Some(NeighborhoodMembership {
                    neighborhood_id: "noda".to_string(),
                    name: "NoDa".to_string(),
                    description: None,
                }),
                entered_new_neighborhood: false,
                deals: Vec::new(),
                notifications_triggered: 0,
            })
        }
    }

    struct Harness {
        controller: LocationWatchController,
        permissions: Arc<ScriptedPermissions>,
        sensor: Arc<ScriptedSensor>,
        events: mpsc::Receiver<UserEvent>,
    }

    fn harness(permission: PermissionState) -> Harness {
        let metrics = Arc::new(Metrics::new());
        let (sender, events) = create_notification_channel(64, metrics.clone());
        let sink: Arc<dyn NotificationSink> = Arc::new(sender);
        let permissions = Arc::new(ScriptedPermissions::new(permission));
        let sensor = Arc::new(ScriptedSensor::new());
        let dispatcher = Arc::new(NotificationDispatchSequencer::new(sink.clone(), metrics.clone()));
        let evaluator = Arc::new(GeofenceEvaluator::new(
            Arc::new(FixedClient),
            dispatcher.clone(),
            metrics.clone(),
        ));
        let deps = WatchDeps {
            negotiator: Arc::new(PermissionNegotiator::new(permissions.clone())),
            sensor: sensor.clone(),
            evaluator,
            dispatcher,
            sink,
            metrics,
        };
        Harness {
            controller: LocationWatchController::new(deps, WatchOptions::default()),
            permissions,
            sensor,
            events,
        }
    }

    fn notices(events: &mut mpsc::Receiver<UserEvent>) -> Vec<TrackingNotice> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let UserEvent::Notice { notice } = event {
                out.push(notice);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = harness(PermissionState::Granted);
        let first = h.controller.start().await.unwrap();
        let second = h.controller.start().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.sensor.opened_watches(), 1);
        assert_eq!(h.sensor.active_watches(), 1);
        assert_eq!(h.permissions.subscription_count(), 1);
        assert_eq!(h.controller.state().await, WatchState::Active);
        assert_eq!(h.sensor.last_options(), Some(WatchOptions::default()));
    }

    #[tokio::test]
    async fn test_denied_permission_stays_idle() {
        let mut h = harness(PermissionState::Denied);
        let err = h.controller.start().await.unwrap_err();

        assert_eq!(err, TrackingError::PermissionDenied);
        assert_eq!(h.controller.state().await, WatchState::Idle);
        assert_eq!(h.controller.watch_id().await, None);
        assert_eq!(h.sensor.opened_watches(), 0);
        assert_eq!(notices(&mut h.events), vec![TrackingNotice::PermissionDenied]);
    }

    #[tokio::test]
    async fn test_watch_open_failure_surfaces_warning() {
        let mut h = harness(PermissionState::Granted);
        h.sensor.fail_next_watch(SensorError::PositionUnavailable);

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, TrackingError::WatchFailure(_)));
        assert_eq!(h.controller.state().await, WatchState::Idle);
        assert_eq!(
            notices(&mut h.events),
            vec![TrackingNotice::LocationWarning("position unavailable".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sensor_error_does_not_stop_watch() {
        let mut h = harness(PermissionState::Granted);
        h.controller.start().await.unwrap();
        h.sensor.push_error(SensorError::Timeout).await;
        h.sensor.push_sample(LocationSample::new(35.25, -80.80, 10.0)).await;

        let mut membership = h.controller.evaluator().subscribe_membership();
        tokio::time::timeout(Duration::from_secs(1), membership.wait_for(|m| m.is_some()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.controller.state().await, WatchState::Active);
        assert_eq!(
            notices(&mut h.events),
            vec![
                TrackingNotice::TrackingEnabled,
                TrackingNotice::LocationWarning("timed out waiting for a position".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_releases_watch_and_clears_membership() {
        let mut h = harness(PermissionState::Granted);
        h.controller.start().await.unwrap();
        h.sensor.push_sample(LocationSample::new(35.25, -80.80, 10.0)).await;
        let mut membership = h.controller.evaluator().subscribe_membership();
        tokio::time::timeout(Duration::from_secs(1), membership.wait_for(|m| m.is_some()))
            .await
            .unwrap()
            .unwrap();

        h.controller.stop().await;
        assert_eq!(h.sensor.active_watches(), 0);
        assert_eq!(h.controller.state().await, WatchState::Stopped);
        assert_eq!(h.controller.evaluator().membership(), None);

        // Second stop is a no-op
        h.controller.stop().await;
        assert_eq!(
            notices(&mut h.events),
            vec![TrackingNotice::TrackingEnabled, TrackingNotice::TrackingDisabled]
        );
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let mut h = harness(PermissionState::Granted);
        h.controller.stop().await;
        assert_eq!(h.controller.state().await, WatchState::Idle);
        assert!(notices(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_revoked_permission_surfaces_notice() {
        let mut h = harness(PermissionState::Granted);
        h.controller.start().await.unwrap();
        h.permissions.set_state(PermissionState::Denied);

        let mut received = Vec::new();
        while received.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(1), h.events.recv()).await {
                Ok(Some(UserEvent::Notice { notice })) => received.push(notice),
                Ok(Some(_)) => {}
                other => panic!("notice not received: {other:?}"),
            }
        }
        assert_eq!(
            received,
            vec![TrackingNotice::TrackingEnabled, TrackingNotice::PermissionDenied]
        );
        assert_eq!(h.controller.state().await, WatchState::Active);
    }

    #[tokio::test]
    async fn test_teardown_unsubscribes_and_drop_releases_sensor() {
        let h = harness(PermissionState::Granted);
        h.controller.start().await.unwrap();
        h.controller.teardown().await;
        assert!(!h.controller.negotiator.is_observing());
        assert_eq!(h.sensor.active_watches(), 0);

        h.controller.start().await.unwrap();
        let sensor = h.sensor.clone();
        drop(h);
        assert_eq!(sensor.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_envelopes() {
        let h = harness(PermissionState::Granted);
        h.controller.start().await.unwrap();
        let result = GeofenceEvaluationResult {
            current_neighborhood: Some(NeighborhoodMembership {
                neighborhood_id: "uptown-clt".to_string(),
                name: "Uptown".to_string(),
                description: None,
            }),
            entered_new_neighborhood: true,
            deals: vec![
                crate::domain::types::DealSummary {
                    id: "d1".to_string(),
                    title: "Half-price tacos".to_string(),
                    description: String::new(),
                    venue_name: "Local".to_string(),
                    deal_type: "food".to_string(),
                },
                crate::domain::types::DealSummary {
                    id: "d2".to_string(),
                    title: "Two for one".to_string(),
                    description: String::new(),
                    venue_name: "Corner".to_string(),
                    deal_type: "drink".to_string(),
                },
            ],
            notifications_triggered: 2,
        };
        h.controller.dispatcher.dispatch(1, &result);
        assert!(h.controller.dispatcher.pending() > 0);

        h.controller.stop().await;
        assert_eq!(h.controller.dispatcher.pending(), 0);
        assert_eq!(h.controller.dispatcher.active_evaluation(), None);
    }

    #[tokio::test]
    async fn test_start_reopens_after_platform_closes_watch() {
        let h = harness(PermissionState::Granted);
        let first = h.controller.start().await.unwrap();

        h.sensor.end_watches();
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.controller.watch_id().await.is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.controller.state().await, WatchState::Stopped);

        let second = h.controller.start().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(h.sensor.opened_watches(), 2);
        assert_eq!(h.sensor.active_watches(), 1);
        assert_eq!(h.controller.state().await, WatchState::Active);
    }
}
