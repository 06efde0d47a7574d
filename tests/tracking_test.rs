//! End-to-end tracking pipeline tests on the scripted platform
//!
//! Sensor samples flow through the watch controller, the sequenced evaluator and
//! the notification sequencer. Time is paused so envelope offsets are exact.

use async_trait::async_trait;
use neighborhood_watch::domain::notification::{EnvelopeKind, EnvelopePayload};
use neighborhood_watch::domain::types::{
    DealSummary, EvaluationRequest, GeofenceEvaluationResult, LocationSample,
    NeighborhoodMembership, PermissionState,
};
use neighborhood_watch::domain::NotificationEnvelope;
use neighborhood_watch::infra::error::{EvaluationError, TrackingError};
use neighborhood_watch::infra::Metrics;
use neighborhood_watch::io::{
    EvaluationClient, NotificationSink, ScriptedPermissions, ScriptedSensor, TrackingNotice,
    WatchOptions,
};
use neighborhood_watch::services::{
    GeofenceEvaluator, LocationWatchController, NotificationDispatchSequencer, PermissionNegotiator,
    WatchDeps, WatchState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const UPTOWN: (f64, f64) = (35.227, -80.843);
const NODA: (f64, f64) = (35.246, -80.812);
const DEAD_ZONE: (f64, f64) = (35.100, -80.900);

fn deal(id: &str, venue: &str) -> DealSummary {
    DealSummary {
        id: id.to_string(),
        title: format!("Deal {id}"),
        description: "Happy hour".to_string(),
        venue_name: venue.to_string(),
        deal_type: "drink".to_string(),
    }
}

fn entered(id: &str, name: &str, deals: Vec<DealSummary>) -> GeofenceEvaluationResult {
    GeofenceEvaluationResult {
        current_neighborhood: Some(NeighborhoodMembership {
            neighborhood_id: id.to_string(),
            name: name.to_string(),
            description: None,
        }),
        entered_new_neighborhood: true,
        notifications_triggered: deals.len() as u32,
        deals,
    }
}

/// Evaluation endpoint stand-in keyed by exact latitude
#[derive(Default)]
struct ScriptedEvaluations {
    /// latitude -> (delay, response; None means the call fails)
    responses: Mutex<Vec<(f64, Duration, Option<GeofenceEvaluationResult>)>>,
    requests: Mutex<Vec<EvaluationRequest>>,
}

impl ScriptedEvaluations {
    fn respond(&self, latitude: f64, delay_ms: u64, response: Option<GeofenceEvaluationResult>) {
        self.responses.lock().push((latitude, Duration::from_millis(delay_ms), response));
    }
}

#[async_trait]
impl EvaluationClient for ScriptedEvaluations {
    async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<GeofenceEvaluationResult, EvaluationError> {
        self.requests.lock().push(*request);
        let scripted = self
            .responses
            .lock()
            .iter()
            .find(|(lat, _, _)| *lat == request.latitude)
            .map(|(_, delay, response)| (*delay, response.clone()));

        let Some((delay, response)) = scripted else {
            return Err(EvaluationError::Status(404));
        };
        tokio::time::sleep(delay).await;
        response.ok_or(EvaluationError::Status(502))
    }
}

#[derive(Default)]
struct RecordingSink {
    envelopes: Mutex<Vec<(Instant, NotificationEnvelope)>>,
    notices: Mutex<Vec<TrackingNotice>>,
}

impl RecordingSink {
    fn envelopes_since(&self, origin: Instant) -> Vec<(u64, NotificationEnvelope)> {
        self.envelopes
            .lock()
            .iter()
            .map(|(at, e)| (at.duration_since(origin).as_millis() as u64, e.clone()))
            .collect()
    }

    fn notices(&self) -> Vec<TrackingNotice> {
        self.notices.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, envelope: NotificationEnvelope) {
        self.envelopes.lock().push((Instant::now(), envelope));
    }

    fn notice(&self, notice: TrackingNotice) {
        self.notices.lock().push(notice);
    }
}

struct Pipeline {
    controller: LocationWatchController,
    sensor: Arc<ScriptedSensor>,
    permissions: Arc<ScriptedPermissions>,
    evaluations: Arc<ScriptedEvaluations>,
    sink: Arc<RecordingSink>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    fn new(permission: PermissionState) -> Self {
        let metrics = Arc::new(Metrics::new());
        let sink = Arc::new(RecordingSink::default());
        let evaluations = Arc::new(ScriptedEvaluations::default());
        let permissions = Arc::new(ScriptedPermissions::new(permission));
        let sensor = Arc::new(ScriptedSensor::new());

        let dispatcher = Arc::new(NotificationDispatchSequencer::new(sink.clone(), metrics.clone()));
        let evaluator =
            Arc::new(GeofenceEvaluator::new(evaluations.clone(), dispatcher.clone(), metrics.clone()));
        let controller = LocationWatchController::new(
            WatchDeps {
                negotiator: Arc::new(PermissionNegotiator::new(permissions.clone())),
                sensor: sensor.clone(),
                evaluator,
                dispatcher,
                sink: sink.clone(),
                metrics: metrics.clone(),
            },
            WatchOptions::default(),
        );

        Self { controller, sensor, permissions, evaluations, sink, metrics }
    }

    async fn push(&self, (lat, lng): (f64, f64)) {
        self.sensor.push_sample(LocationSample::new(lat, lng, 15.0)).await;
    }

    fn neighborhood(&self) -> Option<String> {
        self.controller.evaluator().membership().map(|m| m.neighborhood_id)
    }
}

#[tokio::test(start_paused = true)]
async fn test_uptown_entry_schedules_welcome_deal_and_more() {
    let p = Pipeline::new(PermissionState::Granted);
    p.evaluations.respond(
        UPTOWN.0,
        0,
        Some(entered("uptown-clt", "Uptown", vec![deal("d1", "Blue Bar"), deal("d2", "Cabo")])),
    );

    p.controller.start().await.unwrap();
    let origin = Instant::now();
    p.push(UPTOWN).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let requests = p.evaluations.requests.lock().clone();
    assert_eq!(requests, vec![EvaluationRequest { latitude: 35.227, longitude: -80.843, accuracy: 15.0 }]);
    assert_eq!(p.neighborhood().as_deref(), Some("uptown-clt"));

    let delivered = p.sink.envelopes_since(origin);
    let timeline: Vec<(u64, EnvelopeKind)> = delivered.iter().map(|(at, e)| (*at, e.kind())).collect();
    assert_eq!(
        timeline,
        vec![
            (0, EnvelopeKind::Welcome),
            (1000, EnvelopeKind::PrimaryDeal),
            (3000, EnvelopeKind::MoreDealsCount),
        ]
    );

    assert_eq!(delivered[0].1.title(), "Welcome to Uptown!");
    match &delivered[1].1.payload {
        EnvelopePayload::PrimaryDeal { deal } => assert_eq!(deal.id, "d1"),
        other => panic!("expected primary deal, got {other:?}"),
    }
    assert_eq!(delivered[1].1.action().map(|a| a.link).as_deref(), Some("/deals/d1"));
    assert_eq!(delivered[2].1.payload, EnvelopePayload::MoreDealsCount { count: 1 });
    assert_eq!(delivered[2].1.action().map(|a| a.link).as_deref(), Some("/deals"));

    let summary = p.metrics.report();
    assert_eq!(summary.samples_total, 1);
    assert_eq!(summary.neighborhoods_entered, 1);
    assert_eq!(summary.envelopes_delivered, 3);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_keeps_one_watch() {
    let p = Pipeline::new(PermissionState::Granted);
    let first = p.controller.start().await.unwrap();
    let second = p.controller.start().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(p.sensor.opened_watches(), 1);
    assert_eq!(p.permissions.subscription_count(), 1);
    assert_eq!(p.sink.notices(), vec![TrackingNotice::TrackingEnabled]);
}

#[tokio::test(start_paused = true)]
async fn test_denied_permission_creates_no_watch() {
    let p = Pipeline::new(PermissionState::Denied);
    assert_eq!(p.controller.start().await, Err(TrackingError::PermissionDenied));
    assert_eq!(p.controller.state().await, WatchState::Idle);
    assert_eq!(p.sensor.opened_watches(), 0);
    assert_eq!(p.sink.notices(), vec![TrackingNotice::PermissionDenied]);
}

#[tokio::test(start_paused = true)]
async fn test_prompt_resolved_to_granted_starts_watch() {
    let p = Pipeline::new(PermissionState::Prompt);
    p.controller.start().await.unwrap();
    assert_eq!(p.permissions.prompt_count(), 1);
    assert_eq!(p.controller.state().await, WatchState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_slow_response_cannot_revert_membership() {
    let p = Pipeline::new(PermissionState::Granted);
    p.evaluations.respond(UPTOWN.0, 500, Some(entered("uptown-clt", "Uptown", vec![deal("d1", "")])));
    p.evaluations.respond(NODA.0, 100, Some(entered("noda", "NoDa", vec![deal("n1", "")])));

    p.controller.start().await.unwrap();
    p.push(UPTOWN).await;
    p.push(NODA).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(p.neighborhood().as_deref(), Some("noda"));
    assert_eq!(p.metrics.evaluations_stale(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_evaluation_keeps_membership_and_watch() {
    let p = Pipeline::new(PermissionState::Granted);
    p.evaluations.respond(UPTOWN.0, 0, Some(entered("uptown-clt", "Uptown", vec![])));
    p.evaluations.respond(DEAD_ZONE.0, 0, None);

    p.controller.start().await.unwrap();
    p.push(UPTOWN).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    p.push(DEAD_ZONE).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(p.neighborhood().as_deref(), Some("uptown-clt"));
    assert_eq!(p.controller.state().await, WatchState::Active);
    assert_eq!(p.metrics.report().evaluations_failed, 1);

    // Watch keeps evaluating after the failure
    p.push(UPTOWN).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p.evaluations.requests.lock().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_quick_move_cancels_previous_deal_notifications() {
    let p = Pipeline::new(PermissionState::Granted);
    p.evaluations.respond(
        UPTOWN.0,
        0,
        Some(entered("uptown-clt", "Uptown", vec![deal("d1", ""), deal("d2", "")])),
    );
    p.evaluations.respond(NODA.0, 0, Some(entered("noda", "NoDa", vec![deal("n1", "")])));

    p.controller.start().await.unwrap();
    let origin = Instant::now();
    p.push(UPTOWN).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    p.push(NODA).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let delivered: Vec<(u64, EnvelopeKind, String)> = p
        .sink
        .envelopes_since(origin)
        .into_iter()
        .map(|(at, e)| (at, e.kind(), e.title()))
        .collect();
    assert_eq!(
        delivered,
        vec![
            (0, EnvelopeKind::Welcome, "Welcome to Uptown!".to_string()),
            (500, EnvelopeKind::Welcome, "Welcome to NoDa!".to_string()),
            (1500, EnvelopeKind::PrimaryDeal, "Deal n1".to_string()),
        ]
    );
    assert_eq!(p.metrics.envelopes_cancelled(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_releases_everything() {
    let p = Pipeline::new(PermissionState::Granted);
    p.evaluations.respond(
        UPTOWN.0,
        0,
        Some(entered("uptown-clt", "Uptown", vec![deal("d1", ""), deal("d2", "")])),
    );

    p.controller.start().await.unwrap();
    p.push(UPTOWN).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    p.controller.teardown().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(p.sensor.active_watches(), 0);
    assert_eq!(p.controller.state().await, WatchState::Stopped);
    assert_eq!(p.neighborhood(), None);
    assert_eq!(p.sink.envelopes.lock().len(), 1);
    assert_eq!(
        p.sink.notices(),
        vec![TrackingNotice::TrackingEnabled, TrackingNotice::TrackingDisabled]
    );

    // Permission changes are no longer observed
    p.permissions.set_state(PermissionState::Denied);
    tokio::task::yield_now().await;
    assert_eq!(p.sink.notices().len(), 2);
}
