//! Geofence evaluation and neighborhood membership
//!
//! Every evaluation is tagged with a monotonically increasing sequence number
//! when it is issued. A response is applied only if its number is newer than
//! the last applied one; anything older is discarded, so an overtaken response
//! can never roll membership back to where the user used to be. Responses that
//! merely have newer calls still in flight are applied, so sampling faster
//! than the round trip still moves membership forward.

use crate::domain::notification::NotificationEnvelope;
use crate::domain::types::{
    EvaluationRequest, GeofenceEvaluationResult, LocationSample, NeighborhoodMembership,
};
use crate::infra::error::EvaluationError;
use crate::infra::metrics::Metrics;
use crate::io::evaluation::EvaluationClient;
use crate::services::dispatcher::NotificationDispatchSequencer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info};

/// What happened to a completed evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// Membership updated; `envelopes` is the notification sequence it started
    Applied { result: GeofenceEvaluationResult, envelopes: Vec<NotificationEnvelope> },
    /// A newer evaluation was applied (or membership cleared) while this one was in flight
    Stale { sequence: u64, last_applied: u64 },
}

impl EvaluationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, EvaluationOutcome::Applied { .. })
    }
}

#[derive(Debug, Default)]
struct Sequencing {
    issued: u64,
    applied: u64,
}

pub struct GeofenceEvaluator {
    client: Arc<dyn EvaluationClient>,
    dispatcher: Arc<NotificationDispatchSequencer>,
    metrics: Arc<Metrics>,
    /// Held while applying so a clear cannot interleave
    sequencing: Mutex<Sequencing>,
    membership_tx: watch::Sender<Option<NeighborhoodMembership>>,
}

impl GeofenceEvaluator {
    pub fn new(
        client: Arc<dyn EvaluationClient>,
        dispatcher: Arc<NotificationDispatchSequencer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (membership_tx, _) = watch::channel(None);
        Self { client, dispatcher, metrics, sequencing: Mutex::new(Sequencing::default()), membership_tx }
    }

    /// Evaluate one sample against the remote geofence rules
    ///
    /// On failure the previous membership is kept and no retry is attempted.
    pub async fn evaluate(
        &self,
        sample: &LocationSample,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        let sequence = self.issue();
        self.metrics.record_evaluation_issued();

        let request = EvaluationRequest::from(sample);
        let started = Instant::now();
        let response = self.client.evaluate(&request).await;
        self.metrics.record_evaluation_latency(started.elapsed().as_millis() as u64);

        match response {
            Ok(result) => Ok(self.apply(sequence, result)),
            Err(e) => {
                self.metrics.record_evaluation_failed();
                Err(e)
            }
        }
    }

    fn issue(&self) -> u64 {
        let mut sequencing = self.sequencing.lock();
        sequencing.issued += 1;
        sequencing.issued
    }

    fn apply(&self, sequence: u64, result: GeofenceEvaluationResult) -> EvaluationOutcome {
        let mut sequencing = self.sequencing.lock();
        let last_applied = sequencing.applied;
        if sequence <= last_applied {
            self.metrics.record_evaluation_stale();
            debug!(sequence = %sequence, last_applied = %last_applied, "evaluation_stale_discarded");
            return EvaluationOutcome::Stale { sequence, last_applied };
        }
        sequencing.applied = sequence;

        let previous = self.membership_tx.send_replace(result.current_neighborhood.clone());
        if previous != result.current_neighborhood {
            debug!(
                from = ?previous.as_ref().map(|n| n.neighborhood_id.as_str()),
                to = ?result.current_neighborhood.as_ref().map(|n| n.neighborhood_id.as_str()),
                "membership_changed"
            );
        }
        self.metrics.record_evaluation_applied(result.entered_new_neighborhood);

        let envelopes = if result.should_notify() {
            if let Some(hood) = &result.current_neighborhood {
                info!(
                    neighborhood = %hood.name,
                    neighborhood_id = %hood.neighborhood_id,
                    deals = %result.deals.len(),
                    "neighborhood_entered"
                );
            }
            self.dispatcher.dispatch(sequence, &result)
        } else {
            Vec::new()
        };

        EvaluationOutcome::Applied { result, envelopes }
    }

    /// Forget the current neighborhood and invalidate in-flight evaluations
    pub fn clear_membership(&self) {
        let mut sequencing = self.sequencing.lock();
        sequencing.issued += 1;
        sequencing.applied = sequencing.issued;
        self.membership_tx.send_replace(None);
    }

    pub fn membership(&self) -> Option<NeighborhoodMembership> {
        self.membership_tx.borrow().clone()
    }

    pub fn subscribe_membership(&self) -> watch::Receiver<Option<NeighborhoodMembership>> {
        self.membership_tx.subscribe()
    }

    pub fn latest_sequence(&self) -> u64 {
        self.sequencing.lock().issued
    }

    pub fn last_applied_sequence(&self) -> u64 {
        self.sequencing.lock().applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DealSummary;
    use crate::io::notify_channel::{NotificationSink, TrackingNotice};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullSink;

    impl NotificationSink for NullSink {
        fn deliver(&self, _envelope: NotificationEnvelope) {}
        fn notice(&self, _notice: TrackingNotice) {}
    }

    /// Answers by latitude: whole degrees pick the neighborhood, delay in ms is the fraction * 1000
    struct LatitudeClient;

    #[async_trait]
    impl EvaluationClient for LatitudeClient {
        async fn evaluate(
            &self,
            request: &EvaluationRequest,
        ) -> Result<GeofenceEvaluationResult, EvaluationError> {
            let delay_ms = (request.latitude.fract() * 1000.0).round() as u64;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            match request.latitude.trunc() as i64 {
                0 => Err(EvaluationError::Status(503)),
                n => Ok(GeofenceEvaluationResult {
                    current_neighborhood: Some(NeighborhoodMembership {
                        neighborhood_id: format!("hood-{n}"),
                        name: format!("Hood {n}"),
                        description: None,
                    }),
                    entered_new_neighborhood: true,
                    deals: vec![DealSummary {
                        id: format!("d{n}"),
                        title: "Deal".to_string(),
                        description: String::new(),
                        venue_name: String::new(),
                        deal_type: String::new(),
                    }],
                    notifications_triggered: 1,
                }),
            }
        }
    }

    fn evaluator() -> (Arc<GeofenceEvaluator>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(NotificationDispatchSequencer::new(Arc::new(NullSink), metrics.clone()));
        (
            Arc::new(GeofenceEvaluator::new(Arc::new(LatitudeClient), dispatcher, metrics.clone())),
            metrics,
        )
    }

    fn sample(lat: f64) -> LocationSample {
        LocationSample::new(lat, -80.843, 15.0)
    }

    fn hood_id(evaluator: &GeofenceEvaluator) -> Option<String> {
        evaluator.membership().map(|m| m.neighborhood_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_applied_result_updates_membership_and_dispatches() {
        let (evaluator, _) = evaluator();
        let outcome = evaluator.evaluate(&sample(1.0)).await.unwrap();
        match outcome {
            EvaluationOutcome::Applied { envelopes, .. } => assert_eq!(envelopes.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(hood_id(&evaluator).as_deref(), Some("hood-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtaken_response_is_discarded() {
        let (evaluator, metrics) = evaluator();

        // Issued first but answers after 500 ms; the second answers after 100 ms
        let slow = {
            let evaluator = evaluator.clone();
            tokio::spawn(async move { evaluator.evaluate(&sample(1.5)).await })
        };
        tokio::task::yield_now().await;
        let fast = evaluator.evaluate(&sample(2.1)).await.unwrap();
        let slow = slow.await.unwrap().unwrap();

        assert!(fast.is_applied());
        assert_eq!(slow, EvaluationOutcome::Stale { sequence: 1, last_applied: 2 });
        assert_eq!(hood_id(&evaluator).as_deref(), Some("hood-2"));
        assert_eq!(metrics.evaluations_stale(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_previous_membership() {
        let (evaluator, metrics) = evaluator();
        evaluator.evaluate(&sample(3.0)).await.unwrap();

        let err = evaluator.evaluate(&sample(0.0)).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Status(503)));
        assert_eq!(hood_id(&evaluator).as_deref(), Some("hood-3"));
        assert_eq!(metrics.report().evaluations_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_membership_invalidates_in_flight() {
        let (evaluator, _) = evaluator();
        let in_flight = {
            let evaluator = evaluator.clone();
            tokio::spawn(async move { evaluator.evaluate(&sample(4.2)).await })
        };
        tokio::task::yield_now().await;
        evaluator.clear_membership();

        let outcome = in_flight.await.unwrap().unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(evaluator.membership(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_faster_than_round_trip_still_updates_membership() {
        let (evaluator, metrics) = evaluator();

        // 900 ms round trip, one sample every 300 ms
        let mut calls = Vec::new();
        for _ in 0..5 {
            let evaluator = evaluator.clone();
            calls.push(tokio::spawn(async move { evaluator.evaluate(&sample(7.9)).await }));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        assert_eq!(hood_id(&evaluator).as_deref(), Some("hood-7"));
        for call in calls {
            assert!(call.await.unwrap().unwrap().is_applied());
        }
        assert_eq!(metrics.evaluations_stale(), 0);
        assert_eq!(evaluator.last_applied_sequence(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_response_after_newer_applied_is_discarded() {
        let (evaluator, _) = evaluator();

        // Issued first, answers at 900 ms; the second is issued at 300 ms and answers at 400 ms
        let older = {
            let evaluator = evaluator.clone();
            tokio::spawn(async move { evaluator.evaluate(&sample(5.9)).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        let newer = evaluator.evaluate(&sample(6.1)).await.unwrap();
        let older = older.await.unwrap().unwrap();

        assert!(newer.is_applied());
        assert_eq!(older, EvaluationOutcome::Stale { sequence: 1, last_applied: 2 });
        assert_eq!(hood_id(&evaluator).as_deref(), Some("hood-6"));
    }
}
