//! Notification dispatch sequencing
//!
//! Turns one evaluation result into timed envelope deliveries. Every envelope
//! is its own cancellable task keyed by the evaluation id; starting a sequence
//! for a new evaluation aborts whatever is still pending from the previous one.

use crate::domain::notification::{plan_envelopes, NotificationEnvelope};
use crate::domain::types::GeofenceEvaluationResult;
use crate::infra::metrics::Metrics;
use crate::io::notify_channel::NotificationSink;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

struct ActiveSequence {
    evaluation_id: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSequence {
    fn pending(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Abort unfired envelopes, returning how many were cancelled
    fn cancel(self) -> usize {
        let mut cancelled = 0;
        for task in self.tasks {
            if !task.is_finished() {
                task.abort();
                cancelled += 1;
            }
        }
        cancelled
    }
}

pub struct NotificationDispatchSequencer {
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    active: Mutex<Option<ActiveSequence>>,
}

impl NotificationDispatchSequencer {
    pub fn new(sink: Arc<dyn NotificationSink>, metrics: Arc<Metrics>) -> Self {
        Self { sink, metrics, active: Mutex::new(None) }
    }

    /// Schedule the envelope sequence for `result`
    ///
    /// Returns the scheduled envelopes; empty when the result does not qualify,
    /// in which case any running sequence is left alone.
    pub fn dispatch(
        &self,
        evaluation_id: u64,
        result: &GeofenceEvaluationResult,
    ) -> Vec<NotificationEnvelope> {
        let plan = plan_envelopes(evaluation_id, result);
        if plan.is_empty() {
            debug!(evaluation_id = %evaluation_id, "notification_sequence_suppressed");
            return plan;
        }

        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            let previous_id = previous.evaluation_id;
            let cancelled = previous.cancel();
            if cancelled > 0 {
                self.metrics.record_envelopes_cancelled(cancelled as u64);
                info!(
                    previous_evaluation = %previous_id,
                    evaluation_id = %evaluation_id,
                    cancelled = %cancelled,
                    "notification_sequence_superseded"
                );
            }
        }

        let started = Instant::now();
        let tasks = plan
            .iter()
            .cloned()
            .map(|envelope| {
                let sink = self.sink.clone();
                let metrics = self.metrics.clone();
                let fire_at = started + Duration::from_millis(envelope.fire_at_offset_ms);
                tokio::spawn(async move {
                    tokio::time::sleep_until(fire_at).await;
                    info!(
                        evaluation_id = %envelope.evaluation_id,
                        kind = %envelope.kind().as_str(),
                        offset_ms = %envelope.fire_at_offset_ms,
                        "envelope_delivered"
                    );
                    metrics.record_envelope_delivered();
                    sink.deliver(envelope);
                })
            })
            .collect();

        self.metrics.record_envelopes_scheduled(plan.len() as u64);
        info!(evaluation_id = %evaluation_id, envelopes = %plan.len(), "notification_sequence_scheduled");
        *active = Some(ActiveSequence { evaluation_id, tasks });
        plan
    }

    /// Abort every envelope that has not fired yet
    pub fn cancel_pending(&self) -> usize {
        let Some(sequence) = self.active.lock().take() else {
            return 0;
        };
        let evaluation_id = sequence.evaluation_id;
        let cancelled = sequence.cancel();
        if cancelled > 0 {
            self.metrics.record_envelopes_cancelled(cancelled as u64);
            info!(evaluation_id = %evaluation_id, cancelled = %cancelled, "notification_sequence_cancelled");
        }
        cancelled
    }

    /// Envelopes scheduled but not yet delivered
    pub fn pending(&self) -> usize {
        self.active.lock().as_ref().map_or(0, ActiveSequence::pending)
    }

    pub fn active_evaluation(&self) -> Option<u64> {
        self.active.lock().as_ref().map(|s| s.evaluation_id)
    }
}

impl Drop for NotificationDispatchSequencer {
    fn drop(&mut self) {
        if let Some(sequence) = self.active.get_mut().take() {
            sequence.cancel();
        }
    }
}
