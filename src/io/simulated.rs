//! Scripted platform for replay runs and tests
//!
//! `ScriptedPermissions` answers permission queries from settable state and
//! counts change subscriptions. `ScriptedSensor` fans pushed readings out to every
//! open watch and records which watches were opened and cleared.

use crate::domain::types::{LocationSample, PermissionState};
use crate::infra::error::SensorError;
use crate::io::platform::{LocationSensor, PermissionApi, SensorReading, SensorWatch, WatchOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::debug;

const READING_BUFFER: usize = 64;

pub struct ScriptedPermissions {
    state_tx: watch::Sender<PermissionState>,
    /// State a prompt resolves to
    prompt_outcome: Mutex<PermissionState>,
    subscriptions: AtomicUsize,
    prompts: AtomicUsize,
}

impl ScriptedPermissions {
    pub fn new(initial: PermissionState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            state_tx,
            prompt_outcome: Mutex::new(PermissionState::Granted),
            subscriptions: AtomicUsize::new(0),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionState::Granted)
    }

    /// Set what an unresolved prompt turns into
    pub fn with_prompt_outcome(self, outcome: PermissionState) -> Self {
        *self.prompt_outcome.lock() = outcome;
        self
    }

    /// Change the platform state, notifying subscribers
    pub fn set_state(&self, state: PermissionState) {
        self.state_tx.send_replace(state);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PermissionApi for ScriptedPermissions {
    async fn query(&self) -> PermissionState {
        *self.state_tx.borrow()
    }

    async fn prompt(&self) -> PermissionState {
        self.prompts.fetch_add(1, Ordering::Relaxed);
        let outcome = *self.prompt_outcome.lock();
        self.set_state(outcome);
        outcome
    }

    fn subscribe(&self) -> watch::Receiver<PermissionState> {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        self.state_tx.subscribe()
    }
}

#[derive(Default)]
pub struct ScriptedSensor {
    watches: Mutex<FxHashMap<u64, mpsc::Sender<SensorReading>>>,
    next_id: AtomicU64,
    opened: AtomicUsize,
    last_options: Mutex<Option<WatchOptions>>,
    /// When set, `watch_position` fails with this error
    fail_with: Mutex<Option<SensorError>>,
}

impl ScriptedSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_watch(&self, error: SensorError) {
        *self.fail_with.lock() = Some(error);
    }

    /// Deliver a sample to every open watch. Returns how many received it.
    pub async fn push_sample(&self, sample: LocationSample) -> usize {
        self.push(Ok(sample)).await
    }

    pub async fn push_error(&self, error: SensorError) -> usize {
        self.push(Err(error)).await
    }

    async fn push(&self, reading: SensorReading) -> usize {
        let senders: Vec<mpsc::Sender<SensorReading>> =
            self.watches.lock().values().cloned().collect();
        let mut delivered = 0;
        for tx in senders {
            if tx.send(reading.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// End every open watch from the platform side; receivers see the channel close
    pub fn end_watches(&self) {
        let ended = std::mem::take(&mut *self.watches.lock());
        debug!(ended = %ended.len(), "sensor_watches_ended");
    }

    /// Number of watches currently open
    pub fn active_watches(&self) -> usize {
        self.watches.lock().len()
    }

    /// Number of watches ever opened
    pub fn opened_watches(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn last_options(&self) -> Option<WatchOptions> {
        *self.last_options.lock()
    }
}

impl LocationSensor for ScriptedSensor {
    fn watch_position(&self, options: &WatchOptions) -> Result<SensorWatch, SensorError> {
        if let Some(error) = self.fail_with.lock().take() {
            return Err(error);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(READING_BUFFER);
        self.watches.lock().insert(id, tx);
        self.opened.fetch_add(1, Ordering::Relaxed);
        *self.last_options.lock() = Some(*options);

        debug!(watch_id = %id, high_accuracy = %options.enable_high_accuracy, "sensor_watch_opened");
        Ok(SensorWatch { id, readings: rx })
    }

    fn clear_watch(&self, id: u64) {
        if self.watches.lock().remove(&id).is_some() {
            debug!(watch_id = %id, "sensor_watch_cleared");
        }
    }
}
