//! Location permission negotiation
//!
//! Queries the platform for the current permission state, resolves a `prompt`
//! state by triggering an actual location request, and re-publishes platform
//! permission changes on a watch channel. The platform change subscription is
//! held as an explicit handle and registered at most once per negotiator.

use crate::domain::types::PermissionState;
use crate::io::platform::PermissionApi;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Live registration for platform permission-change events
///
/// Dropping the subscription also ends it.
pub struct PermissionSubscription {
    task: JoinHandle<()>,
}

impl PermissionSubscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PermissionSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct PermissionNegotiator {
    api: Arc<dyn PermissionApi>,
    state_tx: watch::Sender<PermissionState>,
    subscription: Mutex<Option<PermissionSubscription>>,
}

impl PermissionNegotiator {
    pub fn new(api: Arc<dyn PermissionApi>) -> Self {
        let (state_tx, _) = watch::channel(PermissionState::Unknown);
        Self { api, state_tx, subscription: Mutex::new(None) }
    }

    /// Current platform state, never cached across restarts
    pub async fn query(&self) -> PermissionState {
        let state = self.api.query().await;
        self.publish(state);
        state
    }

    /// True iff usable permission was obtained
    ///
    /// A `prompt` (or undeterminable) state is resolved by asking the platform
    /// for an actual location, which surfaces the permission dialog.
    pub async fn request(&self) -> bool {
        match self.query().await {
            PermissionState::Granted => true,
            PermissionState::Denied => false,
            PermissionState::Prompt | PermissionState::Unknown => {
                let resolved = self.api.prompt().await;
                self.publish(resolved);
                info!(state = %resolved.as_str(), "location_permission_resolved");
                resolved == PermissionState::Granted
            }
        }
    }

    /// Start forwarding platform permission changes
    ///
    /// Must be called from within a tokio runtime. Repeat calls while a
    /// subscription is live are ignored.
    pub fn observe(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }

        let mut platform_rx = self.api.subscribe();
        let state_tx = self.state_tx.clone();
        let task = tokio::spawn(async move {
            while platform_rx.changed().await.is_ok() {
                let state = *platform_rx.borrow_and_update();
                let previous = state_tx.send_replace(state);
                if previous != state {
                    info!(
                        from = %previous.as_str(),
                        to = %state.as_str(),
                        "location_permission_changed"
                    );
                }
            }
            debug!("permission_source_closed");
        });

        *subscription = Some(PermissionSubscription { task });
        debug!("permission_changes_subscribed");
    }

    pub fn unsubscribe(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
            debug!("permission_changes_unsubscribed");
        }
    }

    pub fn is_observing(&self) -> bool {
        self.subscription.lock().as_ref().is_some_and(PermissionSubscription::is_active)
    }

    /// Last known state
    pub fn state(&self) -> PermissionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PermissionState> {
        self.state_tx.subscribe()
    }

    fn publish(&self, state: PermissionState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulated::ScriptedPermissions;

    #[tokio::test]
    async fn test_request_granted_skips_prompt() {
        let api = Arc::new(ScriptedPermissions::granted());
        let negotiator = PermissionNegotiator::new(api.clone());
        assert!(negotiator.request().await);
        assert_eq!(api.prompt_count(), 0);
        assert_eq!(negotiator.state(), PermissionState::Granted);
    }

    #[tokio::test]
    async fn test_request_denied_does_not_prompt() {
        let api = Arc::new(ScriptedPermissions::new(PermissionState::Denied));
        let negotiator = PermissionNegotiator::new(api.clone());
        assert!(!negotiator.request().await);
        assert_eq!(api.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_state_resolved_by_location_request() {
        let api = Arc::new(ScriptedPermissions::new(PermissionState::Prompt));
        let negotiator = PermissionNegotiator::new(api.clone());
        assert!(negotiator.request().await);
        assert_eq!(api.prompt_count(), 1);

        let api = Arc::new(
            ScriptedPermissions::new(PermissionState::Prompt)
                .with_prompt_outcome(PermissionState::Denied),
        );
        let negotiator = PermissionNegotiator::new(api);
        assert!(!negotiator.request().await);
        assert_eq!(negotiator.state(), PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_observe_subscribes_once_and_republishes() {
        let api = Arc::new(ScriptedPermissions::granted());
        let negotiator = PermissionNegotiator::new(api.clone());
        negotiator.observe();
        negotiator.observe();
        assert_eq!(api.subscription_count(), 1);

        let mut rx = negotiator.subscribe_state();
        api.set_state(PermissionState::Denied);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_forwarding() {
        let api = Arc::new(ScriptedPermissions::granted());
        let negotiator = PermissionNegotiator::new(api.clone());
        negotiator.observe();
        assert!(negotiator.is_observing());

        negotiator.unsubscribe();
        assert!(!negotiator.is_observing());
        tokio::task::yield_now().await;

        api.set_state(PermissionState::Denied);
        tokio::task::yield_now().await;
        assert_eq!(negotiator.state(), PermissionState::Unknown);

        // A fresh subscription is allowed after unsubscribing
        negotiator.observe();
        assert_eq!(api.subscription_count(), 2);
    }
}
