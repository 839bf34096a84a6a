use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hp_core::service::{ServiceManager, UnitStatus};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::state_manager::StateManager;

pub type StatusSnapshot = BTreeMap<String, UnitStatus>;

/// Polls every catalog service on an interval and publishes the result to
/// the state manager and to subscribers.
pub struct StatusPoller {
    manager: Arc<dyn ServiceManager>,
    state: Arc<StateManager>,
    sender: broadcast::Sender<StatusSnapshot>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn new(
        manager: Arc<dyn ServiceManager>,
        state: Arc<StateManager>,
        buffer_size: usize,
    ) -> (Self, broadcast::Receiver<StatusSnapshot>) {
        let (sender, receiver) = broadcast::channel(buffer_size);
        (
            Self {
                manager,
                state,
                sender,
                handle: None,
            },
            receiver,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.sender.subscribe()
    }

    /// Start polling at the given interval
    pub fn start(&mut self, interval: Duration) {
        self.stop();
        let manager = self.manager.clone();
        let state = self.state.clone();
        let sender = self.sender.clone();

        let handle = tokio::spawn(async move {
            loop {
                let snapshot = poll_once(manager.as_ref(), &state).await;
                debug!(services = snapshot.len(), "Service statuses refreshed");
                let _ = sender.send(snapshot);

                tokio::time::sleep(interval).await;
            }
        });

        self.handle = Some(handle);
        info!("Status poller started with {:?} interval", interval);
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Status poller stopped");
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Query every service once and publish to the state manager.
pub async fn poll_once(manager: &dyn ServiceManager, state: &StateManager) -> StatusSnapshot {
    let snapshot = manager.list_all_statuses().await;
    state.update_services(snapshot.clone()).await;
    snapshot
}
