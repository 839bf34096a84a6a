use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hp_core::model::OperationResult;
use hp_core::service::UnitStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

/// Latest known state of the host, assembled from the background actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedState {
    /// Installed catalog services keyed by catalog key.
    pub services: BTreeMap<String, UnitStatus>,
    /// `systemctl is-active` text of each panel-managed unit.
    pub units: BTreeMap<String, String>,
    pub last_renewal: Option<OperationResult>,
    pub last_updated: DateTime<Utc>,
}

impl Default for AggregatedState {
    fn default() -> Self {
        Self {
            services: BTreeMap::new(),
            units: BTreeMap::new(),
            last_renewal: None,
            last_updated: Utc::now(),
        }
    }
}

/// Central state manager that aggregates data from all actors
pub struct StateManager {
    state: Arc<RwLock<AggregatedState>>,
    change_sender: broadcast::Sender<AggregatedState>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (change_sender, _) = broadcast::channel(16);
        Self {
            state: Arc::new(RwLock::new(AggregatedState::default())),
            change_sender,
        }
    }

    /// Get a snapshot of the current state
    pub async fn get_state(&self) -> AggregatedState {
        self.state.read().await.clone()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<AggregatedState> {
        self.change_sender.subscribe()
    }

    pub async fn update_services(&self, services: BTreeMap<String, UnitStatus>) {
        let mut state = self.state.write().await;
        state.services = services;
        state.last_updated = Utc::now();
        let _ = self.change_sender.send(state.clone());
    }

    pub async fn update_units(&self, units: BTreeMap<String, String>) {
        let mut state = self.state.write().await;
        state.units = units;
        state.last_updated = Utc::now();
        let _ = self.change_sender.send(state.clone());
    }

    pub async fn record_renewal(&self, result: OperationResult) {
        let mut state = self.state.write().await;
        state.last_renewal = Some(result);
        state.last_updated = Utc::now();
        let _ = self.change_sender.send(state.clone());
    }

    /// Get a reference to the shared state for passing to other components
    pub fn shared_state(&self) -> Arc<RwLock<AggregatedState>> {
        self.state.clone()
    }
}
