//! Background actors: service status polling, periodic jobs, shared state
//! and per-site serialization.

pub mod periodic;
pub mod site_lock;
pub mod state_manager;
pub mod status_poller;

pub use periodic::PeriodicTask;
pub use site_lock::{LockError, SiteGuard, SiteLocks};
pub use state_manager::{AggregatedState, StateManager};
pub use status_poller::{poll_once, StatusPoller, StatusSnapshot};
