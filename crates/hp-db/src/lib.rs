//! MySQL persistence for sites, systemd units and deployments.

pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use pool::{Database, DbError, PoolOptions};
pub use store::MySqlStore;
