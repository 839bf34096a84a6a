//! Persistence seams for the records the orchestration engine mutates.
//!
//! The MySQL implementation lives in `hp-db`; [`MemoryStore`] backs tests
//! and dry runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Deployment, Site, SystemUnit};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("Duplicate entry: {0}")]
    Duplicate(String),
    #[error("Deployment {0} is finished and cannot be modified")]
    Immutable(i64),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

#[async_trait]
pub trait SiteStore: Send + Sync {
    async fn get_site(&self, id: i64) -> Result<Site, StoreError>;
    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<Site>, StoreError>;
    async fn list_sites(&self) -> Result<Vec<Site>, StoreError>;
    /// Insert and return the assigned id. Domains are unique.
    async fn insert_site(&self, site: &Site) -> Result<i64, StoreError>;
    /// Persist every mutable field, statuses included.
    async fn save_site(&self, site: &Site) -> Result<(), StoreError>;
    async fn delete_site(&self, id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UnitStore: Send + Sync {
    async fn get_unit(&self, id: i64) -> Result<SystemUnit, StoreError>;
    async fn find_unit_by_name(&self, name: &str) -> Result<Option<SystemUnit>, StoreError>;
    async fn list_units(&self) -> Result<Vec<SystemUnit>, StoreError>;
    async fn insert_unit(&self, unit: &SystemUnit) -> Result<i64, StoreError>;
    async fn save_unit(&self, unit: &SystemUnit) -> Result<(), StoreError>;
    async fn delete_unit(&self, id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<i64, StoreError>;
    /// Rejected once the stored record is completed or failed.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;
    async fn list_deployments(&self, webhook_id: i64, limit: u32) -> Result<Vec<Deployment>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    sites: BTreeMap<i64, Site>,
    units: BTreeMap<i64, SystemUnit>,
    deployments: BTreeMap<i64, Deployment>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Thread-safe in-memory implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn get_site(&self, id: i64) -> Result<Site, StoreError> {
        self.tables()
            .sites
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("site", id))
    }

    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<Site>, StoreError> {
        Ok(self
            .tables()
            .sites
            .values()
            .find(|s| s.domain == domain)
            .cloned())
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        Ok(self.tables().sites.values().cloned().collect())
    }

    async fn insert_site(&self, site: &Site) -> Result<i64, StoreError> {
        let mut tables = self.tables();
        if tables.sites.values().any(|s| s.domain == site.domain) {
            return Err(StoreError::Duplicate(site.domain.clone()));
        }
        let id = tables.allocate_id();
        let mut stored = site.clone();
        stored.id = id;
        tables.sites.insert(id, stored);
        Ok(id)
    }

    async fn save_site(&self, site: &Site) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let stored = tables
            .sites
            .get_mut(&site.id)
            .ok_or_else(|| StoreError::not_found("site", site.id))?;
        *stored = site.clone();
        Ok(())
    }

    async fn delete_site(&self, id: i64) -> Result<(), StoreError> {
        self.tables()
            .sites
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("site", id))
    }
}

#[async_trait]
impl UnitStore for MemoryStore {
    async fn get_unit(&self, id: i64) -> Result<SystemUnit, StoreError> {
        self.tables()
            .units
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("unit", id))
    }

    async fn find_unit_by_name(&self, name: &str) -> Result<Option<SystemUnit>, StoreError> {
        Ok(self
            .tables()
            .units
            .values()
            .find(|u| u.name == name)
            .cloned())
    }

    async fn list_units(&self) -> Result<Vec<SystemUnit>, StoreError> {
        Ok(self.tables().units.values().cloned().collect())
    }

    async fn insert_unit(&self, unit: &SystemUnit) -> Result<i64, StoreError> {
        let mut tables = self.tables();
        if tables.units.values().any(|u| u.name == unit.name) {
            return Err(StoreError::Duplicate(unit.name.clone()));
        }
        let id = tables.allocate_id();
        let mut stored = unit.clone();
        stored.id = id;
        tables.units.insert(id, stored);
        Ok(id)
    }

    async fn save_unit(&self, unit: &SystemUnit) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let stored = tables
            .units
            .get_mut(&unit.id)
            .ok_or_else(|| StoreError::not_found("unit", unit.id))?;
        *stored = unit.clone();
        Ok(())
    }

    async fn delete_unit(&self, id: i64) -> Result<(), StoreError> {
        self.tables()
            .units
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("unit", id))
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<i64, StoreError> {
        let mut tables = self.tables();
        let id = tables.allocate_id();
        let mut stored = deployment.clone();
        stored.id = id;
        tables.deployments.insert(id, stored);
        Ok(id)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let stored = tables
            .deployments
            .get_mut(&deployment.id)
            .ok_or_else(|| StoreError::not_found("deployment", deployment.id))?;
        if stored.status.is_finished() {
            return Err(StoreError::Immutable(deployment.id));
        }
        *stored = deployment.clone();
        Ok(())
    }

    async fn list_deployments(&self, webhook_id: i64, limit: u32) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .tables()
            .deployments
            .values()
            .rev()
            .filter(|d| d.webhook_id == webhook_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
