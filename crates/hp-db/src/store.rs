//! [`SiteStore`], [`UnitStore`] and [`DeploymentStore`] on top of MySQL.

use async_trait::async_trait;
use hp_core::model::{Deployment, Site, SystemUnit};
use hp_core::store::{DeploymentStore, SiteStore, StoreError, UnitStore};
use sqlx::MySqlPool;

use crate::pool::{Database, DbError};
use crate::queries;

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Duplicate(what) => StoreError::Duplicate(what),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }
}

fn missing(kind: &'static str, key: i64) -> impl FnOnce(DbError) -> StoreError {
    move |e| match e {
        DbError::NotFound(_) => StoreError::not_found(kind, key),
        other => other.into(),
    }
}

#[async_trait]
impl SiteStore for MySqlStore {
    async fn get_site(&self, id: i64) -> Result<Site, StoreError> {
        queries::get_site(&self.pool, id).await.map_err(missing("site", id))
    }

    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<Site>, StoreError> {
        Ok(queries::find_site_by_domain(&self.pool, domain).await?)
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        Ok(queries::list_sites(&self.pool).await?)
    }

    async fn insert_site(&self, site: &Site) -> Result<i64, StoreError> {
        Ok(queries::insert_site(&self.pool, site).await?)
    }

    async fn save_site(&self, site: &Site) -> Result<(), StoreError> {
        Ok(queries::update_site(&self.pool, site).await?)
    }

    async fn delete_site(&self, id: i64) -> Result<(), StoreError> {
        queries::delete_site(&self.pool, id).await.map_err(missing("site", id))
    }
}

#[async_trait]
impl UnitStore for MySqlStore {
    async fn get_unit(&self, id: i64) -> Result<SystemUnit, StoreError> {
        queries::get_unit(&self.pool, id).await.map_err(missing("unit", id))
    }

    async fn find_unit_by_name(&self, name: &str) -> Result<Option<SystemUnit>, StoreError> {
        Ok(queries::find_unit_by_name(&self.pool, name).await?)
    }

    async fn list_units(&self) -> Result<Vec<SystemUnit>, StoreError> {
        Ok(queries::list_units(&self.pool).await?)
    }

    async fn insert_unit(&self, unit: &SystemUnit) -> Result<i64, StoreError> {
        Ok(queries::insert_unit(&self.pool, unit).await?)
    }

    async fn save_unit(&self, unit: &SystemUnit) -> Result<(), StoreError> {
        Ok(queries::update_unit(&self.pool, unit).await?)
    }

    async fn delete_unit(&self, id: i64) -> Result<(), StoreError> {
        queries::delete_unit(&self.pool, id).await.map_err(missing("unit", id))
    }
}

#[async_trait]
impl DeploymentStore for MySqlStore {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<i64, StoreError> {
        Ok(queries::insert_deployment(&self.pool, deployment).await?)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        if queries::update_open_deployment(&self.pool, deployment).await? > 0 {
            return Ok(());
        }
        // Zero rows: finished, missing, or written with identical values.
        match queries::get_deployment_status(&self.pool, deployment.id).await? {
            None => Err(StoreError::not_found("deployment", deployment.id)),
            Some(state) if state.is_finished() => Err(StoreError::Immutable(deployment.id)),
            Some(_) => Ok(()),
        }
    }

    async fn list_deployments(&self, webhook_id: i64, limit: u32) -> Result<Vec<Deployment>, StoreError> {
        Ok(queries::list_deployments(&self.pool, webhook_id, limit).await?)
    }
}
