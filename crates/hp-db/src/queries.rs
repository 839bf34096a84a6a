use sqlx::types::Json;
use sqlx::MySqlPool;
use tracing::debug;

use hp_core::model::{Deployment, DeploymentState, Site, SystemUnit};

use crate::models::*;
use crate::pool::DbError;

fn map_write_error(e: sqlx::Error, what: impl FnOnce() -> String) -> DbError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23000") {
            return DbError::Duplicate(what());
        }
    }
    DbError::Connection(e)
}

// ============================================================
// Sites
// ============================================================

const SITE_COLUMNS: &str = "id, domain, root_path, working_directory, kind, php_version, runtime, \
    settings, port, ssl_enabled, www_redirect, is_active, status, dns_zone_id, dns_apex_record_id, \
    dns_www_record_id, dns_server_ip, dns_synced_at, cert_issuer, cert_expires_at, cert_checked_at";

pub async fn get_site(pool: &MySqlPool, id: i64) -> Result<Site, DbError> {
    let sql = format!("SELECT {} FROM sites WHERE id = ?", SITE_COLUMNS);
    sqlx::query_as::<_, SiteRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Site with id {}", id)))?
        .try_into()
}

pub async fn find_site_by_domain(pool: &MySqlPool, domain: &str) -> Result<Option<Site>, DbError> {
    let sql = format!("SELECT {} FROM sites WHERE domain = ?", SITE_COLUMNS);
    sqlx::query_as::<_, SiteRow>(&sql)
        .bind(domain)
        .fetch_optional(pool)
        .await?
        .map(Site::try_from)
        .transpose()
}

pub async fn list_sites(pool: &MySqlPool) -> Result<Vec<Site>, DbError> {
    let sql = format!("SELECT {} FROM sites ORDER BY domain", SITE_COLUMNS);
    sqlx::query_as::<_, SiteRow>(&sql)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(Site::try_from)
        .collect()
}

pub async fn insert_site(pool: &MySqlPool, site: &Site) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO sites (domain, root_path, working_directory, kind, php_version, runtime, settings, \
         port, ssl_enabled, www_redirect, is_active, status, dns_zone_id, dns_apex_record_id, \
         dns_www_record_id, dns_server_ip, dns_synced_at, cert_issuer, cert_expires_at, cert_checked_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&site.domain)
    .bind(&site.root_path)
    .bind(&site.working_directory)
    .bind(site.kind.as_str())
    .bind(&site.php_version)
    .bind(&site.runtime)
    .bind(Json(&site.settings))
    .bind(site.port.map(i32::from))
    .bind(site.ssl_enabled)
    .bind(site.www_redirect.as_str())
    .bind(site.is_active)
    .bind(Json(&site.status))
    .bind(&site.dns.zone_id)
    .bind(&site.dns.apex_record_id)
    .bind(&site.dns.www_record_id)
    .bind(&site.dns.server_ip)
    .bind(site.dns.synced_at)
    .bind(&site.certificate.issuer)
    .bind(site.certificate.expires_at)
    .bind(site.certificate.checked_at)
    .execute(pool)
    .await
    .map_err(|e| map_write_error(e, || format!("Site already exists: {}", site.domain)))?;

    debug!("Created site: {}", site.domain);
    Ok(result.last_insert_id() as i64)
}

pub async fn update_site(pool: &MySqlPool, site: &Site) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE sites SET working_directory = ?, php_version = ?, runtime = ?, settings = ?, port = ?, \
         ssl_enabled = ?, www_redirect = ?, is_active = ?, status = ?, dns_zone_id = ?, \
         dns_apex_record_id = ?, dns_www_record_id = ?, dns_server_ip = ?, dns_synced_at = ?, \
         cert_issuer = ?, cert_expires_at = ?, cert_checked_at = ? WHERE id = ?",
    )
    .bind(&site.working_directory)
    .bind(&site.php_version)
    .bind(&site.runtime)
    .bind(Json(&site.settings))
    .bind(site.port.map(i32::from))
    .bind(site.ssl_enabled)
    .bind(site.www_redirect.as_str())
    .bind(site.is_active)
    .bind(Json(&site.status))
    .bind(&site.dns.zone_id)
    .bind(&site.dns.apex_record_id)
    .bind(&site.dns.www_record_id)
    .bind(&site.dns.server_ip)
    .bind(site.dns.synced_at)
    .bind(&site.certificate.issuer)
    .bind(site.certificate.expires_at)
    .bind(site.certificate.checked_at)
    .bind(site.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_site(pool: &MySqlPool, id: i64) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM sites WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Site with id {}", id)));
    }

    debug!("Deleted site id: {}", id);
    Ok(())
}

// ============================================================
// Systemd units
// ============================================================

const UNIT_COLUMNS: &str = "id, name, description, exec_start, working_directory, user, unit_type, \
    restart, restart_sec, environment, standard_output, standard_error, is_active, status";

pub async fn get_unit(pool: &MySqlPool, id: i64) -> Result<SystemUnit, DbError> {
    let sql = format!("SELECT {} FROM system_units WHERE id = ?", UNIT_COLUMNS);
    sqlx::query_as::<_, UnitRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Unit with id {}", id)))?
        .try_into()
}

pub async fn find_unit_by_name(pool: &MySqlPool, name: &str) -> Result<Option<SystemUnit>, DbError> {
    let sql = format!("SELECT {} FROM system_units WHERE name = ?", UNIT_COLUMNS);
    sqlx::query_as::<_, UnitRow>(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await?
        .map(SystemUnit::try_from)
        .transpose()
}

pub async fn list_units(pool: &MySqlPool) -> Result<Vec<SystemUnit>, DbError> {
    let sql = format!("SELECT {} FROM system_units ORDER BY name", UNIT_COLUMNS);
    sqlx::query_as::<_, UnitRow>(&sql)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(SystemUnit::try_from)
        .collect()
}

pub async fn insert_unit(pool: &MySqlPool, unit: &SystemUnit) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO system_units (name, description, exec_start, working_directory, user, unit_type, \
         restart, restart_sec, environment, standard_output, standard_error, is_active, status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&unit.name)
    .bind(&unit.description)
    .bind(&unit.exec_start)
    .bind(&unit.working_directory)
    .bind(&unit.user)
    .bind(unit.unit_type.as_str())
    .bind(unit.restart.as_str())
    .bind(unit.restart_sec)
    .bind(&unit.environment)
    .bind(&unit.standard_output)
    .bind(&unit.standard_error)
    .bind(unit.is_active)
    .bind(&unit.status)
    .execute(pool)
    .await
    .map_err(|e| map_write_error(e, || format!("Unit already exists: {}", unit.name)))?;

    debug!("Created unit: {}", unit.name);
    Ok(result.last_insert_id() as i64)
}

/// The unit name is immutable and never updated.
pub async fn update_unit(pool: &MySqlPool, unit: &SystemUnit) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE system_units SET description = ?, exec_start = ?, working_directory = ?, user = ?, \
         unit_type = ?, restart = ?, restart_sec = ?, environment = ?, standard_output = ?, \
         standard_error = ?, is_active = ?, status = ? WHERE id = ?",
    )
    .bind(&unit.description)
    .bind(&unit.exec_start)
    .bind(&unit.working_directory)
    .bind(&unit.user)
    .bind(unit.unit_type.as_str())
    .bind(unit.restart.as_str())
    .bind(unit.restart_sec)
    .bind(&unit.environment)
    .bind(&unit.standard_output)
    .bind(&unit.standard_error)
    .bind(unit.is_active)
    .bind(&unit.status)
    .bind(unit.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_unit(pool: &MySqlPool, id: i64) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM system_units WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Unit with id {}", id)));
    }

    debug!("Deleted unit id: {}", id);
    Ok(())
}

// ============================================================
// Deployments
// ============================================================

pub async fn insert_deployment(pool: &MySqlPool, deployment: &Deployment) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO deployments (webhook_id, status, commit_hash, commit_message, author, output, \
         error_message, started_at, completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(deployment.webhook_id)
    .bind(deployment.status.as_str())
    .bind(&deployment.commit_hash)
    .bind(&deployment.commit_message)
    .bind(&deployment.author)
    .bind(&deployment.output)
    .bind(&deployment.error_message)
    .bind(deployment.started_at)
    .bind(deployment.completed_at)
    .execute(pool)
    .await?;
    Ok(result.last_insert_id() as i64)
}

pub async fn get_deployment_status(pool: &MySqlPool, id: i64) -> Result<Option<DeploymentState>, DbError> {
    let status: Option<(String,)> = sqlx::query_as("SELECT status FROM deployments WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    status
        .map(|(s,)| s.parse().map_err(|e: hp_core::model::ParseEnumError| DbError::Decode(e.to_string())))
        .transpose()
}

/// Update an open deployment. Returns the number of rows changed; finished
/// rows are never touched.
pub async fn update_open_deployment(pool: &MySqlPool, deployment: &Deployment) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE deployments SET status = ?, output = ?, error_message = ?, started_at = ?, completed_at = ? \
         WHERE id = ? AND status NOT IN ('completed', 'failed')",
    )
    .bind(deployment.status.as_str())
    .bind(&deployment.output)
    .bind(&deployment.error_message)
    .bind(deployment.started_at)
    .bind(deployment.completed_at)
    .bind(deployment.id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_deployments(pool: &MySqlPool, webhook_id: i64, limit: u32) -> Result<Vec<Deployment>, DbError> {
    sqlx::query_as::<_, DeploymentRow>(
        "SELECT id, webhook_id, status, commit_hash, commit_message, author, output, error_message, \
         started_at, completed_at FROM deployments WHERE webhook_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(webhook_id)
    .bind(limit)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Deployment::try_from)
    .collect()
}
