//! Row shapes as stored in MySQL, and their conversion into the core model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hp_core::model::{
    CertificateMeta, Deployment, DeploymentStatus, DnsRecordState, Site, SystemUnit,
};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::pool::DbError;

#[derive(Debug, Clone, FromRow)]
pub struct SiteRow {
    pub id: i64,
    pub domain: String,
    pub root_path: String,
    pub working_directory: String,
    pub kind: String,
    pub php_version: Option<String>,
    pub runtime: Option<String>,
    pub settings: Json<BTreeMap<String, String>>,
    pub port: Option<i32>,
    pub ssl_enabled: bool,
    pub www_redirect: String,
    pub is_active: bool,
    pub status: Json<DeploymentStatus>,
    pub dns_zone_id: Option<String>,
    pub dns_apex_record_id: Option<String>,
    pub dns_www_record_id: Option<String>,
    pub dns_server_ip: Option<String>,
    pub dns_synced_at: Option<DateTime<Utc>>,
    pub cert_issuer: Option<String>,
    pub cert_expires_at: Option<DateTime<Utc>>,
    pub cert_checked_at: Option<DateTime<Utc>>,
}

impl TryFrom<SiteRow> for Site {
    type Error = DbError;

    fn try_from(row: SiteRow) -> Result<Self, Self::Error> {
        let port = row
            .port
            .map(|p| u16::try_from(p).map_err(|_| DbError::Decode(format!("port {} for {}", p, row.domain))))
            .transpose()?;
        Ok(Site {
            id: row.id,
            kind: row.kind.parse().map_err(decode)?,
            www_redirect: row.www_redirect.parse().map_err(decode)?,
            domain: row.domain,
            root_path: row.root_path,
            working_directory: row.working_directory,
            php_version: row.php_version,
            runtime: row.runtime,
            settings: row.settings.0,
            port,
            ssl_enabled: row.ssl_enabled,
            is_active: row.is_active,
            status: row.status.0,
            dns: DnsRecordState {
                zone_id: row.dns_zone_id,
                apex_record_id: row.dns_apex_record_id,
                www_record_id: row.dns_www_record_id,
                server_ip: row.dns_server_ip,
                synced_at: row.dns_synced_at,
            },
            certificate: CertificateMeta {
                issuer: row.cert_issuer,
                expires_at: row.cert_expires_at,
                checked_at: row.cert_checked_at,
            },
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UnitRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub exec_start: String,
    pub working_directory: String,
    pub user: String,
    pub unit_type: String,
    pub restart: String,
    pub restart_sec: u32,
    pub environment: String,
    pub standard_output: String,
    pub standard_error: String,
    pub is_active: bool,
    pub status: Option<String>,
}

impl TryFrom<UnitRow> for SystemUnit {
    type Error = DbError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        Ok(SystemUnit {
            id: row.id,
            unit_type: row.unit_type.parse().map_err(decode)?,
            restart: row.restart.parse().map_err(decode)?,
            name: row.name,
            description: row.description,
            exec_start: row.exec_start,
            working_directory: row.working_directory,
            user: row.user,
            restart_sec: row.restart_sec,
            environment: row.environment,
            standard_output: row.standard_output,
            standard_error: row.standard_error,
            is_active: row.is_active,
            status: row.status,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeploymentRow {
    pub id: i64,
    pub webhook_id: i64,
    pub status: String,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = DbError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        Ok(Deployment {
            id: row.id,
            webhook_id: row.webhook_id,
            status: row.status.parse().map_err(decode)?,
            commit_hash: row.commit_hash,
            commit_message: row.commit_message,
            author: row.author,
            output: row.output,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn decode(e: impl std::fmt::Display) -> DbError {
    DbError::Decode(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::model::{DeployState, DeploymentState, SiteKind, WwwRedirect};

    fn site_row() -> SiteRow {
        let mut status = DeploymentStatus::default();
        status.nginx.state = DeployState::Active;
        SiteRow {
            id: 3,
            domain: "example.com".into(),
            root_path: "/var/www/example_com".into(),
            working_directory: "public".into(),
            kind: "php".into(),
            php_version: Some("8.2".into()),
            runtime: None,
            settings: Json(BTreeMap::from([("memory_limit".to_string(), "256M".to_string())])),
            port: None,
            ssl_enabled: true,
            www_redirect: "to_www".into(),
            is_active: true,
            status: Json(status),
            dns_zone_id: Some("zone-1".into()),
            dns_apex_record_id: Some("rec-1".into()),
            dns_www_record_id: None,
            dns_server_ip: Some("203.0.113.7".into()),
            dns_synced_at: None,
            cert_issuer: None,
            cert_expires_at: None,
            cert_checked_at: None,
        }
    }

    #[test]
    fn test_site_row_converts() {
        let site = Site::try_from(site_row()).unwrap();
        assert_eq!(site.kind, SiteKind::Php);
        assert_eq!(site.www_redirect, WwwRedirect::ToWww);
        assert_eq!(site.web_root(), "/var/www/example_com/public");
        assert_eq!(site.status.nginx.state, DeployState::Active);
        assert_eq!(site.dns.apex_record_id.as_deref(), Some("rec-1"));
        assert_eq!(site.settings.get("memory_limit").map(String::as_str), Some("256M"));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut row = site_row();
        row.kind = "cgi".into();
        assert!(matches!(Site::try_from(row), Err(DbError::Decode(_))));
    }

    #[test]
    fn test_out_of_range_port_is_rejected() {
        let mut row = site_row();
        row.port = Some(70_000);
        assert!(matches!(Site::try_from(row), Err(DbError::Decode(_))));
    }

    #[test]
    fn test_deployment_row_converts() {
        let row = DeploymentRow {
            id: 1,
            webhook_id: 9,
            status: "completed".into(),
            commit_hash: Some("abc".into()),
            commit_message: None,
            author: None,
            output: Some("ok".into()),
            error_message: None,
            started_at: None,
            completed_at: None,
        };
        let d = Deployment::try_from(row).unwrap();
        assert_eq!(d.status, DeploymentState::Completed);
    }
}
