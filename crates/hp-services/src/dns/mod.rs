//! Keeps a site's apex and `www` address records in line with the host's
//! public IP.

mod cloudflare;
mod ip;

use std::sync::Arc;

use chrono::Utc;
use hp_core::model::{OperationResult, Site};
use hp_core::store::SiteStore;
use thiserror::Error;
use tracing::{info, warn};

pub use cloudflare::{CloudflareClient, DnsProvider, RecordSpec};
pub use ip::{HttpIpResolver, PublicIpResolver, StaticIp};

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS provider is not configured")]
    NotConfigured,
    #[error("DNS record not found")]
    NotFound,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("DNS provider error: {0}")]
    Api(String),
    #[error("Could not determine public IP: {0}")]
    PublicIp(String),
}

/// Zone names to try for a domain, most specific first, stopping at the
/// two-label parent.
pub fn zone_candidates(domain: &str) -> Vec<String> {
    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    if labels.len() < 2 {
        return vec![domain.to_string()];
    }
    (0..=labels.len() - 2).map(|i| labels[i..].join(".")).collect()
}

pub struct DnsSyncEngine {
    provider: Arc<dyn DnsProvider>,
    resolver: Arc<dyn PublicIpResolver>,
    store: Arc<dyn SiteStore>,
    proxied: bool,
}

impl DnsSyncEngine {
    pub fn new(
        provider: Arc<dyn DnsProvider>,
        resolver: Arc<dyn PublicIpResolver>,
        store: Arc<dyn SiteStore>,
        proxied: bool,
    ) -> Self {
        Self {
            provider,
            resolver,
            store,
            proxied,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_configured()
    }

    /// Publish the site's records. Record ids are persisted as soon as the
    /// provider returns them, so a failed `www` step keeps the apex.
    pub async fn sync(&self, site: &mut Site) -> OperationResult {
        if !self.provider.is_configured() {
            return OperationResult::failed(DnsError::NotConfigured.to_string());
        }

        site.status.dns.begin();
        self.persist(site).await;

        let result = self.try_sync(site).await;
        site.status.dns.finish(&result);
        if result.success {
            site.dns.synced_at = Some(Utc::now());
            info!(domain = %site.domain, "DNS synced");
        } else {
            warn!(domain = %site.domain, error = %result.error_text(), "DNS sync failed");
        }
        self.persist(site).await;
        result
    }

    async fn try_sync(&self, site: &mut Site) -> OperationResult {
        let ip = match self.resolver.resolve().await {
            Ok(ip) => ip,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        site.dns.server_ip = Some(ip.to_string());

        let zone_id = match site.dns.zone_id.clone() {
            Some(zone_id) => zone_id,
            None => match self.lookup_zone(site.primary_domain()).await {
                Ok(Some(zone_id)) => {
                    site.dns.zone_id = Some(zone_id.clone());
                    self.persist(site).await;
                    zone_id
                }
                Ok(None) => {
                    return OperationResult::failed(format!(
                        "DNS zone not found for domain: {}",
                        site.domain
                    ))
                }
                Err(e) => return OperationResult::failed(e.to_string()),
            },
        };

        let apex = RecordSpec::address(site.domain.clone(), ip, self.proxied);
        if let Err(e) = self.upsert(&zone_id, &mut site.dns.apex_record_id, &apex).await {
            return OperationResult::failed(format!("Failed to sync {}: {}", apex.name, e));
        }
        self.persist(site).await;

        let mut synced = vec![apex.name];
        let www_name = site.www_domain();
        if site.includes_www() && www_name != site.domain {
            let www = RecordSpec::address(www_name, ip, self.proxied);
            if let Err(e) = self.upsert(&zone_id, &mut site.dns.www_record_id, &www).await {
                return OperationResult::partial(
                    format!("{} → {} synced", synced.join(", "), ip),
                    format!("Failed to sync {}: {}", www.name, e),
                );
            }
            self.persist(site).await;
            synced.push(www.name);
        }

        OperationResult::ok(format!("DNS record synced: {} → {}", synced.join(", "), ip))
    }

    async fn lookup_zone(&self, domain: &str) -> Result<Option<String>, DnsError> {
        for candidate in zone_candidates(domain) {
            if let Some(zone_id) = self.provider.find_zone(&candidate).await? {
                return Ok(Some(zone_id));
            }
        }
        Ok(None)
    }

    /// Update the stored record, recreating it when the provider no longer
    /// has it, or create it and store the new id.
    async fn upsert(
        &self,
        zone_id: &str,
        record_id: &mut Option<String>,
        record: &RecordSpec,
    ) -> Result<(), DnsError> {
        if let Some(id) = record_id.as_deref() {
            match self.provider.update_record(zone_id, id, record).await {
                Ok(()) => return Ok(()),
                Err(DnsError::NotFound) => {
                    warn!(record = %record.name, "Stored DNS record is gone, recreating");
                    *record_id = None;
                }
                Err(e) => return Err(e),
            }
        }
        *record_id = Some(self.provider.create_record(zone_id, record).await?);
        Ok(())
    }

    /// Delete the site's records. Local ids are cleared even when the
    /// provider call fails. A leftover pending status from an interrupted
    /// sync does not block removal; callers serialize through the site lock.
    pub async fn remove(&self, site: &mut Site) -> OperationResult {
        if !self.provider.is_configured() {
            return OperationResult::failed(DnsError::NotConfigured.to_string());
        }
        if !site.dns.has_records() {
            return OperationResult::ok("No DNS records found");
        }

        site.status.dns.begin();
        self.persist(site).await;

        let mut error = None;
        if let Some(zone_id) = site.dns.zone_id.clone() {
            if let Some(apex) = site.dns.apex_record_id.as_deref() {
                match self.provider.delete_record(&zone_id, apex).await {
                    Ok(()) | Err(DnsError::NotFound) => {}
                    Err(e) => error = Some(format!("Failed to delete {}: {}", site.domain, e)),
                }
            }
            if let Some(www) = site.dns.www_record_id.as_deref() {
                match self.provider.delete_record(&zone_id, www).await {
                    Ok(()) | Err(DnsError::NotFound) => {}
                    Err(e) => warn!(domain = %site.domain, error = %e, "Failed to delete www record"),
                }
            }
        }
        site.dns.clear();

        let result = match error {
            None => OperationResult::ok("DNS records removed"),
            Some(e) => OperationResult::failed(e),
        };
        site.status.dns.finish_teardown(&result);
        self.persist(site).await;
        info!(domain = %site.domain, success = result.success, "DNS records removed");
        result
    }

    pub async fn verify_token(&self) -> OperationResult {
        if !self.provider.is_configured() {
            return OperationResult::failed(DnsError::NotConfigured.to_string());
        }
        match self.provider.verify_token().await {
            Ok(status) if status == "active" => OperationResult::ok("API token is valid and active"),
            Ok(status) => OperationResult::failed(format!("API token status: {}", status)),
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    pub async fn server_ip(&self) -> OperationResult {
        match self.resolver.resolve().await {
            Ok(ip) => OperationResult::ok(ip.to_string()),
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    async fn persist(&self, site: &Site) {
        if let Err(e) = self.store.save_site(site).await {
            warn!(domain = %site.domain, error = %e, "Failed to persist DNS state");
        }
    }
}
