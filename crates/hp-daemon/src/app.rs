//! Wiring: settings → layout → executor → reconcilers → orchestration.

use std::sync::Arc;

use anyhow::{Context, Result};
use hp_actors::SiteLocks;
use hp_core::layout::HostLayout;
use hp_core::security::audit::{AuditLogger, FileAuditLogger, NullAuditLogger};
use hp_core::service::{service_manager_for, ServiceManager};
use hp_core::settings::Settings;
use hp_core::shell::{ShellExecutor, SystemExecutor};
use hp_core::store::MemoryStore;
use hp_db::{Database, MySqlStore, PoolOptions};
use hp_services::dns::{PublicIpResolver, StaticIp};
use hp_services::{
    Auditor, CertificateManager, CloudflareClient, ConfigInstaller, ControlService,
    DeploymentRunner, DnsSyncEngine, HttpIpResolver, NginxReconciler, PhpFpmReconciler,
    Pm2Controller, UnitLifecycle, UnitService, WebsiteComponents, WebsiteService,
};
use tracing::{info, warn};

/// Everything that only needs the host, not the database.
pub struct Host {
    pub settings: Settings,
    pub layout: Arc<HostLayout>,
    pub executor: Arc<dyn ShellExecutor>,
    pub services: Arc<dyn ServiceManager>,
    pub installer: Arc<ConfigInstaller>,
    pub certificates: Arc<CertificateManager>,
    pub pm2: Arc<Pm2Controller>,
    pub control: ControlService,
    pub audit: Auditor,
}

impl Host {
    pub fn new(settings: Settings, actor: &str) -> Result<Self> {
        let family = settings.os_family();
        let layout = Arc::new(HostLayout::from_settings(&settings, family));
        info!(family = ?family, web_user = %layout.web_user, "Host layout resolved");

        let executor: Arc<dyn ShellExecutor> = Arc::new(SystemExecutor::new());
        let services = service_manager_for(
            family,
            executor.clone(),
            &settings.host.php_versions,
            settings.manager_options(),
        );

        let logger: Arc<dyn AuditLogger> = match FileAuditLogger::new(&settings.audit.log_path) {
            Ok(logger) => Arc::new(logger.with_max_size(settings.audit.max_size_bytes())),
            Err(e) => {
                warn!(path = %settings.audit.log_path.display(), error = %e, "Audit log unavailable, events will be dropped");
                Arc::new(NullAuditLogger)
            }
        };
        let audit = Auditor::new(logger, actor);

        let timeouts = &settings.timeouts;
        let installer = Arc::new(ConfigInstaller::new(
            executor.clone(),
            layout.staging_dir.clone(),
            timeouts.command(),
        ));
        let certificates = Arc::new(CertificateManager::new(
            executor.clone(),
            layout.clone(),
            settings.acme.email.clone(),
            timeouts.certificate(),
            timeouts.status(),
        ));
        let pm2 = Arc::new(Pm2Controller::new(executor.clone(), layout.clone(), timeouts.command()));
        let control = ControlService::new(services.clone(), audit.clone());

        Ok(Self {
            settings,
            layout,
            executor,
            services,
            installer,
            certificates,
            pm2,
            control,
            audit,
        })
    }

    pub fn dns_provider(&self) -> Result<Arc<CloudflareClient>> {
        let dns = &self.settings.dns;
        let client = CloudflareClient::new(&dns.api_base, dns.api_token.clone(), self.settings.timeouts.http())
            .context("Failed to build DNS provider client")?;
        Ok(Arc::new(client))
    }

    pub fn ip_resolver(&self) -> Result<Arc<dyn PublicIpResolver>> {
        let dns = &self.settings.dns;
        Ok(match dns.server_ip {
            Some(ip) => Arc::new(StaticIp(ip)),
            None => Arc::new(
                HttpIpResolver::new(dns.ip_endpoints.clone(), self.settings.timeouts.http())
                    .context("Failed to build public IP resolver")?,
            ),
        })
    }
}

impl Host {
    /// DNS engine for token and IP checks, which never touch site records.
    pub fn dns_tools(&self) -> Result<DnsSyncEngine> {
        Ok(DnsSyncEngine::new(
            self.dns_provider()?,
            self.ip_resolver()?,
            Arc::new(MemoryStore::new()),
            self.settings.dns.proxied,
        ))
    }
}

pub async fn connect(settings: &Settings) -> Result<Database> {
    let options = PoolOptions {
        max_connections: settings.database.max_connections,
        ..PoolOptions::default()
    };
    Database::connect(&settings.database.url, &options)
        .await
        .context("Failed to connect to database")
}

/// Host plus the store-backed services.
pub struct Panel {
    pub host: Host,
    pub db: Database,
    pub websites: WebsiteService,
    pub units: Arc<UnitService>,
    pub deployments: DeploymentRunner,
    pub dns: Arc<DnsSyncEngine>,
}

impl Panel {
    pub async fn open(host: Host) -> Result<Self> {
        let db = connect(&host.settings).await?;
        let store = Arc::new(MySqlStore::new(&db));
        let settings = &host.settings;
        let timeouts = &settings.timeouts;

        let dns = Arc::new(DnsSyncEngine::new(
            host.dns_provider()?,
            host.ip_resolver()?,
            store.clone(),
            settings.dns.proxied,
        ));
        let nginx = Arc::new(NginxReconciler::new(
            host.executor.clone(),
            host.services.clone(),
            host.installer.clone(),
            host.layout.clone(),
            timeouts.command(),
        ));
        let php_fpm = Arc::new(PhpFpmReconciler::new(
            host.executor.clone(),
            host.services.clone(),
            host.installer.clone(),
            host.layout.clone(),
            timeouts.command(),
        ));

        let websites = WebsiteService::new(
            WebsiteComponents {
                store: store.clone(),
                executor: host.executor.clone(),
                installer: host.installer.clone(),
                layout: host.layout.clone(),
                nginx,
                php_fpm,
                certificates: host.certificates.clone(),
                dns: dns.clone(),
                pm2: host.pm2.clone(),
                locks: Arc::new(SiteLocks::shared(host.layout.lock_dir.clone())),
                php_versions: settings.host.php_versions.clone(),
                timeout: timeouts.command(),
            },
            host.audit.clone(),
        );

        let lifecycle = Arc::new(UnitLifecycle::new(
            host.executor.clone(),
            host.installer.clone(),
            host.layout.clone(),
            timeouts.command(),
            timeouts.status(),
            settings.actors.max_parallel,
        ));
        let units = Arc::new(UnitService::new(lifecycle, store.clone(), host.audit.clone()));

        let deployments = DeploymentRunner::new(
            host.executor.clone(),
            store,
            host.layout.clone(),
            timeouts.deploy(),
            host.audit.clone(),
        );

        Ok(Self {
            host,
            db,
            websites,
            units,
            deployments,
            dns,
        })
    }
}
