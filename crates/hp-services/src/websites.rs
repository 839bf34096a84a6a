//! Site lifecycle: every operation takes the site's lock, persists each
//! status dimension as pending before touching the host and persists the
//! outcome afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hp_actors::SiteLocks;
use hp_core::layout::HostLayout;
use hp_core::model::{NewSite, OperationResult, Site, SiteKind, SiteUpdate};
use hp_core::render::disabled_functions;
use hp_core::security::audit::AuditAction;
use hp_core::security::input::{
    assert_no_shell_metacharacters, validate_absolute_path, validate_domain, validate_php_version,
    validate_port,
};
use hp_core::shell::{CommandSpec, ShellExecutor};
use hp_core::store::{SiteStore, StoreError};
use tracing::{info, warn};

use crate::audit::Auditor;
use crate::certificates::CertificateManager;
use crate::dns::DnsSyncEngine;
use crate::installer::ConfigInstaller;
use crate::nginx::NginxReconciler;
use crate::php_fpm::PhpFpmReconciler;
use crate::pm2::Pm2Controller;

/// Collaborators of [`WebsiteService`].
pub struct WebsiteComponents {
    pub store: Arc<dyn SiteStore>,
    pub executor: Arc<dyn ShellExecutor>,
    pub installer: Arc<ConfigInstaller>,
    pub layout: Arc<HostLayout>,
    pub nginx: Arc<NginxReconciler>,
    pub php_fpm: Arc<PhpFpmReconciler>,
    pub certificates: Arc<CertificateManager>,
    pub dns: Arc<DnsSyncEngine>,
    pub pm2: Arc<Pm2Controller>,
    pub locks: Arc<SiteLocks>,
    /// PHP versions installed on the host.
    pub php_versions: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pm2Action {
    Start,
    Stop,
    Restart,
}

pub struct WebsiteService {
    c: WebsiteComponents,
    audit: Auditor,
}

impl WebsiteService {
    pub fn new(components: WebsiteComponents, audit: Auditor) -> Self {
        Self {
            c: components,
            audit,
        }
    }

    pub async fn get(&self, id: i64) -> Result<Site, StoreError> {
        self.c.store.get_site(id).await
    }

    pub async fn list(&self) -> Result<Vec<Site>, StoreError> {
        self.c.store.list_sites().await
    }

    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<Site>, StoreError> {
        self.c.store.find_site_by_domain(domain).await
    }

    // ------------------------------------------------------------------
    // create / update / delete
    // ------------------------------------------------------------------

    /// Validate, prepare the web root, insert the record, then deploy.
    pub async fn create(&self, new: NewSite) -> OperationResult {
        let site = match self.build_site(new).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e),
        };
        let domain = site.domain.clone();

        if let Err(e) = self.prepare_web_root(&site).await {
            return self.audit.record(
                AuditAction::SiteCreate,
                &domain,
                OperationResult::failed(format!("Failed to create web root: {}", e)),
            );
        }

        let id = match self.c.store.insert_site(&site).await {
            Ok(id) => id,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => {
                if let Err(del) = self.c.store.delete_site(id).await {
                    warn!(domain = %domain, error = %del, "Failed to drop site record after lock error");
                }
                return OperationResult::failed(e.to_string());
            }
        };
        let mut site = site;
        site.id = id;

        let mut result = self.deploy_stack(&mut site).await;
        if result.success && site.ssl_enabled {
            result = merge(result, self.issue_certificate(&mut site).await);
        }
        if result.success {
            result = OperationResult::ok(format!("Website {} created (id {})", domain, id));
        }
        info!(domain = %domain, site_id = id, success = result.success, "Website created");
        self.audit.record(AuditAction::SiteCreate, &domain, result)
    }

    async fn build_site(&self, new: NewSite) -> Result<Site, String> {
        let domain = new.domain.trim().to_ascii_lowercase();
        validate_domain(&domain).map_err(|e| e.to_string())?;
        match self.c.store.find_site_by_domain(&domain).await {
            Ok(Some(_)) => return Err(format!("Domain {} is already configured", domain)),
            Ok(None) => {}
            Err(e) => return Err(e.to_string()),
        }

        let mut site = Site::new(domain, new.kind);
        if let Some(root) = new.root_path {
            validate_absolute_path(&root).map_err(|e| e.to_string())?;
            site.root_path = root.trim_end_matches('/').to_string();
        }
        if let Some(dir) = new.working_directory {
            site.working_directory = normalize_working_dir(&dir)?;
        }
        site.php_version = new.php_version;
        site.runtime = new.runtime;
        site.port = new.port;
        site.ssl_enabled = new.ssl_enabled;
        site.www_redirect = new.www_redirect;
        site.settings = new.settings;
        if site.kind == SiteKind::Php {
            site.set_disabled_functions(&disabled_functions(&new.allowed_functions));
        }
        self.check_kind(&site)?;
        Ok(site)
    }

    fn check_kind(&self, site: &Site) -> Result<(), String> {
        // Settings and runtime end up in rendered config lines.
        for (key, value) in &site.settings {
            assert_no_shell_metacharacters(key)
                .and_then(|_| assert_no_shell_metacharacters(value))
                .map_err(|e| format!("Invalid setting {}: {}", key, e))?;
        }
        if let Some(ref runtime) = site.runtime {
            assert_no_shell_metacharacters(runtime).map_err(|e| e.to_string())?;
        }
        match site.kind {
            SiteKind::Php => {
                let version = site
                    .php_version
                    .as_deref()
                    .ok_or("PHP sites require a PHP version")?;
                validate_php_version(version).map_err(|e| e.to_string())?;
                if !self.c.php_versions.iter().any(|v| v == version) {
                    return Err(format!("PHP {} is not installed on this server", version));
                }
            }
            SiteKind::ReverseProxy => {
                let port = site.port.ok_or("Reverse proxy sites require a port")?;
                validate_port(u32::from(port)).map_err(|e| e.to_string())?;
            }
            SiteKind::Static => {}
        }
        Ok(())
    }

    /// `mkdir -p` the web root, drop a welcome page when it has no index,
    /// and hand the tree to the web user.
    async fn prepare_web_root(&self, site: &Site) -> Result<(), String> {
        let web_root = site.web_root();
        self.run_elevated(CommandSpec::new("mkdir").args(["-p", web_root.as_str()]))
            .await?;

        let index = format!("{}/index.html", web_root);
        let has_index = self
            .c
            .executor
            .run(
                CommandSpec::new("test")
                    .args(["-e", index.as_str()])
                    .elevated()
                    .timeout(self.c.timeout),
            )
            .await
            .success();
        if !has_index {
            let receipt = self
                .c
                .installer
                .install(Path::new(&index), &welcome_page(&site.domain))
                .await
                .map_err(|e| e.to_string())?;
            self.c.installer.commit(&receipt).await;
        }

        let owner = format!("{}:{}", self.c.layout.web_user, self.c.layout.web_group);
        self.run_elevated(CommandSpec::new("chown").args(["-R", owner.as_str(), site.root_path.as_str()]))
            .await
    }

    async fn run_elevated(&self, spec: CommandSpec) -> Result<(), String> {
        let out = self.c.executor.run(spec.elevated().timeout(self.c.timeout)).await;
        if out.success() {
            Ok(())
        } else {
            Err(out.error_text())
        }
    }

    /// Apply edits and redeploy. Domain and root path are fixed.
    pub async fn update(&self, id: i64, changes: SiteUpdate) -> OperationResult {
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let mut site = match self.c.store.get_site(id).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let was_ssl = site.ssl_enabled;
        let old_php = site.php_version.clone();

        if let Err(e) = self.apply_update(&mut site, changes) {
            return OperationResult::failed(e);
        }
        self.persist(&site).await;

        let mut result = self.deploy_stack(&mut site).await;

        // The old pool keeps serving until the new stack is live.
        if result.success {
            if let Some(old) = old_php.filter(|old| Some(old) != site.php_version.as_ref()) {
                let removed = self.c.php_fpm.delete_pool(&old, &site.domain).await;
                if !removed.success {
                    warn!(domain = %site.domain, error = %removed.error_text(), "Failed to remove old PHP pool");
                }
            }
        }
        if site.ssl_enabled && !was_ssl && result.success {
            result = merge(result, self.issue_certificate(&mut site).await);
        } else if !site.ssl_enabled && was_ssl {
            self.retire_ssl(&mut site).await;
        }
        if result.success {
            result = OperationResult::ok(format!("Website {} updated", site.domain));
        }
        self.audit.record(AuditAction::SiteUpdate, &site.domain, result)
    }

    fn apply_update(&self, site: &mut Site, changes: SiteUpdate) -> Result<(), String> {
        if let Some(dir) = changes.working_directory {
            site.working_directory = normalize_working_dir(&dir)?;
        }
        if let Some(version) = changes.php_version {
            site.php_version = Some(version);
        }
        if let Some(runtime) = changes.runtime {
            site.runtime = Some(runtime);
        }
        if let Some(port) = changes.port {
            site.port = Some(port);
        }
        if let Some(redirect) = changes.www_redirect {
            site.www_redirect = redirect;
        }
        if let Some(settings) = changes.settings {
            site.settings.extend(settings);
        }
        if let Some(allowed) = changes.allowed_functions {
            site.set_disabled_functions(&disabled_functions(&allowed));
        }
        if let Some(ssl) = changes.ssl_enabled {
            site.ssl_enabled = ssl;
        }
        if let Some(active) = changes.is_active {
            site.is_active = active;
        }
        self.check_kind(site)
    }

    /// Tear down DNS, vhost, pool and process, then drop the record. The
    /// certificate is left in place.
    pub async fn delete(&self, id: i64) -> OperationResult {
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let mut site = match self.c.store.get_site(id).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let domain = site.domain.clone();

        if site.dns.has_records() {
            let dns = self.c.dns.remove(&mut site).await;
            if !dns.success {
                warn!(domain = %domain, error = %dns.error_text(), "DNS removal failed, continuing delete");
            }
        }

        let teardown = self.teardown_stack(&mut site).await;
        if !teardown.success {
            return self.audit.record(AuditAction::SiteDelete, &domain, teardown);
        }

        if site.is_node_app() {
            let pm2 = self.c.pm2.delete(&site.app_key()).await;
            if !pm2.success {
                warn!(domain = %domain, error = %pm2.error_text(), "PM2 delete failed, continuing delete");
            }
        }

        let result = match self.c.store.delete_site(id).await {
            Ok(()) => OperationResult::ok(format!("Website {} deleted", domain)),
            Err(e) => OperationResult::failed(e.to_string()),
        };
        info!(domain = %domain, success = result.success, "Website deleted");
        self.audit.record(AuditAction::SiteDelete, &domain, result)
    }

    // ------------------------------------------------------------------
    // deploy / ssl
    // ------------------------------------------------------------------

    /// Nginx (and pool), then the certificate when SSL is enabled.
    pub async fn redeploy(&self, id: i64) -> OperationResult {
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let mut site = match self.c.store.get_site(id).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e.to_string()),
        };

        let mut result = self.deploy_stack(&mut site).await;
        if result.success && site.ssl_enabled && site.is_active {
            if self.c.certificates.certificate_exists(&site.domain).await {
                site.status.ssl.begin();
                site.status.ssl.finish(&OperationResult::ok("Certificate present"));
                self.persist(&site).await;
            } else {
                result = merge(result, self.issue_certificate(&mut site).await);
            }
        }
        self.audit.record(AuditAction::SiteDeploy, &site.domain, result)
    }

    pub async fn toggle_ssl(&self, id: i64, enable: bool) -> OperationResult {
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let mut site = match self.c.store.get_site(id).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e.to_string()),
        };

        if !enable {
            site.ssl_enabled = false;
            self.persist(&site).await;
            let result = self.deploy_stack(&mut site).await;
            self.retire_ssl(&mut site).await;
            return self.audit.record(AuditAction::SiteUpdate, &site.domain, result);
        }

        let web_root = site.web_root();
        let exists = self
            .c
            .executor
            .run(
                CommandSpec::new("test")
                    .args(["-d", web_root.as_str()])
                    .elevated()
                    .timeout(self.c.timeout),
            )
            .await
            .success();
        if !exists {
            return OperationResult::failed(format!("Web root {} does not exist", web_root));
        }

        site.ssl_enabled = true;
        self.persist(&site).await;
        let result = self.issue_certificate(&mut site).await;
        if !result.success && site.certificate.expires_at.is_none() {
            site.ssl_enabled = false;
            self.persist(&site).await;
        }
        self.audit.record(AuditAction::CertificateRequest, &site.domain, result)
    }

    /// Request the certificate, then redeploy nginx so it serves TLS.
    async fn issue_certificate(&self, site: &mut Site) -> OperationResult {
        site.status.ssl.begin();
        self.persist(site).await;

        let certificate = self.c.certificates.request_certificate(site).await;
        site.status.ssl.finish(&certificate);
        if !certificate.success {
            self.persist(site).await;
            return certificate;
        }

        match self.c.certificates.certificate_info(&site.domain).await {
            Ok(meta) => site.certificate = meta,
            Err(e) => warn!(domain = %site.domain, error = %e, "Could not read certificate details"),
        }

        site.status.nginx.begin();
        self.persist(site).await;
        let nginx = self.c.nginx.deploy_config(site).await;
        site.status.nginx.finish(&nginx);
        self.persist(site).await;

        if nginx.success {
            certificate
        } else {
            OperationResult::partial(
                "SSL certificate obtained",
                format!("Certificate obtained but nginx update failed: {}", nginx.error_text()),
            )
        }
    }

    async fn retire_ssl(&self, site: &mut Site) {
        site.status.ssl.begin();
        site.status.ssl.finish_teardown(&OperationResult::ok("SSL disabled"));
        self.persist(site).await;
    }

    /// Deploy the pool (PHP) and the vhost, or tear them down when the site
    /// is inactive.
    async fn deploy_stack(&self, site: &mut Site) -> OperationResult {
        if !site.is_active {
            return self.teardown_stack(site).await;
        }

        site.status.nginx.begin();
        self.persist(site).await;

        let mut result = OperationResult::ok("");
        if site.kind == SiteKind::Php {
            result = self.c.php_fpm.deploy_config(site).await;
        }
        if result.success {
            result = self.c.nginx.deploy_config(site).await;
        }

        site.status.nginx.finish(&result);
        self.persist(site).await;
        result
    }

    async fn teardown_stack(&self, site: &mut Site) -> OperationResult {
        site.status.nginx.begin();
        self.persist(site).await;

        let mut result = self.c.nginx.delete_config(site).await;
        if result.success && site.kind == SiteKind::Php {
            result = self.c.php_fpm.delete_config(site).await;
        }

        site.status.nginx.finish_teardown(&result);
        self.persist(site).await;
        result
    }

    // ------------------------------------------------------------------
    // dns / pm2 / renewal
    // ------------------------------------------------------------------

    pub async fn dns_sync(&self, id: i64) -> OperationResult {
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let mut site = match self.c.store.get_site(id).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let result = self.c.dns.sync(&mut site).await;
        self.audit.record(AuditAction::DnsSync, &site.domain, result)
    }

    pub async fn dns_remove(&self, id: i64) -> OperationResult {
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let mut site = match self.c.store.get_site(id).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let result = self.c.dns.remove(&mut site).await;
        self.audit.record(AuditAction::DnsRemove, &site.domain, result)
    }

    pub async fn pm2(&self, id: i64, action: Pm2Action) -> OperationResult {
        let _guard = match self.c.locks.lock(id).await {
            Ok(guard) => guard,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let mut site = match self.c.store.get_site(id).await {
            Ok(site) => site,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        if !site.is_node_app() {
            return OperationResult::failed(format!(
                "PM2 is only available for Node.js reverse-proxy sites ({})",
                site.domain
            ));
        }

        site.status.pm2.begin();
        self.persist(&site).await;
        let result = match action {
            Pm2Action::Start => self.c.pm2.start(&site).await,
            Pm2Action::Stop => self.c.pm2.stop(&site).await,
            Pm2Action::Restart => self.c.pm2.restart(&site).await,
        };
        if action == Pm2Action::Stop {
            site.status.pm2.finish_teardown(&result);
        } else {
            site.status.pm2.finish(&result);
        }
        self.persist(&site).await;
        self.audit.record(AuditAction::ProcessControl, &site.app_key(), result)
    }

    pub async fn renew_certificates(&self) -> OperationResult {
        let result = self.c.certificates.renew_all().await;
        self.audit.record(AuditAction::CertificateRenew, "*", result)
    }

    async fn persist(&self, site: &Site) {
        if let Err(e) = self.c.store.save_site(site).await {
            warn!(domain = %site.domain, error = %e, "Failed to persist site status");
        }
    }
}

/// First failure wins; otherwise the later message.
fn merge(first: OperationResult, second: OperationResult) -> OperationResult {
    if first.success {
        second
    } else {
        first
    }
}

fn normalize_working_dir(dir: &str) -> Result<String, String> {
    let trimmed = dir.trim();
    if trimmed.split('/').any(|part| part == "..") {
        return Err(format!("Invalid working directory: {}", dir));
    }
    if trimmed.is_empty() || trimmed == "/" {
        return Ok("/".to_string());
    }
    Ok(trimmed.trim_matches('/').to_string())
}

fn welcome_page(domain: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{domain}</title>\n</head>\n<body>\n<h1>{domain}</h1>\n<p>This site is ready. Upload your files to replace this page.</p>\n</body>\n</html>\n",
        domain = domain
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsError, DnsProvider, RecordSpec, StaticIp};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use hp_core::model::{DeployState, WwwRedirect};
    use hp_core::security::audit::InMemoryAuditLogger;
    use hp_core::service::{DebianServiceManager, ManagerOptions, OsFamily};
    use hp_core::shell::ScriptedExecutor;
    use hp_core::store::MemoryStore;

    /// Provider with a single `example.com` zone. Deletes fail when
    /// `fail_deletes` is set.
    #[derive(Default)]
    struct ScriptedDns {
        fail_deletes: bool,
        next_id: Mutex<u32>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedDns {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl DnsProvider for ScriptedDns {
        fn is_configured(&self) -> bool {
            true
        }

        async fn find_zone(&self, name: &str) -> Result<Option<String>, DnsError> {
            Ok((name == "example.com").then(|| "zone-1".to_string()))
        }

        async fn create_record(&self, zone_id: &str, record: &RecordSpec) -> Result<String, DnsError> {
            self.record(format!("create {} {}", zone_id, record.name));
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(format!("rec-{}", next))
        }

        async fn update_record(&self, zone_id: &str, record_id: &str, _record: &RecordSpec) -> Result<(), DnsError> {
            self.record(format!("update {} {}", zone_id, record_id));
            Ok(())
        }

        async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), DnsError> {
            self.record(format!("delete {} {}", zone_id, record_id));
            if self.fail_deletes {
                return Err(DnsError::Api("upstream unavailable".into()));
            }
            Ok(())
        }

        async fn verify_token(&self) -> Result<String, DnsError> {
            Ok("active".into())
        }
    }

    struct Fixture {
        exec: Arc<ScriptedExecutor>,
        store: Arc<MemoryStore>,
        audit: Arc<InMemoryAuditLogger>,
        dns: Arc<ScriptedDns>,
        sites: WebsiteService,
        _staging: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with_dns(ScriptedDns::default())
    }

    fn fixture_with_dns(provider: ScriptedDns) -> Fixture {
        let staging = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(InMemoryAuditLogger::new());
        let timeout = Duration::from_secs(5);

        let mut layout = HostLayout::for_family(OsFamily::Debian);
        layout.staging_dir = staging.path().to_path_buf();
        let layout = Arc::new(layout);

        let services = Arc::new(DebianServiceManager::new(exec.clone(), &[], ManagerOptions::default()));
        let installer = Arc::new(ConfigInstaller::new(exec.clone(), staging.path(), timeout));
        let nginx = Arc::new(NginxReconciler::new(
            exec.clone(),
            services.clone(),
            installer.clone(),
            layout.clone(),
            timeout,
        ));
        let php_fpm = Arc::new(PhpFpmReconciler::new(
            exec.clone(),
            services,
            installer.clone(),
            layout.clone(),
            timeout,
        ));
        let certificates = Arc::new(CertificateManager::new(exec.clone(), layout.clone(), None, timeout, timeout));
        let provider = Arc::new(provider);
        let dns = Arc::new(DnsSyncEngine::new(
            provider.clone(),
            Arc::new(StaticIp("203.0.113.7".parse().unwrap())),
            store.clone(),
            false,
        ));
        let pm2 = Arc::new(Pm2Controller::new(exec.clone(), layout.clone(), timeout));

        let sites = WebsiteService::new(
            WebsiteComponents {
                store: store.clone(),
                executor: exec.clone(),
                installer,
                layout,
                nginx,
                php_fpm,
                certificates,
                dns,
                pm2,
                locks: Arc::new(SiteLocks::new()),
                php_versions: vec!["8.2".to_string(), "8.3".to_string()],
                timeout,
            },
            Auditor::new(audit.clone(), "tester"),
        );
        Fixture {
            exec,
            store,
            audit,
            dns: provider,
            sites,
            _staging: staging,
        }
    }

    async fn site_id(f: &Fixture, domain: &str) -> i64 {
        f.store.find_site_by_domain(domain).await.unwrap().unwrap().id
    }

    #[tokio::test]
    async fn test_static_site_lifecycle() {
        let f = fixture();
        f.exec.fail("test -e /var/www/example_com/index.html", 1, "");

        let res = f.sites.create(NewSite::new("example.com", SiteKind::Static)).await;
        assert!(res.success, "{:?}", res);
        let id = site_id(&f, "example.com").await;
        let site = f.store.get_site(id).await.unwrap();
        assert_eq!(site.status.nginx.state, DeployState::Active);
        assert_eq!(site.status.ssl.state, DeployState::None);

        let calls = f.exec.calls();
        assert!(calls.contains(&"mkdir -p /var/www/example_com".to_string()));
        assert!(calls.iter().any(|c| c.starts_with("mv -f /var/www/example_com/index.html.hp-new")));
        assert!(calls.contains(&"chown -R www-data:www-data /var/www/example_com".to_string()));
        assert_eq!(f.exec.count("certbot"), 0);

        f.exec.clear_calls();
        let res = f.sites.toggle_ssl(id, true).await;
        assert!(res.success, "{:?}", res);
        let certbot: Vec<_> = f
            .exec
            .specs()
            .into_iter()
            .filter(|s| s.program == "certbot")
            .collect();
        assert_eq!(certbot.len(), 1);
        let args = &certbot[0].args;
        let domains: Vec<_> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| *flag == "-d")
            .map(|(_, d)| d.as_str())
            .collect();
        assert_eq!(domains, vec!["example.com"]);
        let site = f.store.get_site(id).await.unwrap();
        assert!(site.ssl_enabled);
        assert_eq!(site.status.ssl.state, DeployState::Active);
        assert_eq!(site.status.nginx.state, DeployState::Active);

        f.exec.clear_calls();
        let res = f.sites.delete(id).await;
        assert!(res.success, "{:?}", res);
        let calls = f.exec.calls();
        assert!(calls.contains(&"rm -f /etc/nginx/sites-available/example.com.conf".to_string()));
        assert_eq!(f.exec.count("certbot delete"), 0);
        assert!(f.store.find_site_by_domain("example.com").await.unwrap().is_none());

        assert_eq!(
            f.audit.actions(),
            vec![AuditAction::SiteCreate, AuditAction::CertificateRequest, AuditAction::SiteDelete]
        );
    }

    #[tokio::test]
    async fn test_duplicate_domain_is_rejected() {
        let f = fixture();
        assert!(f.sites.create(NewSite::new("example.com", SiteKind::Static)).await.success);
        f.exec.clear_calls();

        let res = f.sites.create(NewSite::new("Example.com", SiteKind::Static)).await;
        assert!(!res.success);
        assert!(res.error_text().contains("already configured"));
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_php_site_requires_installed_version() {
        let f = fixture();
        let mut new = NewSite::new("app.example.com", SiteKind::Php);
        new.php_version = Some("7.4".to_string());

        let res = f.sites.create(new).await;
        assert!(!res.success);
        assert!(res.error_text().contains("7.4"));
        assert!(f.exec.calls().is_empty());
        assert!(f.store.list_sites().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reverse_proxy_requires_port() {
        let f = fixture();
        let res = f.sites.create(NewSite::new("api.example.com", SiteKind::ReverseProxy)).await;
        assert!(!res.success);
        assert!(res.error_text().contains("port"));
    }

    #[tokio::test]
    async fn test_setting_with_newline_is_rejected() {
        let f = fixture();
        let mut new = NewSite::new("app.example.com", SiteKind::Static);
        new.settings.insert("memory_limit".to_string(), "256M\nphp_admin_flag[x] = on".to_string());

        let res = f.sites.create(new).await;
        assert!(!res.success);
        assert!(res.error_text().contains("memory_limit"));
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_php_site_deploys_pool_before_vhost() {
        let f = fixture();
        let mut new = NewSite::new("shop.example.com", SiteKind::Php);
        new.php_version = Some("8.2".to_string());
        new.allowed_functions = vec!["exec".to_string()];

        let res = f.sites.create(new).await;
        assert!(res.success, "{:?}", res);

        let calls = f.exec.calls();
        let pool_test = calls.iter().position(|c| c == "php-fpm8.2 -t").unwrap();
        let nginx_test = calls.iter().position(|c| c == "nginx -t").unwrap();
        assert!(pool_test < nginx_test);

        let id = site_id(&f, "shop.example.com").await;
        let site = f.store.get_site(id).await.unwrap();
        assert!(!site.disabled_functions().iter().any(|d| d == "exec"));
        assert!(site.disabled_functions().iter().any(|d| d == "system"));
    }

    #[tokio::test]
    async fn test_failed_vhost_validation_keeps_record_with_failed_status() {
        let f = fixture();
        f.exec.fail("nginx -t", 1, "nginx: [emerg] invalid parameter");

        let res = f.sites.create(NewSite::new("example.com", SiteKind::Static)).await;
        assert!(!res.success);

        let id = site_id(&f, "example.com").await;
        let site = f.store.get_site(id).await.unwrap();
        assert_eq!(site.status.nginx.state, DeployState::Failed);
        assert!(site.status.nginx.error.as_deref().unwrap().contains("invalid parameter"));
    }

    #[tokio::test]
    async fn test_update_switching_php_version_removes_old_pool() {
        let f = fixture();
        let mut new = NewSite::new("shop.example.com", SiteKind::Php);
        new.php_version = Some("8.2".to_string());
        assert!(f.sites.create(new).await.success);
        let id = site_id(&f, "shop.example.com").await;
        f.exec.clear_calls();

        let res = f
            .sites
            .update(
                id,
                SiteUpdate {
                    php_version: Some("8.3".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(res.success, "{:?}", res);
        let calls = f.exec.calls();
        let new_pool = calls.iter().position(|c| c == "php-fpm8.3 -t").unwrap();
        let old_removed = calls
            .iter()
            .position(|c| c == "rm -f /etc/php/8.2/fpm/pool.d/shop.example.com.conf")
            .unwrap();
        assert!(new_pool < old_removed);
        let site = f.store.get_site(id).await.unwrap();
        assert_eq!(site.php_version.as_deref(), Some("8.3"));
    }

    #[tokio::test]
    async fn test_failed_php_switch_keeps_old_pool() {
        let f = fixture();
        let mut new = NewSite::new("shop.example.com", SiteKind::Php);
        new.php_version = Some("8.2".to_string());
        assert!(f.sites.create(new).await.success);
        let id = site_id(&f, "shop.example.com").await;
        f.exec.clear_calls();
        f.exec.fail("php-fpm8.3 -t", 1, "ERROR: unable to bind listening socket");

        let res = f
            .sites
            .update(
                id,
                SiteUpdate {
                    php_version: Some("8.3".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(!res.success);
        assert!(!f
            .exec
            .calls()
            .contains(&"rm -f /etc/php/8.2/fpm/pool.d/shop.example.com.conf".to_string()));
    }

    #[tokio::test]
    async fn test_enable_ssl_requires_web_root() {
        let f = fixture();
        assert!(f.sites.create(NewSite::new("example.com", SiteKind::Static)).await.success);
        let id = site_id(&f, "example.com").await;
        f.exec.fail("test -d /var/www/example_com", 1, "");

        let res = f.sites.toggle_ssl(id, true).await;
        assert!(!res.success);
        assert!(res.error_text().contains("does not exist"));
        assert_eq!(f.exec.count("certbot"), 0);
    }

    #[tokio::test]
    async fn test_failed_certificate_reverts_ssl_flag() {
        let f = fixture();
        assert!(f.sites.create(NewSite::new("example.com", SiteKind::Static)).await.success);
        let id = site_id(&f, "example.com").await;
        f.exec.fail("certbot certonly", 1, "Challenge failed for domain example.com");

        let res = f.sites.toggle_ssl(id, true).await;
        assert!(!res.success);
        let site = f.store.get_site(id).await.unwrap();
        assert!(!site.ssl_enabled);
        assert_eq!(site.status.ssl.state, DeployState::Failed);
        assert!(site.status.ssl.error.as_deref().unwrap().contains("Challenge failed"));
    }

    #[tokio::test]
    async fn test_disable_ssl_retires_status() {
        let f = fixture();
        let mut new = NewSite::new("example.com", SiteKind::Static);
        new.ssl_enabled = true;
        new.www_redirect = WwwRedirect::ToNonWww;
        assert!(f.sites.create(new).await.success);
        let id = site_id(&f, "example.com").await;
        assert_eq!(f.store.get_site(id).await.unwrap().status.ssl.state, DeployState::Active);

        let res = f.sites.toggle_ssl(id, false).await;
        assert!(res.success, "{:?}", res);
        let site = f.store.get_site(id).await.unwrap();
        assert!(!site.ssl_enabled);
        assert_eq!(site.status.ssl.state, DeployState::None);
    }

    #[tokio::test]
    async fn test_delete_stops_when_vhost_removal_fails() {
        let f = fixture();
        assert!(f.sites.create(NewSite::new("example.com", SiteKind::Static)).await.success);
        let id = site_id(&f, "example.com").await;
        f.exec.fail("rm -f /etc/nginx/sites-available/example.com.conf", 1, "Read-only file system");

        let res = f.sites.delete(id).await;
        assert!(!res.success);
        let site = f.store.get_site(id).await.unwrap();
        assert_eq!(site.status.nginx.state, DeployState::Failed);
    }

    async fn synced_site(f: &Fixture) -> i64 {
        let mut new = NewSite::new("example.com", SiteKind::Static);
        new.www_redirect = WwwRedirect::ToWww;
        assert!(f.sites.create(new).await.success);
        let id = site_id(f, "example.com").await;
        let res = f.sites.dns_sync(id).await;
        assert!(res.success, "{:?}", res);
        id
    }

    #[tokio::test]
    async fn test_delete_removes_dns_records() {
        let f = fixture();
        let id = synced_site(&f).await;
        let site = f.store.get_site(id).await.unwrap();
        assert_eq!(site.dns.apex_record_id.as_deref(), Some("rec-1"));
        assert_eq!(site.dns.www_record_id.as_deref(), Some("rec-2"));

        let res = f.sites.delete(id).await;
        assert!(res.success, "{:?}", res);
        let calls = f.dns.calls();
        assert!(calls.contains(&"delete zone-1 rec-1".to_string()));
        assert!(calls.contains(&"delete zone-1 rec-2".to_string()));
        assert!(f.store.find_site_by_domain("example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_continues_when_dns_provider_fails() {
        let f = fixture_with_dns(ScriptedDns {
            fail_deletes: true,
            ..Default::default()
        });
        let id = synced_site(&f).await;

        let res = f.sites.delete(id).await;
        assert!(res.success, "{:?}", res);
        assert!(f.dns.calls().contains(&"delete zone-1 rec-1".to_string()));
        assert!(f.store.find_site_by_domain("example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pm2_rejects_non_node_site() {
        let f = fixture();
        assert!(f.sites.create(NewSite::new("example.com", SiteKind::Static)).await.success);
        let id = site_id(&f, "example.com").await;
        f.exec.clear_calls();

        let res = f.sites.pm2(id, Pm2Action::Start).await;
        assert!(!res.success);
        assert_eq!(f.exec.count("pm2"), 0);
    }

    #[tokio::test]
    async fn test_pm2_stop_clears_status() {
        let f = fixture();
        let mut new = NewSite::new("api.example.com", SiteKind::ReverseProxy);
        new.port = Some(3000);
        new.runtime = Some("node".to_string());
        assert!(f.sites.create(new).await.success);
        let id = site_id(&f, "api.example.com").await;

        assert!(f.sites.pm2(id, Pm2Action::Start).await.success);
        assert_eq!(f.store.get_site(id).await.unwrap().status.pm2.state, DeployState::Active);
        assert!(f.sites.pm2(id, Pm2Action::Stop).await.success);
        assert_eq!(f.store.get_site(id).await.unwrap().status.pm2.state, DeployState::None);
    }
}
