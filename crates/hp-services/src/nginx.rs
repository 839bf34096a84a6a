use std::sync::Arc;
use std::time::Duration;

use hp_core::layout::{HostLayout, TlsPaths};
use hp_core::model::{OperationResult, Site};
use hp_core::render::{render_vhost, VhostModel};
use hp_core::service::ServiceManager;
use hp_core::shell::ShellExecutor;
use tracing::{info, warn};

use crate::installer::ConfigInstaller;
use crate::reconcile::{validator, Candidate, ReconcileError};

const NGINX_KEY: &str = "nginx";

/// Keeps each site's nginx vhost in line with its record.
pub struct NginxReconciler {
    executor: Arc<dyn ShellExecutor>,
    services: Arc<dyn ServiceManager>,
    installer: Arc<ConfigInstaller>,
    layout: Arc<HostLayout>,
    timeout: Duration,
}

impl NginxReconciler {
    pub fn new(
        executor: Arc<dyn ShellExecutor>,
        services: Arc<dyn ServiceManager>,
        installer: Arc<ConfigInstaller>,
        layout: Arc<HostLayout>,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            services,
            installer,
            layout,
            timeout,
        }
    }

    /// Render and install the vhost, validate with `nginx -t`, then reload.
    ///
    /// TLS is configured only when SSL is enabled and the live certificate
    /// files exist, so a site waiting for issuance still serves plain HTTP.
    pub async fn deploy_config(&self, site: &Site) -> OperationResult {
        match self.try_deploy(site).await {
            Ok(()) => {
                info!(domain = %site.domain, "Nginx configuration deployed");
                OperationResult::ok(format!("Nginx configuration deployed for {}", site.domain))
            }
            Err(e) => {
                warn!(domain = %site.domain, error = %e, "Nginx deploy failed");
                OperationResult::failed(e.to_string())
            }
        }
    }

    async fn try_deploy(&self, site: &Site) -> Result<(), ReconcileError> {
        let tls = self.tls_for(site).await;
        let model = VhostModel::for_site(site, &self.layout, tls)?;
        let content = render_vhost(&model)?;

        Candidate {
            path: self.layout.vhost_path(&site.domain),
            content,
            link: self.layout.vhost_link(&site.domain),
            validator: validator("nginx", self.timeout),
            installer: &self.installer,
        }
        .apply(self.executor.as_ref())
        .await?;

        let reload = self.services.reload(NGINX_KEY).await;
        if !reload.success {
            return Err(ReconcileError::Reload(reload.error_text().to_string()));
        }
        Ok(())
    }

    async fn tls_for(&self, site: &Site) -> Option<TlsPaths> {
        if !site.ssl_enabled {
            return None;
        }
        let paths = self.layout.certificate_paths(&site.domain);
        if self.installer.exists(&paths.fullchain).await && self.installer.exists(&paths.privkey).await {
            Some(paths)
        } else {
            warn!(domain = %site.domain, "SSL enabled but no certificate installed, serving HTTP only");
            None
        }
    }

    /// Remove the vhost (and its link) and reload. Missing files are fine.
    pub async fn delete_config(&self, site: &Site) -> OperationResult {
        if let Some(link) = self.layout.vhost_link(&site.domain) {
            if let Err(e) = self.installer.remove(&link).await {
                return OperationResult::failed(e.to_string());
            }
        }
        if let Err(e) = self.installer.remove(&self.layout.vhost_path(&site.domain)).await {
            return OperationResult::failed(e.to_string());
        }

        let reload = self.services.reload(NGINX_KEY).await;
        if !reload.success {
            return OperationResult::failed(format!(
                "Configuration removed but reload failed: {}",
                reload.error_text()
            ));
        }
        info!(domain = %site.domain, "Nginx configuration removed");
        OperationResult::ok(format!("Nginx configuration removed for {}", site.domain))
    }

    pub async fn reload(&self) -> OperationResult {
        self.services.reload(NGINX_KEY).await
    }

    pub async fn restart(&self) -> OperationResult {
        self.services.restart(NGINX_KEY).await
    }

    /// `nginx -t` against the live configuration.
    pub async fn test_config(&self) -> OperationResult {
        let out = self.executor.run(validator("nginx", self.timeout)).await;
        if out.success() {
            OperationResult::ok("Nginx configuration is valid")
        } else {
            OperationResult::failed(out.error_text())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::model::{SiteKind, WwwRedirect};
    use hp_core::service::{DebianServiceManager, ManagerOptions, OsFamily};
    use hp_core::shell::ScriptedExecutor;

    struct Fixture {
        exec: Arc<ScriptedExecutor>,
        nginx: NginxReconciler,
        _staging: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let staging = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let mut layout = HostLayout::for_family(OsFamily::Debian);
        layout.staging_dir = staging.path().to_path_buf();
        let services = Arc::new(DebianServiceManager::new(exec.clone(), &[], ManagerOptions::default()));
        let installer = Arc::new(ConfigInstaller::new(exec.clone(), staging.path(), Duration::from_secs(5)));
        let nginx = NginxReconciler::new(exec.clone(), services, installer, Arc::new(layout), Duration::from_secs(5));
        Fixture {
            exec,
            nginx,
            _staging: staging,
        }
    }

    fn site() -> Site {
        let mut site = Site::new("example.com", SiteKind::Static);
        site.www_redirect = WwwRedirect::ToNonWww;
        site
    }

    #[tokio::test]
    async fn test_deploy_installs_links_validates_and_reloads() {
        let f = fixture();
        let res = f.nginx.deploy_config(&site()).await;
        assert!(res.success, "{:?}", res);

        let calls = f.exec.calls();
        assert!(calls.iter().any(|c| c
            == "ln -sfn /etc/nginx/sites-available/example.com.conf /etc/nginx/sites-enabled/example.com.conf"));
        let test_at = calls.iter().position(|c| c == "nginx -t").unwrap();
        let reload_at = calls.iter().position(|c| c == "systemctl reload nginx").unwrap();
        assert!(test_at < reload_at);
    }

    #[tokio::test]
    async fn test_deploy_is_idempotent() {
        let f = fixture();
        assert!(f.nginx.deploy_config(&site()).await.success);
        let first = f.exec.calls();
        f.exec.clear_calls();
        assert!(f.nginx.deploy_config(&site()).await.success);
        let normalize = |calls: Vec<String>| {
            calls
                .into_iter()
                .map(|c| {
                    // Staged temp file names differ between runs.
                    if c.starts_with("cp /") && !c.starts_with("cp /etc") {
                        "cp <staged>".to_string()
                    } else {
                        c
                    }
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(normalize(first), normalize(f.exec.calls()));
    }

    #[tokio::test]
    async fn test_failed_validation_restores_previous_config() {
        let f = fixture();
        f.exec.fail("nginx -t", 1, "nginx: [emerg] unknown directive \"bogus\"");
        let res = f.nginx.deploy_config(&site()).await;

        assert!(!res.success);
        assert!(res.error_text().contains("unknown directive"));
        let calls = f.exec.calls();
        assert!(calls.contains(
            &"mv -f /etc/nginx/sites-available/example.com.conf.hp-bak /etc/nginx/sites-available/example.com.conf"
                .to_string()
        ));
        assert_eq!(f.exec.count("systemctl reload"), 0);
    }

    #[tokio::test]
    async fn test_failed_validation_without_previous_file_removes_it() {
        let f = fixture();
        f.exec.fail("test -f", 1, "");
        f.exec.fail("nginx -t", 1, "bad");
        assert!(!f.nginx.deploy_config(&site()).await.success);
        let calls = f.exec.calls();
        assert!(calls.contains(&"rm -f /etc/nginx/sites-available/example.com.conf".to_string()));
        assert!(calls.contains(&"rm -f /etc/nginx/sites-enabled/example.com.conf".to_string()));
    }

    #[tokio::test]
    async fn test_tls_only_with_installed_certificate() {
        let f = fixture();
        let mut s = site();
        s.ssl_enabled = true;
        f.exec.fail("test -f /etc/letsencrypt", 1, "");
        assert!(f.nginx.deploy_config(&s).await.success);
        assert_eq!(f.exec.count("test -f /etc/letsencrypt/live/example.com/fullchain.pem"), 1);
        // Key check is skipped once the chain is missing.
        assert_eq!(f.exec.count("test -f /etc/letsencrypt/live/example.com/privkey.pem"), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = fixture();
        let s = site();
        assert!(f.nginx.delete_config(&s).await.success);
        assert!(f.nginx.delete_config(&s).await.success);
        assert_eq!(f.exec.count("rm -f /etc/nginx/sites-available/example.com.conf"), 2);
    }

    #[tokio::test]
    async fn test_php_site_without_version_fails_before_any_command() {
        let f = fixture();
        let s = Site::new("php.example.com", SiteKind::Php);
        let res = f.nginx.deploy_config(&s).await;
        assert!(!res.success);
        assert!(res.error_text().contains("php_version"));
        assert!(f.exec.calls().iter().all(|c| !c.starts_with("cp")));
    }
}
