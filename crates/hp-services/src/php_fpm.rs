use std::sync::Arc;
use std::time::Duration;

use hp_core::layout::HostLayout;
use hp_core::model::{OperationResult, Site, SiteKind};
use hp_core::render::{render_pool, PoolModel};
use hp_core::service::{php_fpm_key, ServiceManager};
use hp_core::shell::ShellExecutor;
use tracing::{info, warn};

use crate::installer::ConfigInstaller;
use crate::reconcile::{validator, Candidate, ReconcileError};

/// Keeps each PHP site's FPM pool in line with its record.
pub struct PhpFpmReconciler {
    executor: Arc<dyn ShellExecutor>,
    services: Arc<dyn ServiceManager>,
    installer: Arc<ConfigInstaller>,
    layout: Arc<HostLayout>,
    timeout: Duration,
}

impl PhpFpmReconciler {
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

    /// Render and install the pool, validate with `php-fpm<ver> -t`, then
    /// reload that version's FPM daemon.
    pub async fn deploy_config(&self, site: &Site) -> OperationResult {
        match self.try_deploy(site).await {
            Ok(version) => {
                info!(domain = %site.domain, php = %version, "PHP-FPM pool deployed");
                OperationResult::ok(format!("PHP-FPM pool deployed for {}", site.domain))
            }
            Err(e) => {
                warn!(domain = %site.domain, error = %e, "PHP-FPM deploy failed");
                OperationResult::failed(e.to_string())
            }
        }
    }

    async fn try_deploy(&self, site: &Site) -> Result<String, ReconcileError> {
        if site.kind != SiteKind::Php {
            return Err(ReconcileError::NotApplicable(format!(
                "{} is not a PHP site",
                site.domain
            )));
        }
        let model = PoolModel::for_site(site, &self.layout)?;
        let content = render_pool(&model)?;
        // for_site has already rejected a missing version.
        let version = site.php_version.clone().unwrap_or_default();

        Candidate {
            path: self.layout.php_pool_path(&version, &site.domain),
            content,
            link: None,
            validator: validator(self.layout.php_fpm_binary(&version), self.timeout),
            installer: &self.installer,
        }
        .apply(self.executor.as_ref())
        .await?;

        let reload = self.services.reload(&php_fpm_key(&version)).await;
        if !reload.success {
            return Err(ReconcileError::Reload(reload.error_text().to_string()));
        }
        Ok(version)
    }

    /// Remove the pool for the site's current PHP version and reload.
    pub async fn delete_config(&self, site: &Site) -> OperationResult {
        match site.php_version.as_deref() {
            Some(version) => self.delete_pool(version, &site.domain).await,
            None => OperationResult::ok(format!("No PHP-FPM pool configured for {}", site.domain)),
        }
    }

    /// Remove a pool by version, used when a site moves to another version.
    pub async fn delete_pool(&self, version: &str, domain: &str) -> OperationResult {
        if let Err(e) = self.installer.remove(&self.layout.php_pool_path(version, domain)).await {
            return OperationResult::failed(e.to_string());
        }
        let reload = self.services.reload(&php_fpm_key(version)).await;
        if !reload.success {
            return OperationResult::failed(format!(
                "Pool removed but reload failed: {}",
                reload.error_text()
            ));
        }
        info!(domain = %domain, php = %version, "PHP-FPM pool removed");
        OperationResult::ok(format!("PHP-FPM pool removed for {}", domain))
    }

    pub async fn reload(&self, version: &str) -> OperationResult {
        self.services.reload(&php_fpm_key(version)).await
    }

    pub async fn restart(&self, version: &str) -> OperationResult {
        self.services.restart(&php_fpm_key(version)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::render::{disabled_functions, DANGEROUS_FUNCTIONS};
    use hp_core::service::{DebianServiceManager, ManagerOptions, OsFamily};
    use hp_core::shell::ScriptedExecutor;

    fn reconciler(exec: Arc<ScriptedExecutor>, staging: &std::path::Path) -> PhpFpmReconciler {
        let services = Arc::new(DebianServiceManager::new(
            exec.clone(),
            &["8.2".to_string()],
            ManagerOptions::default(),
        ));
        let installer = Arc::new(ConfigInstaller::new(exec.clone(), staging, Duration::from_secs(5)));
        PhpFpmReconciler::new(
            exec,
            services,
            installer,
            Arc::new(HostLayout::for_family(OsFamily::Debian)),
            Duration::from_secs(5),
        )
    }

    fn php_site() -> Site {
        let mut site = Site::new("shop.example.com", SiteKind::Php);
        site.php_version = Some("8.2".to_string());
        site.set_disabled_functions(&disabled_functions(&["exec"]));
        site
    }

    #[tokio::test]
    async fn test_deploy_validates_with_versioned_binary() {
        let staging = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let res = reconciler(exec.clone(), staging.path()).deploy_config(&php_site()).await;
        assert!(res.success, "{:?}", res);

        let calls = exec.calls();
        assert!(calls.contains(&"mv -f /etc/php/8.2/fpm/pool.d/shop.example.com.conf.hp-new /etc/php/8.2/fpm/pool.d/shop.example.com.conf".to_string()));
        assert!(calls.contains(&"php-fpm8.2 -t".to_string()));
        assert_eq!(calls.last().unwrap(), "systemctl reload php8.2-fpm");
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_daemon_untouched() {
        let staging = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("php-fpm8.2 -t", 78, "ERROR: [pool shop_example_com] invalid value");
        let res = reconciler(exec.clone(), staging.path()).deploy_config(&php_site()).await;
        assert!(!res.success);
        assert!(res.error_text().contains("invalid value"));
        assert_eq!(exec.count("systemctl"), 0);
    }

    #[tokio::test]
    async fn test_non_php_site_is_rejected() {
        let staging = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let site = Site::new("static.example.com", SiteKind::Static);
        assert!(!reconciler(exec.clone(), staging.path()).deploy_config(&site).await.success);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_version_is_noop() {
        let staging = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let site = Site::new("static.example.com", SiteKind::Php);
        assert!(reconciler(exec.clone(), staging.path()).delete_config(&site).await.success);
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_allow_list_subtracts_from_dangerous_set() {
        let site = php_site();
        let disabled = site.disabled_functions();
        assert_eq!(disabled.len(), DANGEROUS_FUNCTIONS.len() - 1);
        assert!(!disabled.iter().any(|f| f == "exec"));
    }
}
