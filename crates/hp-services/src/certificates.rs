//! Let's Encrypt certificates through certbot's webroot plugin.
//!
//! certbot only obtains and renews certificates here; it never edits nginx
//! config. The vhost picks the files up from the live store on the next
//! deploy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use hp_core::layout::HostLayout;
use hp_core::model::{CertificateMeta, OperationResult, Site};
use hp_core::shell::{CommandSpec, ShellExecutor};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("No certificate installed for {0}")]
    Missing(String),
    #[error("Failed to read certificate: {0}")]
    Command(String),
    #[error("Unexpected openssl output: {0}")]
    Parse(String),
}

pub struct CertificateManager {
    executor: Arc<dyn ShellExecutor>,
    layout: Arc<HostLayout>,
    email: Option<String>,
    issue_timeout: Duration,
    query_timeout: Duration,
}

impl CertificateManager {
    pub fn new(
        executor: Arc<dyn ShellExecutor>,
        layout: Arc<HostLayout>,
        email: Option<String>,
        issue_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            layout,
            email,
            issue_timeout,
            query_timeout,
        }
    }

    /// Obtain (or expand) the certificate covering the site's domains.
    pub async fn request_certificate(&self, site: &Site) -> OperationResult {
        let webroot = site.web_root();
        if let Err(e) = self.prepare_challenge_dir(&webroot).await {
            error!(domain = %site.domain, error = %e, "Failed to prepare ACME challenge directory");
            return OperationResult::failed(format!("Failed to prepare challenge directory: {}", e));
        }

        let domains = site.certificate_domains();
        let email = self
            .email
            .clone()
            .unwrap_or_else(|| format!("admin@{}", site.primary_domain()));

        let mut cmd = CommandSpec::new("certbot").args(["certonly", "--webroot", "-w", webroot.as_str()]);
        for domain in &domains {
            cmd = cmd.arg("-d").arg(domain.as_str());
        }
        cmd = cmd
            .args(["--non-interactive", "--agree-tos", "--email", email.as_str(), "--expand"])
            .args(["--cert-name", site.primary_domain()])
            .elevated()
            .timeout(self.issue_timeout);

        info!(domain = %site.domain, domains = ?domains, webroot = %webroot, "Requesting certificate");
        let out = self.executor.run(cmd).await;
        if out.success() {
            info!(domain = %site.domain, "Certificate obtained");
            OperationResult::ok("SSL certificate obtained successfully")
        } else {
            error!(domain = %site.domain, error = %out.error_text(), "Certificate request failed");
            OperationResult::failed(out.error_text())
        }
    }

    async fn prepare_challenge_dir(&self, webroot: &str) -> Result<(), String> {
        let well_known = format!("{}/.well-known", webroot);
        let challenge = format!("{}/acme-challenge", well_known);
        let owner = format!("{}:{}", self.layout.web_user, self.layout.web_group);

        let steps = [
            CommandSpec::new("mkdir").args(["-p", challenge.as_str()]),
            CommandSpec::new("chmod").args(["755", well_known.as_str(), challenge.as_str()]),
            CommandSpec::new("chown").args(["-R", owner.as_str(), well_known.as_str()]),
        ];
        for step in steps {
            let out = self
                .executor
                .run(step.elevated().timeout(self.query_timeout))
                .await;
            if !out.success() {
                return Err(out.error_text());
            }
        }
        Ok(())
    }

    /// `certbot delete` for the lineage named after the primary domain.
    pub async fn delete_certificate(&self, domain: &str) -> OperationResult {
        let primary = domain.strip_prefix("www.").unwrap_or(domain);
        let out = self
            .executor
            .run(
                CommandSpec::new("certbot")
                    .args(["delete", "--cert-name", primary, "--non-interactive"])
                    .elevated()
                    .timeout(self.query_timeout),
            )
            .await;
        if out.success() {
            info!(domain = %primary, "Certificate deleted");
            OperationResult::ok("SSL certificate deleted")
        } else {
            OperationResult::failed(out.error_text())
        }
    }

    pub async fn renew_all(&self) -> OperationResult {
        let out = self
            .executor
            .run(
                CommandSpec::new("certbot")
                    .args(["renew", "--non-interactive"])
                    .elevated()
                    .timeout(self.issue_timeout),
            )
            .await;
        if out.success() {
            info!("Certificate renewal run completed");
            let summary = out.stdout.trim();
            OperationResult::ok(if summary.is_empty() {
                "Certificates renewed".to_string()
            } else {
                summary.to_string()
            })
        } else {
            warn!(error = %out.error_text(), "Certificate renewal failed");
            OperationResult::failed(out.error_text())
        }
    }

    /// Both the chain and the key exist in the live store.
    pub async fn certificate_exists(&self, domain: &str) -> bool {
        let paths = self.layout.certificate_paths(domain);
        for path in [&paths.fullchain, &paths.privkey] {
            let out = self
                .executor
                .run(
                    CommandSpec::new("test")
                        .args(["-f".to_string(), path.display().to_string()])
                        .elevated()
                        .timeout(self.query_timeout),
                )
                .await;
            if !out.success() {
                return false;
            }
        }
        true
    }

    /// Issuer and expiry of the live certificate.
    pub async fn certificate_info(&self, domain: &str) -> Result<CertificateMeta, CertificateError> {
        if !self.certificate_exists(domain).await {
            return Err(CertificateError::Missing(domain.to_string()));
        }
        let fullchain = self.layout.certificate_paths(domain).fullchain.display().to_string();
        let out = self
            .executor
            .run(
                CommandSpec::new("openssl")
                    .args(["x509", "-in", fullchain.as_str(), "-noout", "-issuer", "-enddate"])
                    .elevated()
                    .timeout(self.query_timeout),
            )
            .await;
        if !out.success() {
            return Err(CertificateError::Command(out.error_text()));
        }
        parse_x509_summary(&out.stdout)
    }
}

/// Parse `openssl x509 -noout -issuer -enddate` output.
pub fn parse_x509_summary(output: &str) -> Result<CertificateMeta, CertificateError> {
    let mut meta = CertificateMeta {
        checked_at: Some(Utc::now()),
        ..Default::default()
    };
    for line in output.lines() {
        let line = line.trim();
        if let Some(issuer) = line.strip_prefix("issuer=") {
            meta.issuer = Some(issuer.trim().to_string());
        } else if let Some(end) = line.strip_prefix("notAfter=") {
            // openssl pads single-digit days with a second space.
            let normalized = end.split_whitespace().collect::<Vec<_>>().join(" ");
            let parsed = NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
                .map_err(|e| CertificateError::Parse(format!("{}: {}", normalized, e)))?;
            meta.expires_at = Some(parsed.and_utc());
        }
    }
    if meta.expires_at.is_none() {
        return Err(CertificateError::Parse("missing notAfter".to_string()));
    }
    Ok(meta)
}
