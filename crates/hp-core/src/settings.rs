//! Panel configuration loaded from a TOML file with environment overrides.
//!
//! Every field has a default so a missing file yields a usable config on a
//! stock Debian host.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::service::{ManagerOptions, OsFamily};

/// Default location of the configuration file.
pub const CONFIG_PATH: &str = "/etc/hostpanel/hostpanel.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub acme: AcmeSettings,
    #[serde(default)]
    pub actors: ActorSettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_database_url() -> String {
    "mysql://hostpanel@localhost/hostpanel".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSettings {
    /// Force an OS family instead of reading `os_release_path`.
    #[serde(default)]
    pub os_family: Option<OsFamily>,
    #[serde(default = "default_os_release_path")]
    pub os_release_path: PathBuf,
    /// Defaults to `www-data` on Debian and `nginx` on RHEL.
    #[serde(default)]
    pub web_user: Option<String>,
    #[serde(default)]
    pub web_group: Option<String>,
    #[serde(default = "default_php_versions")]
    pub php_versions: Vec<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            os_family: None,
            os_release_path: default_os_release_path(),
            web_user: None,
            web_group: None,
            php_versions: default_php_versions(),
        }
    }
}

fn default_os_release_path() -> PathBuf {
    PathBuf::from("/etc/os-release")
}

fn default_php_versions() -> Vec<String> {
    ["7.4", "8.0", "8.1", "8.2", "8.3", "8.4"]
        .iter()
        .map(|v| v.to_string())
        .collect()
}

/// Optional overrides of the per-family file layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathSettings {
    pub nginx_available_dir: Option<PathBuf>,
    pub nginx_enabled_dir: Option<PathBuf>,
    pub systemd_unit_dir: Option<PathBuf>,
    pub letsencrypt_live_dir: Option<PathBuf>,
    /// Where rendered files are staged before the privileged copy.
    pub staging_dir: Option<PathBuf>,
    /// Directory of per-site lock files.
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_status_secs")]
    pub status_secs: u64,
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
    #[serde(default = "default_certificate_secs")]
    pub certificate_secs: u64,
    #[serde(default = "default_deploy_secs")]
    pub deploy_secs: u64,
    #[serde(default = "default_http_secs")]
    pub http_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            status_secs: default_status_secs(),
            command_secs: default_command_secs(),
            certificate_secs: default_certificate_secs(),
            deploy_secs: default_deploy_secs(),
            http_secs: default_http_secs(),
        }
    }
}

fn default_status_secs() -> u64 {
    10
}

fn default_command_secs() -> u64 {
    60
}

fn default_certificate_secs() -> u64 {
    300
}

fn default_deploy_secs() -> u64 {
    600
}

fn default_http_secs() -> u64 {
    15
}

impl TimeoutSettings {
    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn certificate(&self) -> Duration {
        Duration::from_secs(self.certificate_secs)
    }

    pub fn deploy(&self) -> Duration {
        Duration::from_secs(self.deploy_secs)
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSettings {
    /// Cloudflare API token. DNS sync is disabled when unset.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_cloudflare_api")]
    pub api_base: String,
    #[serde(default)]
    pub proxied: bool,
    /// Public address to publish instead of detecting it.
    #[serde(default)]
    pub server_ip: Option<IpAddr>,
    #[serde(default = "default_ip_endpoints")]
    pub ip_endpoints: Vec<String>,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            api_token: None,
            api_base: default_cloudflare_api(),
            proxied: false,
            server_ip: None,
            ip_endpoints: default_ip_endpoints(),
        }
    }
}

fn default_cloudflare_api() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_ip_endpoints() -> Vec<String> {
    vec![
        "https://api.ipify.org".to_string(),
        "https://ifconfig.me/ip".to_string(),
        "https://icanhazip.com".to_string(),
    ]
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcmeSettings {
    /// Registration email. Defaults to `admin@<domain>`.
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorSettings {
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_unit_refresh_secs")]
    pub unit_refresh_secs: u64,
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval_secs(),
            unit_refresh_secs: default_unit_refresh_secs(),
            renewal_interval_secs: default_renewal_interval_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_status_interval_secs() -> u64 {
    30
}

fn default_unit_refresh_secs() -> u64 {
    60
}

fn default_renewal_interval_secs() -> u64 {
    12 * 60 * 60
}

fn default_max_parallel() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditSettings {
    #[serde(default = "default_audit_path")]
    pub log_path: PathBuf,
    /// Rotate the log once it grows past this many MiB.
    #[serde(default = "default_audit_max_size_mb")]
    pub max_size_mb: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            log_path: default_audit_path(),
            max_size_mb: default_audit_max_size_mb(),
        }
    }
}

impl AuditSettings {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

fn default_audit_max_size_mb() -> u64 {
    10
}

fn default_audit_path() -> PathBuf {
    PathBuf::from(crate::security::audit::AUDIT_LOG_PATH)
}

impl Settings {
    /// Load from `path`, or defaults when the file does not exist, then apply
    /// `HOSTPANEL_DATABASE_URL` and `CLOUDFLARE_API_TOKEN` from the environment.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let mut settings = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml(&content)?
        } else {
            info!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(url) = lookup("HOSTPANEL_DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.url = url;
        }
        if let Some(token) = lookup("CLOUDFLARE_API_TOKEN").filter(|v| !v.is_empty()) {
            self.dns.api_token = Some(token);
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        for version in &self.host.php_versions {
            crate::security::input::validate_php_version(version).map_err(|e| {
                SettingsError::Invalid {
                    key: "host.php_versions",
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(ref email) = self.acme.email {
            crate::security::input::validate_email(email).map_err(|e| SettingsError::Invalid {
                key: "acme.email",
                reason: e.to_string(),
            })?;
        }
        if self.audit.max_size_mb == 0 {
            return Err(SettingsError::Invalid {
                key: "audit.max_size_mb",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.actors.max_parallel == 0 {
            return Err(SettingsError::Invalid {
                key: "actors.max_parallel",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Resolved OS family: the override, else detection.
    pub fn os_family(&self) -> OsFamily {
        self.host
            .os_family
            .unwrap_or_else(|| OsFamily::detect(&self.host.os_release_path))
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            status_timeout: self.timeouts.status(),
            control_timeout: self.timeouts.command(),
            max_parallel: self.actors.max_parallel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.timeouts.status_secs, 10);
        assert_eq!(s.timeouts.certificate_secs, 300);
        assert!(s.dns.api_token.is_none());
        assert_eq!(s.host.php_versions.len(), 6);
        assert_eq!(s.actors.max_parallel, 16);
    }

    #[test]
    fn test_parses_sections() {
        let s = Settings::from_toml(
            r#"
            [host]
            os_family = "rhel"
            web_user = "nginx"
            php_versions = ["8.3"]

            [dns]
            api_token = "cf-token"
            proxied = true
            server_ip = "203.0.113.10"

            [timeouts]
            certificate_secs = 600
            "#,
        )
        .unwrap();
        assert_eq!(s.os_family(), OsFamily::Rhel);
        assert_eq!(s.host.web_user.as_deref(), Some("nginx"));
        assert_eq!(s.dns.api_token.as_deref(), Some("cf-token"));
        assert!(s.dns.proxied);
        assert_eq!(s.dns.server_ip.unwrap().to_string(), "203.0.113.10");
        assert_eq!(s.timeouts.certificate(), Duration::from_secs(600));
    }

    #[test]
    fn test_env_overrides() {
        let mut s = Settings::default();
        s.apply_env(|key| match key {
            "HOSTPANEL_DATABASE_URL" => Some("mysql://root@db/panel".to_string()),
            "CLOUDFLARE_API_TOKEN" => Some("from-env".to_string()),
            _ => None,
        });
        assert_eq!(s.database.url, "mysql://root@db/panel");
        assert_eq!(s.dns.api_token.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_rejects_bad_php_version() {
        let s = Settings::from_toml("[host]\nphp_versions = [\"8.2; rm -rf /\"]\n").unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_acme_email() {
        let s = Settings::from_toml("[acme]\nemail = \"not-an-email\"\n").unwrap();
        assert!(matches!(s.validate(), Err(SettingsError::Invalid { key: "acme.email", .. })));
    }

    #[test]
    fn test_audit_rotation_size() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.audit.max_size_bytes(), 10 * 1024 * 1024);

        let s = Settings::from_toml("[audit]\nmax_size_mb = 2\n").unwrap();
        assert_eq!(s.audit.max_size_bytes(), 2 * 1024 * 1024);

        let s = Settings::from_toml("[audit]\nmax_size_mb = 0\n").unwrap();
        assert!(matches!(s.validate(), Err(SettingsError::Invalid { key: "audit.max_size_mb", .. })));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let s = Settings::load(Path::new("/nonexistent/hostpanel.toml")).unwrap();
        assert_eq!(s.timeouts.command_secs, 60);
    }
}
