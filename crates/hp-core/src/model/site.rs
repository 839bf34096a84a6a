use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeploymentStatus, ParseEnumError};

/// Settings key holding the comma separated PHP `disable_functions` list.
pub const DISABLE_FUNCTIONS_KEY: &str = "disable_functions";

/// How a site's requests are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteKind {
    #[serde(rename = "static")]
    Static,
    #[serde(rename = "php")]
    Php,
    #[serde(rename = "reverse-proxy")]
    ReverseProxy,
}

impl SiteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Php => "php",
            Self::ReverseProxy => "reverse-proxy",
        }
    }
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "php" => Ok(Self::Php),
            "reverse-proxy" | "reverse_proxy" => Ok(Self::ReverseProxy),
            other => Err(ParseEnumError::new("site kind", other)),
        }
    }
}

/// Canonical-host policy between `domain` and `www.domain`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WwwRedirect {
    #[default]
    None,
    ToWww,
    ToNonWww,
}

impl WwwRedirect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ToWww => "to_www",
            Self::ToNonWww => "to_non_www",
        }
    }
}

impl fmt::Display for WwwRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WwwRedirect {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "to_www" => Ok(Self::ToWww),
            "to_non_www" => Ok(Self::ToNonWww),
            other => Err(ParseEnumError::new("www redirect", other)),
        }
    }
}

/// Provider-side identifiers of the site's A records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordState {
    pub zone_id: Option<String>,
    pub apex_record_id: Option<String>,
    pub www_record_id: Option<String>,
    pub server_ip: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl DnsRecordState {
    pub fn has_records(&self) -> bool {
        self.apex_record_id.is_some() || self.www_record_id.is_some()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Last observed metadata of the site's certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub issuer: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub domain: String,
    pub root_path: String,
    pub working_directory: String,
    pub kind: SiteKind,
    pub php_version: Option<String>,
    pub runtime: Option<String>,
    pub settings: BTreeMap<String, String>,
    pub port: Option<u16>,
    pub ssl_enabled: bool,
    pub www_redirect: WwwRedirect,
    pub is_active: bool,
    pub status: DeploymentStatus,
    pub dns: DnsRecordState,
    pub certificate: CertificateMeta,
}

impl Site {
    /// A site with defaults derived from the domain. The id is assigned by
    /// the store on insert.
    pub fn new(domain: impl Into<String>, kind: SiteKind) -> Self {
        let domain = domain.into();
        Self {
            id: 0,
            root_path: Self::default_root_path(&domain),
            working_directory: "/".to_string(),
            domain,
            kind,
            php_version: None,
            runtime: None,
            settings: BTreeMap::new(),
            port: None,
            ssl_enabled: false,
            www_redirect: WwwRedirect::None,
            is_active: true,
            status: DeploymentStatus::default(),
            dns: DnsRecordState::default(),
            certificate: CertificateMeta::default(),
        }
    }

    /// `/var/www/<domain without leading www., dots replaced by underscores>`
    pub fn default_root_path(domain: &str) -> String {
        let bare = domain.strip_prefix("www.").unwrap_or(domain);
        format!("/var/www/{}", bare.replace('.', "_"))
    }

    /// The domain without a leading `www.`.
    pub fn primary_domain(&self) -> &str {
        self.domain.strip_prefix("www.").unwrap_or(&self.domain)
    }

    pub fn www_domain(&self) -> String {
        format!("www.{}", self.primary_domain())
    }

    /// Whether the `www.` host is served (and certified, and published).
    pub fn includes_www(&self) -> bool {
        self.www_redirect != WwwRedirect::None
    }

    /// Directory the web server serves from: root path joined with the
    /// working subdirectory.
    pub fn web_root(&self) -> String {
        let root = self.root_path.trim_end_matches('/');
        let sub = self.working_directory.trim_matches('/');
        if sub.is_empty() {
            root.to_string()
        } else {
            format!("{}/{}", root, sub)
        }
    }

    /// Domains to put on the certificate.
    pub fn certificate_domains(&self) -> Vec<String> {
        let mut domains = vec![self.domain.clone()];
        if self.includes_www() {
            let www = self.www_domain();
            if www != self.domain {
                domains.push(www);
            }
        }
        domains
    }

    /// Process supervisor key: the domain with dots replaced by dashes.
    pub fn app_key(&self) -> String {
        self.domain.replace('.', "-")
    }

    /// PHP-FPM pool name for this site.
    pub fn pool_name(&self) -> String {
        self.domain.replace('.', "_")
    }

    pub fn is_node_app(&self) -> bool {
        self.kind == SiteKind::ReverseProxy
            && self
                .runtime
                .as_deref()
                .map(|r| r.to_ascii_lowercase().contains("node"))
                .unwrap_or(false)
    }

    /// Functions currently disabled in this site's PHP pool.
    pub fn disabled_functions(&self) -> Vec<String> {
        self.settings
            .get(DISABLE_FUNCTIONS_KEY)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_disabled_functions<S: AsRef<str>>(&mut self, functions: &[S]) {
        let joined = functions
            .iter()
            .map(|f| f.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.settings.insert(DISABLE_FUNCTIONS_KEY.to_string(), joined);
    }
}

/// Input for creating a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSite {
    pub domain: String,
    pub kind: SiteKind,
    #[serde(default)]
    pub root_path: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub www_redirect: WwwRedirect,
    /// PHP functions to keep enabled; every other dangerous function is disabled.
    #[serde(default)]
    pub allowed_functions: Vec<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl NewSite {
    pub fn new(domain: impl Into<String>, kind: SiteKind) -> Self {
        Self {
            domain: domain.into(),
            kind,
            root_path: None,
            working_directory: None,
            php_version: None,
            runtime: None,
            port: None,
            ssl_enabled: false,
            www_redirect: WwwRedirect::None,
            allowed_functions: Vec::new(),
            settings: BTreeMap::new(),
        }
    }
}

/// Mutable fields of an existing site. Domain and root path never change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteUpdate {
    pub working_directory: Option<String>,
    pub php_version: Option<String>,
    pub runtime: Option<String>,
    pub port: Option<u16>,
    pub ssl_enabled: Option<bool>,
    pub www_redirect: Option<WwwRedirect>,
    pub allowed_functions: Option<Vec<String>>,
    pub settings: Option<BTreeMap<String, String>>,
    pub is_active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_root_path_strips_www_and_dots() {
        assert_eq!(Site::default_root_path("www.example.com"), "/var/www/example_com");
        assert_eq!(Site::default_root_path("blog.example.co.uk"), "/var/www/blog_example_co_uk");
    }

    #[test]
    fn test_web_root_joins_working_directory() {
        let mut site = Site::new("example.com", SiteKind::Static);
        assert_eq!(site.web_root(), "/var/www/example_com");
        site.working_directory = "/public/".into();
        assert_eq!(site.web_root(), "/var/www/example_com/public");
    }

    #[test]
    fn test_certificate_domains_follow_www_policy() {
        let mut site = Site::new("example.com", SiteKind::Static);
        assert_eq!(site.certificate_domains(), vec!["example.com"]);

        site.www_redirect = WwwRedirect::ToWww;
        assert_eq!(site.certificate_domains(), vec!["example.com", "www.example.com"]);

        site.www_redirect = WwwRedirect::ToNonWww;
        assert_eq!(site.certificate_domains(), vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_app_key_and_pool_name() {
        let site = Site::new("my.app.io", SiteKind::ReverseProxy);
        assert_eq!(site.app_key(), "my-app-io");
        assert_eq!(site.pool_name(), "my_app_io");
    }

    #[test]
    fn test_node_app_requires_reverse_proxy_and_node_runtime() {
        let mut site = Site::new("app.io", SiteKind::ReverseProxy);
        assert!(!site.is_node_app());
        site.runtime = Some("Node.js".into());
        assert!(site.is_node_app());
        site.kind = SiteKind::Php;
        assert!(!site.is_node_app());
    }

    #[test]
    fn test_disabled_functions_roundtrip_through_settings() {
        let mut site = Site::new("example.com", SiteKind::Php);
        assert!(site.disabled_functions().is_empty());
        site.set_disabled_functions(&["exec", "system"]);
        assert_eq!(site.settings[DISABLE_FUNCTIONS_KEY], "exec,system");
        assert_eq!(site.disabled_functions(), vec!["exec", "system"]);
    }

    #[test]
    fn test_kind_parses_storage_names() {
        assert_eq!("reverse-proxy".parse::<SiteKind>().unwrap(), SiteKind::ReverseProxy);
        assert_eq!("to_non_www".parse::<WwwRedirect>().unwrap(), WwwRedirect::ToNonWww);
        assert!("docker".parse::<SiteKind>().is_err());
    }
}
