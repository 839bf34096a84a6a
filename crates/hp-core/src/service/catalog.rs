use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Distribution family, which decides unit names and file layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    #[default]
    Debian,
    Rhel,
}

impl OsFamily {
    /// Classify from the contents of `/etc/os-release` using `ID` and `ID_LIKE`.
    pub fn from_os_release(content: &str) -> Option<Self> {
        let mut ids = Vec::new();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim() == "ID" || key.trim() == "ID_LIKE" {
                let value = value.trim().trim_matches('"').to_ascii_lowercase();
                ids.extend(value.split_whitespace().map(str::to_string));
            }
        }

        ids.iter().find_map(|id| match id.as_str() {
            "debian" | "ubuntu" => Some(Self::Debian),
            "rhel" | "centos" | "fedora" | "rocky" | "almalinux" => Some(Self::Rhel),
            _ => None,
        })
    }

    /// Read `/etc/os-release` (or the given path), falling back to Debian.
    pub fn detect(os_release: &Path) -> Self {
        match std::fs::read_to_string(os_release) {
            Ok(content) => match Self::from_os_release(&content) {
                Some(family) => {
                    debug!(family = %family, "Detected OS family");
                    family
                }
                None => {
                    warn!(path = %os_release.display(), "Unrecognised OS family, assuming debian");
                    Self::Debian
                }
            },
            Err(e) => {
                warn!(path = %os_release.display(), error = %e, "Cannot read os-release, assuming debian");
                Self::Debian
            }
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debian => f.write_str("debian"),
            Self::Rhel => f.write_str("rhel"),
        }
    }
}

impl FromStr for OsFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debian" | "ubuntu" => Ok(Self::Debian),
            "rhel" | "centos" | "rocky" | "almalinux" | "fedora" => Ok(Self::Rhel),
            other => Err(format!("unknown OS family: {}", other)),
        }
    }
}

/// A daemon the panel is allowed to control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownUnit {
    pub display_name: String,
    pub unit_name: String,
    pub supports_reload: bool,
}

impl KnownUnit {
    fn new(display_name: &str, unit_name: &str, supports_reload: bool) -> Self {
        Self {
            display_name: display_name.to_string(),
            unit_name: unit_name.to_string(),
            supports_reload,
        }
    }
}

/// Catalog key of the PHP-FPM daemon for a version, identical across families.
pub fn php_fpm_key(version: &str) -> String {
    format!("php{}-fpm", version)
}

/// Units on Debian and Ubuntu hosts.
pub fn debian_units(php_versions: &[String]) -> BTreeMap<String, KnownUnit> {
    let mut units = BTreeMap::new();
    units.insert("nginx".into(), KnownUnit::new("Nginx", "nginx", true));
    units.insert("mysql".into(), KnownUnit::new("MySQL", "mysql", false));
    units.insert("redis".into(), KnownUnit::new("Redis", "redis-server", false));
    units.insert("supervisor".into(), KnownUnit::new("Supervisor", "supervisor", false));
    units.insert("cron".into(), KnownUnit::new("Cron", "cron", false));
    units.insert("ssh".into(), KnownUnit::new("OpenSSH", "ssh", true));
    units.insert("fail2ban".into(), KnownUnit::new("Fail2ban", "fail2ban", true));
    units.insert("ufw".into(), KnownUnit::new("UFW", "ufw", false));
    for version in php_versions {
        units.insert(
            php_fpm_key(version),
            KnownUnit::new(
                &format!("PHP {} FPM", version),
                &format!("php{}-fpm", version),
                true,
            ),
        );
    }
    units
}

/// Units on RHEL-family hosts (Remi PHP packages).
pub fn rhel_units(php_versions: &[String]) -> BTreeMap<String, KnownUnit> {
    let mut units = BTreeMap::new();
    units.insert("nginx".into(), KnownUnit::new("Nginx", "nginx", true));
    units.insert("mysql".into(), KnownUnit::new("MariaDB", "mariadb", false));
    units.insert("redis".into(), KnownUnit::new("Redis", "redis", false));
    units.insert("supervisor".into(), KnownUnit::new("Supervisor", "supervisord", false));
    units.insert("cron".into(), KnownUnit::new("Cron", "crond", false));
    units.insert("ssh".into(), KnownUnit::new("OpenSSH", "sshd", true));
    units.insert("fail2ban".into(), KnownUnit::new("Fail2ban", "fail2ban", true));
    units.insert("firewalld".into(), KnownUnit::new("firewalld", "firewalld", true));
    for version in php_versions {
        let compact = version.replace('.', "");
        units.insert(
            php_fpm_key(version),
            KnownUnit::new(
                &format!("PHP {} FPM", version),
                &format!("php{}-php-fpm", compact),
                true,
            ),
        );
    }
    units
}
