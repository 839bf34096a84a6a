//! Where things live on disk for each OS family.

use std::path::PathBuf;

use serde::Serialize;

use crate::service::OsFamily;
use crate::settings::Settings;

const LOCK_DIR: &str = "/run/hostpanel/locks";

/// Certificate and key files of a live certificate lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsPaths {
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostLayout {
    pub family: OsFamily,
    pub nginx_available_dir: PathBuf,
    /// Debian keeps a symlink per enabled vhost; RHEL loads `conf.d` directly.
    pub nginx_enabled_dir: Option<PathBuf>,
    pub systemd_unit_dir: PathBuf,
    pub letsencrypt_live_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Per-site lock files shared by every hostpanel process.
    pub lock_dir: PathBuf,
    pub web_user: String,
    pub web_group: String,
}

impl HostLayout {
    pub fn for_family(family: OsFamily) -> Self {
        match family {
            OsFamily::Debian => Self {
                family,
                nginx_available_dir: PathBuf::from("/etc/nginx/sites-available"),
                nginx_enabled_dir: Some(PathBuf::from("/etc/nginx/sites-enabled")),
                systemd_unit_dir: PathBuf::from("/etc/systemd/system"),
                letsencrypt_live_dir: PathBuf::from("/etc/letsencrypt/live"),
                staging_dir: std::env::temp_dir(),
                lock_dir: PathBuf::from(LOCK_DIR),
                web_user: "www-data".to_string(),
                web_group: "www-data".to_string(),
            },
            OsFamily::Rhel => Self {
                family,
                nginx_available_dir: PathBuf::from("/etc/nginx/conf.d"),
                nginx_enabled_dir: None,
                systemd_unit_dir: PathBuf::from("/etc/systemd/system"),
                letsencrypt_live_dir: PathBuf::from("/etc/letsencrypt/live"),
                staging_dir: std::env::temp_dir(),
                lock_dir: PathBuf::from(LOCK_DIR),
                web_user: "nginx".to_string(),
                web_group: "nginx".to_string(),
            },
        }
    }

    /// Family defaults with the overrides from `[paths]` and `[host]` applied.
    pub fn from_settings(settings: &Settings, family: OsFamily) -> Self {
        let mut layout = Self::for_family(family);
        let paths = &settings.paths;
        if let Some(ref dir) = paths.nginx_available_dir {
            layout.nginx_available_dir = dir.clone();
        }
        if let Some(ref dir) = paths.nginx_enabled_dir {
            layout.nginx_enabled_dir = Some(dir.clone());
        }
        if let Some(ref dir) = paths.systemd_unit_dir {
            layout.systemd_unit_dir = dir.clone();
        }
        if let Some(ref dir) = paths.letsencrypt_live_dir {
            layout.letsencrypt_live_dir = dir.clone();
        }
        if let Some(ref dir) = paths.staging_dir {
            layout.staging_dir = dir.clone();
        }
        if let Some(ref dir) = paths.lock_dir {
            layout.lock_dir = dir.clone();
        }
        if let Some(ref user) = settings.host.web_user {
            layout.web_user = user.clone();
        }
        if let Some(ref group) = settings.host.web_group {
            layout.web_group = group.clone();
        } else if settings.host.web_user.is_some() {
            layout.web_group = layout.web_user.clone();
        }
        layout
    }

    pub fn vhost_path(&self, domain: &str) -> PathBuf {
        self.nginx_available_dir.join(format!("{}.conf", domain))
    }

    pub fn vhost_link(&self, domain: &str) -> Option<PathBuf> {
        self.nginx_enabled_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.conf", domain)))
    }

    pub fn php_pool_dir(&self, version: &str) -> PathBuf {
        match self.family {
            OsFamily::Debian => PathBuf::from(format!("/etc/php/{}/fpm/pool.d", version)),
            OsFamily::Rhel => PathBuf::from(format!(
                "/etc/opt/remi/php{}/php-fpm.d",
                version.replace('.', "")
            )),
        }
    }

    pub fn php_pool_path(&self, version: &str, domain: &str) -> PathBuf {
        self.php_pool_dir(version).join(format!("{}.conf", domain))
    }

    pub fn php_fpm_socket(&self, version: &str, pool: &str) -> String {
        match self.family {
            OsFamily::Debian => format!("/run/php/php{}-fpm-{}.sock", version, pool),
            OsFamily::Rhel => format!(
                "/var/opt/remi/php{}/run/php-fpm/{}.sock",
                version.replace('.', ""),
                pool
            ),
        }
    }

    /// Binary used for `-t` config validation.
    pub fn php_fpm_binary(&self, version: &str) -> String {
        match self.family {
            OsFamily::Debian => format!("php-fpm{}", version),
            OsFamily::Rhel => format!(
                "/opt/remi/php{}/root/usr/sbin/php-fpm",
                version.replace('.', "")
            ),
        }
    }

    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.systemd_unit_dir.join(format!("{}.service", name))
    }

    /// Live certificate files for a domain. A leading `www.` is ignored since
    /// the lineage is named after the bare domain.
    pub fn certificate_paths(&self, domain: &str) -> TlsPaths {
        let primary = domain.strip_prefix("www.").unwrap_or(domain);
        let dir = self.letsencrypt_live_dir.join(primary);
        TlsPaths {
            fullchain: dir.join("fullchain.pem"),
            privkey: dir.join("privkey.pem"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debian_paths() {
        let layout = HostLayout::for_family(OsFamily::Debian);
        assert_eq!(
            layout.vhost_path("example.com"),
            PathBuf::from("/etc/nginx/sites-available/example.com.conf")
        );
        assert_eq!(
            layout.vhost_link("example.com"),
            Some(PathBuf::from("/etc/nginx/sites-enabled/example.com.conf"))
        );
        assert_eq!(
            layout.php_pool_path("8.2", "example.com"),
            PathBuf::from("/etc/php/8.2/fpm/pool.d/example.com.conf")
        );
        assert_eq!(layout.php_fpm_binary("8.2"), "php-fpm8.2");
    }

    #[test]
    fn test_lock_dir_override() {
        let layout = HostLayout::for_family(OsFamily::Debian);
        assert_eq!(layout.lock_dir, PathBuf::from("/run/hostpanel/locks"));

        let settings = Settings::from_toml("[paths]\nlock_dir = \"/var/lock/hostpanel\"\n").unwrap();
        let layout = HostLayout::from_settings(&settings, OsFamily::Debian);
        assert_eq!(layout.lock_dir, PathBuf::from("/var/lock/hostpanel"));
    }

    #[test]
    fn test_rhel_paths() {
        let layout = HostLayout::for_family(OsFamily::Rhel);
        assert_eq!(layout.vhost_link("example.com"), None);
        assert_eq!(layout.web_user, "nginx");
        assert_eq!(
            layout.php_fpm_socket("8.3", "example_com"),
            "/var/opt/remi/php83/run/php-fpm/example_com.sock"
        );
    }

    #[test]
    fn test_certificate_paths_strip_www() {
        let layout = HostLayout::for_family(OsFamily::Debian);
        let paths = layout.certificate_paths("www.example.com");
        assert_eq!(
            paths.fullchain,
            PathBuf::from("/etc/letsencrypt/live/example.com/fullchain.pem")
        );
    }

    #[test]
    fn test_settings_overrides() {
        let settings = Settings::from_toml(
            "[host]\nweb_user = \"deploy\"\n[paths]\nsystemd_unit_dir = \"/tmp/units\"\n",
        )
        .unwrap();
        let layout = HostLayout::from_settings(&settings, OsFamily::Debian);
        assert_eq!(layout.web_user, "deploy");
        assert_eq!(layout.web_group, "deploy");
        assert_eq!(layout.unit_path("api"), PathBuf::from("/tmp/units/api.service"));
    }
}
