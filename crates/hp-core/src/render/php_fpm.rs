use std::collections::BTreeMap;

use crate::layout::HostLayout;
use crate::model::Site;

use super::{directive_value, RenderError};

/// Functions a shared-hosting pool disables unless the site allows them.
pub const DANGEROUS_FUNCTIONS: &[&str] = &[
    "exec",
    "passthru",
    "shell_exec",
    "system",
    "proc_open",
    "popen",
    "curl_exec",
    "curl_multi_exec",
    "parse_ini_file",
    "show_source",
];

/// Site settings forwarded to the pool as `php_admin_value`.
pub const PHP_INI_KEYS: &[&str] = &[
    "max_execution_time",
    "max_input_time",
    "max_input_vars",
    "memory_limit",
    "post_max_size",
    "upload_max_filesize",
];

/// `DANGEROUS_FUNCTIONS` minus `allowed`, in catalog order. Names in
/// `allowed` that are not dangerous are ignored.
pub fn disabled_functions<S: AsRef<str>>(allowed: &[S]) -> Vec<&'static str> {
    DANGEROUS_FUNCTIONS
        .iter()
        .copied()
        .filter(|f| !allowed.iter().any(|a| a.as_ref().trim() == *f))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolModel {
    pub pool_name: String,
    pub user: String,
    pub group: String,
    pub listen_socket: String,
    pub open_basedir: String,
    pub disabled_functions: Vec<String>,
    pub ini: BTreeMap<String, String>,
    pub max_children: u32,
}

impl PoolModel {
    pub fn for_site(site: &Site, layout: &HostLayout) -> Result<Self, RenderError> {
        let version = site.php_version.as_deref().ok_or(RenderError::MissingField {
            template: "php-fpm pool",
            field: "php_version",
        })?;
        let pool_name = site.pool_name();

        let ini = site
            .settings
            .iter()
            .filter(|(k, _)| PHP_INI_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let max_children = site
            .settings
            .get("pm.max_children")
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            listen_socket: layout.php_fpm_socket(version, &pool_name),
            pool_name,
            user: layout.web_user.clone(),
            group: layout.web_group.clone(),
            open_basedir: format!("{}:/tmp", site.root_path.trim_end_matches('/')),
            disabled_functions: site.disabled_functions(),
            ini,
            max_children,
        })
    }
}

pub fn render_pool(model: &PoolModel) -> Result<String, RenderError> {
    directive_value("pool_name", &model.pool_name)?;
    directive_value("user", &model.user)?;
    directive_value("group", &model.group)?;
    directive_value("listen", &model.listen_socket)?;
    directive_value("open_basedir", &model.open_basedir)?;

    let mut out = format!(
        "\
[{pool}]
user = {user}
group = {group}

listen = {socket}
listen.owner = {user}
listen.group = {group}
listen.mode = 0660

pm = dynamic
pm.max_children = {max_children}
pm.start_servers = 2
pm.min_spare_servers = 1
pm.max_spare_servers = 3

chdir = /

php_admin_value[open_basedir] = {open_basedir}
",
        pool = model.pool_name,
        user = model.user,
        group = model.group,
        socket = model.listen_socket,
        max_children = model.max_children.max(1),
        open_basedir = model.open_basedir,
    );

    if !model.disabled_functions.is_empty() {
        for f in &model.disabled_functions {
            directive_value("disable_functions", f)?;
        }
        out.push_str(&format!(
            "php_admin_value[disable_functions] = {}\n",
            model.disabled_functions.join(",")
        ));
    }

    for (key, value) in &model.ini {
        directive_value(key, value)?;
        out.push_str(&format!("php_admin_value[{}] = {}\n", key, value));
    }

    Ok(out)
}
