//! Command-line surface of the `hostpanel` binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand, ValueEnum};
use hp_core::model::{RestartPolicy, SiteKind, UnitType, WwwRedirect};
use hp_core::service::ServiceAction;
use hp_core::settings::CONFIG_PATH;
use hp_services::Pm2Action;

#[derive(Parser, Debug)]
#[command(name = "hostpanel")]
#[command(author, version, about = "Web hosting control panel orchestration daemon", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "HOSTPANEL_CONFIG", default_value = CONFIG_PATH)]
    pub config: PathBuf,

    /// Name recorded as the actor in audit events
    #[arg(long, env = "SUDO_USER", default_value = "cli")]
    pub actor: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the background actors until SIGINT or SIGTERM
    Serve,

    /// Apply database migrations
    Migrate,

    /// Validate the configuration file and print the resolved host layout
    CheckConfig,

    /// Website management
    #[command(subcommand)]
    Site(SiteCommands),

    /// User-defined systemd services
    #[command(subcommand)]
    Unit(UnitCommands),

    /// Catalog daemons (nginx, php-fpm, mysql, ...)
    #[command(subcommand)]
    Service(ServiceCommands),

    /// PM2 process list and logs
    #[command(subcommand)]
    Pm2(Pm2Commands),

    /// Let's Encrypt certificates
    #[command(subcommand)]
    Cert(CertCommands),

    /// Cloudflare DNS provider
    #[command(subcommand)]
    Dns(DnsCommands),

    /// Git-triggered deployments
    #[command(subcommand)]
    Deploy(DeployCommands),
}

#[derive(Subcommand, Debug)]
pub enum SiteCommands {
    List,
    Show {
        id: i64,
    },
    Create(SiteCreateArgs),
    Update {
        id: i64,
        #[command(flatten)]
        changes: SiteUpdateArgs,
    },
    /// Re-render and reload nginx (and PHP-FPM), then ensure the certificate
    Deploy {
        id: i64,
    },
    Delete {
        id: i64,
    },
    Ssl {
        id: i64,
        state: Toggle,
    },
    DnsSync {
        id: i64,
    },
    DnsRemove {
        id: i64,
    },
    Pm2 {
        id: i64,
        action: Pm2ActionArg,
    },
}

#[derive(Args, Debug)]
pub struct SiteCreateArgs {
    pub domain: String,
    #[arg(long, value_parser = SiteKind::from_str, default_value = "static")]
    pub kind: SiteKind,
    /// Defaults to /var/www/<domain with dots as underscores>
    #[arg(long)]
    pub root: Option<String>,
    /// Subdirectory of the root served as the document root
    #[arg(long)]
    pub working_dir: Option<String>,
    #[arg(long)]
    pub php_version: Option<String>,
    #[arg(long)]
    pub runtime: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub ssl: bool,
    #[arg(long, value_parser = WwwRedirect::from_str, default_value = "none")]
    pub www: WwwRedirect,
    /// PHP functions to allow out of the dangerous set
    #[arg(long, value_delimiter = ',')]
    pub allow: Vec<String>,
    /// PHP ini override, KEY=VALUE
    #[arg(long = "setting", value_parser = parse_key_val)]
    pub settings: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct SiteUpdateArgs {
    #[arg(long)]
    pub working_dir: Option<String>,
    #[arg(long)]
    pub php_version: Option<String>,
    #[arg(long)]
    pub runtime: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub ssl: Option<bool>,
    #[arg(long, value_parser = WwwRedirect::from_str)]
    pub www: Option<WwwRedirect>,
    #[arg(long, value_delimiter = ',')]
    pub allow: Option<Vec<String>>,
    #[arg(long = "setting", value_parser = parse_key_val)]
    pub settings: Vec<(String, String)>,
    #[arg(long)]
    pub active: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub enum UnitCommands {
    List,
    Show {
        id: i64,
    },
    Create(UnitCreateArgs),
    Update {
        id: i64,
        #[command(flatten)]
        changes: UnitUpdateArgs,
    },
    Delete {
        id: i64,
    },
    Control {
        id: i64,
        action: ActionArg,
    },
    Logs {
        id: i64,
        #[arg(short = 'n', long, default_value = "100")]
        lines: u32,
    },
    /// Query `systemctl is-active` for every unit and store the result
    Refresh,
}

#[derive(Args, Debug)]
pub struct UnitCreateArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub exec_start: String,
    #[arg(long)]
    pub working_dir: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long = "type", value_parser = UnitType::from_str)]
    pub unit_type: Option<UnitType>,
    #[arg(long, value_parser = RestartPolicy::from_str)]
    pub restart: Option<RestartPolicy>,
    #[arg(long)]
    pub restart_sec: Option<u32>,
    /// Environment variable, KEY=VALUE
    #[arg(long = "env", value_parser = parse_key_val)]
    pub environment: Vec<(String, String)>,
    /// Create the record without deploying it
    #[arg(long)]
    pub inactive: bool,
}

#[derive(Args, Debug)]
pub struct UnitUpdateArgs {
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub exec_start: Option<String>,
    #[arg(long)]
    pub working_dir: Option<String>,
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long = "type", value_parser = UnitType::from_str)]
    pub unit_type: Option<UnitType>,
    #[arg(long, value_parser = RestartPolicy::from_str)]
    pub restart: Option<RestartPolicy>,
    #[arg(long)]
    pub restart_sec: Option<u32>,
    /// Replaces the whole environment, KEY=VALUE
    #[arg(long = "env", value_parser = parse_key_val)]
    pub environment: Option<Vec<(String, String)>>,
    #[arg(long)]
    pub active: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub enum ServiceCommands {
    List,
    Status {
        key: String,
    },
    Control {
        key: String,
        action: ActionArg,
    },
    Logs {
        key: String,
        #[arg(short = 'n', long, default_value = "100")]
        lines: u32,
    },
}

#[derive(Subcommand, Debug)]
pub enum Pm2Commands {
    List,
    Logs {
        app: String,
        #[arg(short = 'n', long, default_value = "100")]
        lines: u32,
    },
}

#[derive(Subcommand, Debug)]
pub enum CertCommands {
    /// `certbot renew` for every lineage
    Renew,
    Info {
        domain: String,
    },
    Delete {
        domain: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum DnsCommands {
    VerifyToken,
    ServerIp,
}

#[derive(Subcommand, Debug)]
pub enum DeployCommands {
    Run {
        #[arg(long)]
        webhook_id: i64,
        #[arg(long)]
        dir: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        script: Option<String>,
        #[arg(long)]
        commit: Option<String>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    History {
        webhook_id: i64,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActionArg {
    Start,
    Stop,
    Restart,
    Reload,
}

impl From<ActionArg> for ServiceAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Start => ServiceAction::Start,
            ActionArg::Stop => ServiceAction::Stop,
            ActionArg::Restart => ServiceAction::Restart,
            ActionArg::Reload => ServiceAction::Reload,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Pm2ActionArg {
    Start,
    Stop,
    Restart,
}

impl From<Pm2ActionArg> for Pm2Action {
    fn from(arg: Pm2ActionArg) -> Self {
        match arg {
            Pm2ActionArg::Start => Pm2Action::Start,
            Pm2ActionArg::Stop => Pm2Action::Stop,
            Pm2ActionArg::Restart => Pm2Action::Restart,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// `KEY=VALUE` pairs as the newline separated unit environment.
pub fn environment_block(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn settings_map(pairs: Vec<(String, String)>) -> BTreeMap<String, String> {
    pairs.into_iter().collect()
}
