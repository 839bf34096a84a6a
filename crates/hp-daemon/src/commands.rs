//! Subcommand handlers. Results go to stdout as JSON, logs go to stderr.

use std::process::ExitCode;

use anyhow::{Context, Result};
use hp_core::model::{CommitInfo, NewSite, OperationResult, SiteUpdate, SystemUnit, UnitUpdate};
use hp_core::security::audit::AuditAction;
use hp_core::settings::Settings;
use hp_services::DeployTarget;
use serde::Serialize;
use serde_json::json;

use crate::app::{self, Host, Panel};
use crate::cli::{
    environment_block, settings_map, CertCommands, Cli, Commands, DeployCommands, DnsCommands,
    Pm2Commands, ServiceCommands, SiteCommands, SiteCreateArgs, SiteUpdateArgs, Toggle,
    UnitCommands, UnitCreateArgs, UnitUpdateArgs,
};
use crate::serve;

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::CheckConfig => check_config(settings, &cli.actor),
        Commands::Migrate => {
            let db = app::connect(&settings).await?;
            db.migrate().await.context("Failed to apply migrations")?;
            report(OperationResult::ok("Migrations applied"))
        }
        Commands::Serve => {
            let panel = Panel::open(Host::new(settings, &cli.actor)?).await?;
            serve::run(panel).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Service(cmd) => service(Host::new(settings, &cli.actor)?, cmd).await,
        Commands::Pm2(cmd) => pm2(Host::new(settings, &cli.actor)?, cmd).await,
        Commands::Cert(cmd) => cert(Host::new(settings, &cli.actor)?, cmd).await,
        Commands::Dns(cmd) => dns(Host::new(settings, &cli.actor)?, cmd).await,
        Commands::Site(cmd) => site(Panel::open(Host::new(settings, &cli.actor)?).await?, cmd).await,
        Commands::Unit(cmd) => unit(Panel::open(Host::new(settings, &cli.actor)?).await?, cmd).await,
        Commands::Deploy(cmd) => deploy(Panel::open(Host::new(settings, &cli.actor)?).await?, cmd).await,
    }
}

fn emit<T: Serialize>(value: &T) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}

fn report(result: OperationResult) -> Result<ExitCode> {
    emit(&result)?;
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check_config(settings: Settings, actor: &str) -> Result<ExitCode> {
    let host = Host::new(settings, actor)?;
    let s = &host.settings;
    emit(&json!({
        "layout": &*host.layout,
        "php_versions": s.host.php_versions,
        "dns_configured": s.dns.api_token.is_some(),
        "dns_proxied": s.dns.proxied,
        "audit_log": s.audit.log_path,
        "timeouts": {
            "status_secs": s.timeouts.status_secs,
            "command_secs": s.timeouts.command_secs,
            "certificate_secs": s.timeouts.certificate_secs,
            "deploy_secs": s.timeouts.deploy_secs,
        },
    }))
}

async fn service(host: Host, cmd: ServiceCommands) -> Result<ExitCode> {
    match cmd {
        ServiceCommands::List => emit(&host.control.list_services().await),
        ServiceCommands::Status { key } => emit(&host.control.get_service(&key).await?),
        ServiceCommands::Control { key, action } => {
            report(host.control.control_service(&key, action.into()).await)
        }
        ServiceCommands::Logs { key, lines } => {
            print!("{}", host.control.logs(&key, lines).await?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn pm2(host: Host, cmd: Pm2Commands) -> Result<ExitCode> {
    match cmd {
        Pm2Commands::List => emit(&host.pm2.list_all().await?),
        Pm2Commands::Logs { app, lines } => {
            print!("{}", host.pm2.logs(&app, lines).await?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn cert(host: Host, cmd: CertCommands) -> Result<ExitCode> {
    match cmd {
        CertCommands::Renew => {
            let result = host.certificates.renew_all().await;
            report(host.audit.record(AuditAction::CertificateRenew, "*", result))
        }
        CertCommands::Info { domain } => emit(&host.certificates.certificate_info(&domain).await?),
        CertCommands::Delete { domain } => {
            let result = host.certificates.delete_certificate(&domain).await;
            report(host.audit.record(AuditAction::CertificateDelete, &domain, result))
        }
    }
}

async fn dns(host: Host, cmd: DnsCommands) -> Result<ExitCode> {
    let engine = host.dns_tools()?;
    match cmd {
        DnsCommands::VerifyToken => report(engine.verify_token().await),
        DnsCommands::ServerIp => report(engine.server_ip().await),
    }
}

async fn site(panel: Panel, cmd: SiteCommands) -> Result<ExitCode> {
    let sites = &panel.websites;
    match cmd {
        SiteCommands::List => emit(&sites.list().await?),
        SiteCommands::Show { id } => emit(&sites.get(id).await?),
        SiteCommands::Create(args) => report(sites.create(new_site(args)).await),
        SiteCommands::Update { id, changes } => report(sites.update(id, site_update(changes)).await),
        SiteCommands::Deploy { id } => report(sites.redeploy(id).await),
        SiteCommands::Delete { id } => report(sites.delete(id).await),
        SiteCommands::Ssl { id, state } => report(sites.toggle_ssl(id, matches!(state, Toggle::On)).await),
        SiteCommands::DnsSync { id } => report(sites.dns_sync(id).await),
        SiteCommands::DnsRemove { id } => report(sites.dns_remove(id).await),
        SiteCommands::Pm2 { id, action } => report(sites.pm2(id, action.into()).await),
    }
}

fn new_site(args: SiteCreateArgs) -> NewSite {
    let mut site = NewSite::new(args.domain, args.kind);
    site.root_path = args.root;
    site.working_directory = args.working_dir;
    site.php_version = args.php_version;
    site.runtime = args.runtime;
    site.port = args.port;
    site.ssl_enabled = args.ssl;
    site.www_redirect = args.www;
    site.allowed_functions = args.allow;
    site.settings = settings_map(args.settings);
    site
}

fn site_update(args: SiteUpdateArgs) -> SiteUpdate {
    SiteUpdate {
        working_directory: args.working_dir,
        php_version: args.php_version,
        runtime: args.runtime,
        port: args.port,
        ssl_enabled: args.ssl,
        www_redirect: args.www,
        allowed_functions: args.allow,
        settings: (!args.settings.is_empty()).then(|| settings_map(args.settings)),
        is_active: args.active,
    }
}

async fn unit(panel: Panel, cmd: UnitCommands) -> Result<ExitCode> {
    let units = &panel.units;
    match cmd {
        UnitCommands::List => emit(&units.list().await?),
        UnitCommands::Show { id } => emit(&units.get(id).await?),
        UnitCommands::Create(args) => report(units.create(new_unit(args)).await),
        UnitCommands::Update { id, changes } => report(units.update(id, unit_update(changes)).await),
        UnitCommands::Delete { id } => report(units.delete(id).await),
        UnitCommands::Control { id, action } => report(units.control(id, action.into()).await),
        UnitCommands::Logs { id, lines } => report(units.logs(id, lines).await),
        UnitCommands::Refresh => emit(&units.refresh_all().await),
    }
}

fn new_unit(args: UnitCreateArgs) -> SystemUnit {
    let mut unit = SystemUnit::new(args.name, args.exec_start, args.working_dir);
    if let Some(description) = args.description {
        unit.description = description;
    }
    if let Some(user) = args.user {
        unit.user = user;
    }
    if let Some(unit_type) = args.unit_type {
        unit.unit_type = unit_type;
    }
    if let Some(restart) = args.restart {
        unit.restart = restart;
    }
    if let Some(secs) = args.restart_sec {
        unit.restart_sec = secs;
    }
    unit.environment = environment_block(&args.environment);
    unit.is_active = !args.inactive;
    unit
}

fn unit_update(args: UnitUpdateArgs) -> UnitUpdate {
    UnitUpdate {
        description: args.description,
        exec_start: args.exec_start,
        working_directory: args.working_dir,
        user: args.user,
        unit_type: args.unit_type,
        restart: args.restart,
        restart_sec: args.restart_sec,
        environment: args.environment.map(|pairs| environment_block(&pairs)),
        standard_output: None,
        standard_error: None,
        is_active: args.active,
    }
}

async fn deploy(panel: Panel, cmd: DeployCommands) -> Result<ExitCode> {
    match cmd {
        DeployCommands::Run {
            webhook_id,
            dir,
            branch,
            script,
            commit,
            message,
            author,
        } => {
            let target = DeployTarget {
                webhook_id,
                directory: dir,
                branch,
                script,
            };
            let commit = CommitInfo {
                hash: commit,
                message,
                author,
            };
            report(panel.deployments.run(&target, commit).await)
        }
        DeployCommands::History { webhook_id, limit } => {
            emit(&panel.deployments.history(webhook_id, limit).await?)
        }
    }
}
