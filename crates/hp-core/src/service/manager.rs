use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::catalog::{debian_units, rhel_units, KnownUnit, OsFamily};
use super::fanout::fan_out;
use super::status::{parse_ps_usage, parse_systemctl_status, UnitState};
use crate::model::OperationResult;
use crate::shell::{CommandSpec, ExitState, ShellExecutor};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service not supported: {0}")]
    NotSupported(String),
    #[error("systemctl command failed: {0}")]
    CommandFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Restart => "restarted",
            Self::Reload => "reloaded",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeouts and fan-out width used by a service manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub status_timeout: Duration,
    pub control_timeout: Duration,
    pub max_parallel: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(10),
            control_timeout: Duration::from_secs(60),
            max_parallel: 16,
        }
    }
}

/// Status of one catalog unit. Optional fields are absent when the unit is
/// not running or the process table has no entry for its PID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatus {
    pub key: String,
    pub display_name: String,
    pub unit_name: String,
    pub installed: bool,
    pub running: bool,
    pub enabled: bool,
    pub state: UnitState,
    pub pid: Option<u32>,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub uptime: Option<String>,
}

/// Controls the daemons in a static per-OS-family catalog.
///
/// Implementors supply the catalog, the executor and options; the
/// behaviour is shared. Keys outside the catalog are rejected before any
/// command runs.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    fn os_family(&self) -> OsFamily;

    fn known_units(&self) -> &BTreeMap<String, KnownUnit>;

    fn executor(&self) -> &dyn ShellExecutor;

    fn options(&self) -> &ManagerOptions;

    fn unit(&self, key: &str) -> Result<&KnownUnit, ServiceError> {
        self.known_units()
            .get(key)
            .ok_or_else(|| ServiceError::NotSupported(key.to_string()))
    }

    async fn status(&self, key: &str) -> Result<UnitStatus, ServiceError> {
        let unit = self.unit(key)?;
        query_status(self.executor(), key, unit, self.options()).await
    }

    /// Status of every installed catalog unit, queried concurrently.
    async fn list_all_statuses(&self) -> BTreeMap<String, UnitStatus> {
        let units: Vec<(String, KnownUnit)> = self
            .known_units()
            .iter()
            .map(|(key, unit)| (key.clone(), unit.clone()))
            .collect();
        let executor = self.executor();
        let options = self.options();

        let results = fan_out(
            units,
            options.max_parallel,
            |(key, unit): (String, KnownUnit)| async move {
                let result = query_status(executor, &key, &unit, options).await;
                (key, result)
            },
        )
        .await;

        let mut statuses = BTreeMap::new();
        for (key, result) in results {
            match result {
                Ok(status) if status.installed => {
                    statuses.insert(key, status);
                }
                Ok(_) => debug!(service = %key, "Unit not installed, skipping"),
                Err(e) => warn!(service = %key, error = %e, "Failed to query unit status"),
            }
        }
        statuses
    }

    async fn start(&self, key: &str) -> OperationResult {
        self.control(key, ServiceAction::Start).await
    }

    async fn stop(&self, key: &str) -> OperationResult {
        self.control(key, ServiceAction::Stop).await
    }

    async fn restart(&self, key: &str) -> OperationResult {
        self.control(key, ServiceAction::Restart).await
    }

    /// Reload, or restart when the unit cannot reload.
    async fn reload(&self, key: &str) -> OperationResult {
        self.control(key, ServiceAction::Reload).await
    }

    async fn control(&self, key: &str, action: ServiceAction) -> OperationResult {
        let unit = match self.unit(key) {
            Ok(unit) => unit,
            Err(e) => return OperationResult::failed(e.to_string()),
        };

        let action = if action == ServiceAction::Reload && !unit.supports_reload {
            debug!(service = %key, "Reload unsupported, restarting instead");
            ServiceAction::Restart
        } else {
            action
        };

        let out = self
            .executor()
            .run(
                CommandSpec::new("systemctl")
                    .args([action.as_str(), unit.unit_name.as_str()])
                    .elevated()
                    .timeout(self.options().control_timeout),
            )
            .await;

        if out.success() {
            info!(service = %key, action = %action, "Service action completed");
            OperationResult::ok(format!("{} {}", unit.display_name, action.past_tense()))
        } else {
            warn!(service = %key, action = %action, error = %out.error_text(), "Service action failed");
            OperationResult::failed(format!(
                "Failed to {} {}: {}",
                action,
                unit.display_name,
                out.error_text()
            ))
        }
    }

    /// Last `lines` journal lines for the unit.
    async fn logs(&self, key: &str, lines: u32) -> Result<String, ServiceError> {
        let unit = self.unit(key)?;
        let out = self
            .executor()
            .run(
                CommandSpec::new("journalctl")
                    .args(["-u", unit.unit_name.as_str(), "-n"])
                    .arg(lines.to_string())
                    .arg("--no-pager")
                    .elevated()
                    .timeout(self.options().status_timeout),
            )
            .await;
        if !out.success() {
            return Err(ServiceError::CommandFailed(out.error_text()));
        }
        Ok(out.stdout)
    }
}

async fn query_status(
    executor: &dyn ShellExecutor,
    key: &str,
    unit: &KnownUnit,
    options: &ManagerOptions,
) -> Result<UnitStatus, ServiceError> {
    let out = executor
        .run(
            CommandSpec::new("systemctl")
                .args(["status", unit.unit_name.as_str(), "--no-pager"])
                .timeout(options.status_timeout),
        )
        .await;

    // systemctl status exits 3 for inactive units, so only hard failures count.
    if matches!(
        out.state,
        ExitState::TimedOut | ExitState::NotFound | ExitState::SpawnFailed(_)
    ) {
        return Err(ServiceError::CommandFailed(out.error_text()));
    }

    let text = format!("{}\n{}", out.stdout, out.stderr);
    let parsed = parse_systemctl_status(&text);
    let running = parsed.running();
    let pid = if running { parsed.main_pid } else { None };

    let usage = match pid {
        Some(pid) => process_usage(executor, pid, options).await,
        None => None,
    };

    Ok(UnitStatus {
        key: key.to_string(),
        display_name: unit.display_name.clone(),
        unit_name: unit.unit_name.clone(),
        installed: parsed.found,
        running,
        enabled: parsed.enabled,
        state: parsed.state(),
        pid,
        cpu_percent: usage.map(|(cpu, _)| cpu),
        memory_percent: usage.map(|(_, mem)| mem),
        uptime: if running { parsed.since.clone() } else { None },
    })
}

/// CPU and memory percentages from the process table. `None` when the
/// process is gone.
async fn process_usage(
    executor: &dyn ShellExecutor,
    pid: u32,
    options: &ManagerOptions,
) -> Option<(f32, f32)> {
    let out = executor
        .run(
            CommandSpec::new("ps")
                .args(["-p", &pid.to_string(), "-o", "%cpu=,%mem="])
                .timeout(options.status_timeout),
        )
        .await;
    if !out.success() {
        return None;
    }
    parse_ps_usage(&out.stdout)
}

/// Debian / Ubuntu service manager.
pub struct DebianServiceManager {
    executor: Arc<dyn ShellExecutor>,
    units: BTreeMap<String, KnownUnit>,
    options: ManagerOptions,
}

impl DebianServiceManager {
    pub fn new(
        executor: Arc<dyn ShellExecutor>,
        php_versions: &[String],
        options: ManagerOptions,
    ) -> Self {
        Self {
            executor,
            units: debian_units(php_versions),
            options,
        }
    }
}

#[async_trait]
impl ServiceManager for DebianServiceManager {
    fn os_family(&self) -> OsFamily {
        OsFamily::Debian
    }

    fn known_units(&self) -> &BTreeMap<String, KnownUnit> {
        &self.units
    }

    fn executor(&self) -> &dyn ShellExecutor {
        self.executor.as_ref()
    }

    fn options(&self) -> &ManagerOptions {
        &self.options
    }
}

/// RHEL / Rocky / Alma service manager.
pub struct RhelServiceManager {
    executor: Arc<dyn ShellExecutor>,
    units: BTreeMap<String, KnownUnit>,
    options: ManagerOptions,
}

impl RhelServiceManager {
    pub fn new(
        executor: Arc<dyn ShellExecutor>,
        php_versions: &[String],
        options: ManagerOptions,
    ) -> Self {
        Self {
            executor,
            units: rhel_units(php_versions),
            options,
        }
    }
}

#[async_trait]
impl ServiceManager for RhelServiceManager {
    fn os_family(&self) -> OsFamily {
        OsFamily::Rhel
    }

    fn known_units(&self) -> &BTreeMap<String, KnownUnit> {
        &self.units
    }

    fn executor(&self) -> &dyn ShellExecutor {
        self.executor.as_ref()
    }

    fn options(&self) -> &ManagerOptions {
        &self.options
    }
}

/// Build the service manager for an OS family.
pub fn service_manager_for(
    family: OsFamily,
    executor: Arc<dyn ShellExecutor>,
    php_versions: &[String],
    options: ManagerOptions,
) -> Arc<dyn ServiceManager> {
    match family {
        OsFamily::Debian => Arc::new(DebianServiceManager::new(executor, php_versions, options)),
        OsFamily::Rhel => Arc::new(RhelServiceManager::new(executor, php_versions, options)),
    }
}
