//! Lifecycle of panel-managed systemd units.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hp_core::layout::HostLayout;
use hp_core::model::{OperationResult, SystemUnit, UnitUpdate};
use hp_core::render::render_unit;
use hp_core::security::audit::AuditAction;
use hp_core::security::input::{validate_absolute_path, validate_unit_name, validate_username};
use hp_core::service::{fan_out, ServiceAction};
use hp_core::shell::{CommandSpec, ShellExecutor};
use hp_core::store::{StoreError, UnitStore};
use tracing::{info, warn};

use crate::audit::Auditor;
use crate::installer::ConfigInstaller;
use crate::pipeline::{Step, StepAction, StepRunner};

/// Installs, removes and controls unit files.
pub struct UnitLifecycle {
    executor: Arc<dyn ShellExecutor>,
    installer: Arc<ConfigInstaller>,
    layout: Arc<HostLayout>,
    timeout: Duration,
    status_timeout: Duration,
    max_parallel: usize,
}

impl UnitLifecycle {
    pub fn new(
        executor: Arc<dyn ShellExecutor>,
        installer: Arc<ConfigInstaller>,
        layout: Arc<HostLayout>,
        timeout: Duration,
        status_timeout: Duration,
        max_parallel: usize,
    ) -> Self {
        Self {
            executor,
            installer,
            layout,
            timeout,
            status_timeout,
            max_parallel,
        }
    }

    fn systemctl(&self, args: &[&str]) -> StepAction {
        StepAction::Run(
            CommandSpec::new("systemctl")
                .args(args.iter().copied())
                .elevated()
                .timeout(self.timeout),
        )
    }

    /// Write the unit file, reload systemd, enable and start. Stops at the
    /// first failing step.
    pub async fn deploy(&self, unit: &SystemUnit) -> OperationResult {
        if let Err(e) = validate_unit_name(&unit.name) {
            return OperationResult::failed(e.to_string());
        }
        let content = match render_unit(unit) {
            Ok(content) => content,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let service = unit.file_name();

        let steps = vec![
            Step::required(
                "write service file",
                StepAction::Install {
                    path: self.layout.unit_path(&unit.name),
                    content,
                },
            ),
            Step::required("reload systemd", self.systemctl(&["daemon-reload"])),
            Step::required("enable service", self.systemctl(&["enable", service.as_str()])),
            Step::required("start service", self.systemctl(&["start", service.as_str()])),
        ];

        let report = StepRunner::new(self.executor.as_ref(), &self.installer)
            .run(steps)
            .await;
        if report.success() {
            info!(unit = %unit.name, "Unit deployed");
        }
        report.into_result("Service deployed successfully")
    }

    /// Stop and disable (best-effort), then remove the file and reload.
    pub async fn undeploy(&self, unit: &SystemUnit) -> OperationResult {
        if let Err(e) = validate_unit_name(&unit.name) {
            return OperationResult::failed(e.to_string());
        }
        let service = unit.file_name();

        let steps = vec![
            Step::best_effort("stop service", self.systemctl(&["stop", service.as_str()])),
            Step::best_effort("disable service", self.systemctl(&["disable", service.as_str()])),
            Step::required(
                "delete service file",
                StepAction::Remove(self.layout.unit_path(&unit.name)),
            ),
            Step::required("reload systemd", self.systemctl(&["daemon-reload"])),
        ];

        let report = StepRunner::new(self.executor.as_ref(), &self.installer)
            .run(steps)
            .await;
        if report.success() {
            info!(unit = %unit.name, "Unit undeployed");
        }
        report.into_result("Service undeployed successfully")
    }

    pub async fn control(&self, unit: &SystemUnit, action: ServiceAction) -> OperationResult {
        if let Err(e) = validate_unit_name(&unit.name) {
            return OperationResult::failed(e.to_string());
        }
        let out = self
            .executor
            .run(
                CommandSpec::new("systemctl")
                    .args([action.as_str().to_string(), unit.file_name()])
                    .elevated()
                    .timeout(self.timeout),
            )
            .await;
        if out.success() {
            OperationResult::ok(format!("{} {}", unit.name, action.past_tense()))
        } else {
            OperationResult::failed(format!(
                "Failed to {} {}: {}",
                action,
                unit.name,
                out.error_text()
            ))
        }
    }

    /// `systemctl is-active` text, `unknown` when nothing was printed.
    pub async fn status(&self, name: &str) -> String {
        let out = self
            .executor
            .run(
                CommandSpec::new("systemctl")
                    .args(["is-active".to_string(), format!("{}.service", name)])
                    .timeout(self.status_timeout),
            )
            .await;
        // is-active exits non-zero for inactive units but still prints the state.
        let text = out.stdout.trim();
        if text.is_empty() {
            "unknown".to_string()
        } else {
            text.to_string()
        }
    }

    /// Status of many units at once, keyed by name.
    pub async fn statuses(&self, names: Vec<String>) -> BTreeMap<String, String> {
        fan_out(names, self.max_parallel, |name: String| async move {
            let status = self.status(&name).await;
            (name, status)
        })
        .await
        .into_iter()
        .collect()
    }

    pub async fn logs(&self, name: &str, lines: u32) -> OperationResult {
        if let Err(e) = validate_unit_name(name) {
            return OperationResult::failed(e.to_string());
        }
        let out = self
            .executor
            .run(
                CommandSpec::new("journalctl")
                    .args(["-u".to_string(), format!("{}.service", name), "-n".to_string()])
                    .arg(lines.to_string())
                    .arg("--no-pager")
                    .elevated()
                    .timeout(self.status_timeout),
            )
            .await;
        if out.success() {
            OperationResult::ok(out.stdout)
        } else {
            OperationResult::failed(out.error_text())
        }
    }
}

/// Unit records plus their on-host counterpart.
pub struct UnitService {
    lifecycle: Arc<UnitLifecycle>,
    store: Arc<dyn UnitStore>,
    audit: Auditor,
}

impl UnitService {
    pub fn new(lifecycle: Arc<UnitLifecycle>, store: Arc<dyn UnitStore>, audit: Auditor) -> Self {
        Self {
            lifecycle,
            store,
            audit,
        }
    }

    pub async fn get(&self, id: i64) -> Result<SystemUnit, StoreError> {
        self.store.get_unit(id).await
    }

    pub async fn list(&self) -> Result<Vec<SystemUnit>, StoreError> {
        self.store.list_units().await
    }

    fn validate(unit: &SystemUnit) -> Result<(), String> {
        validate_unit_name(&unit.name).map_err(|e| e.to_string())?;
        validate_username(&unit.user).map_err(|e| e.to_string())?;
        validate_absolute_path(&unit.working_directory).map_err(|e| e.to_string())?;
        if unit.exec_start.trim().is_empty() {
            return Err("Start command is required".to_string());
        }
        Ok(())
    }

    /// Insert the record and deploy it when active.
    pub async fn create(&self, mut unit: SystemUnit) -> OperationResult {
        if let Err(e) = Self::validate(&unit) {
            return OperationResult::failed(e);
        }
        match self.store.find_unit_by_name(&unit.name).await {
            Ok(Some(_)) => {
                return OperationResult::failed(format!("Service {} already exists", unit.name))
            }
            Ok(None) => {}
            Err(e) => return OperationResult::failed(e.to_string()),
        }
        unit.id = match self.store.insert_unit(&unit).await {
            Ok(id) => id,
            Err(e) => return OperationResult::failed(e.to_string()),
        };

        if !unit.is_active {
            return OperationResult::ok(format!("Service {} created (id {})", unit.name, unit.id));
        }
        let result = self.deploy_and_save(&mut unit).await;
        self.audit.record(AuditAction::UnitDeploy, &unit.name, result)
    }

    /// Apply edits and redeploy, or undeploy when it was deactivated.
    pub async fn update(&self, id: i64, changes: UnitUpdate) -> OperationResult {
        let mut unit = match self.store.get_unit(id).await {
            Ok(unit) => unit,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let was_active = unit.is_active;
        changes.apply(&mut unit);
        if let Err(e) = Self::validate(&unit) {
            return OperationResult::failed(e);
        }
        if let Err(e) = self.store.save_unit(&unit).await {
            return OperationResult::failed(e.to_string());
        }

        if unit.is_active {
            let result = self.deploy_and_save(&mut unit).await;
            self.audit.record(AuditAction::UnitDeploy, &unit.name, result)
        } else if was_active {
            let result = self.lifecycle.undeploy(&unit).await;
            self.refresh_one(&mut unit).await;
            self.audit.record(AuditAction::UnitUndeploy, &unit.name, result)
        } else {
            OperationResult::ok(format!("Service {} updated", unit.name))
        }
    }

    /// Undeploy, then drop the record. The record stays when a required
    /// undeploy step fails.
    pub async fn delete(&self, id: i64) -> OperationResult {
        let unit = match self.store.get_unit(id).await {
            Ok(unit) => unit,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let result = self.lifecycle.undeploy(&unit).await;
        if !result.success {
            return self.audit.record(AuditAction::UnitUndeploy, &unit.name, result);
        }
        let result = match self.store.delete_unit(id).await {
            Ok(()) => OperationResult::ok(format!("Service {} deleted", unit.name)),
            Err(e) => OperationResult::failed(e.to_string()),
        };
        self.audit.record(AuditAction::UnitUndeploy, &unit.name, result)
    }

    pub async fn control(&self, id: i64, action: ServiceAction) -> OperationResult {
        let mut unit = match self.store.get_unit(id).await {
            Ok(unit) => unit,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let result = self.lifecycle.control(&unit, action).await;
        self.refresh_one(&mut unit).await;
        self.audit.record(AuditAction::UnitControl, &unit.name, result)
    }

    pub async fn logs(&self, id: i64, lines: u32) -> OperationResult {
        match self.store.get_unit(id).await {
            Ok(unit) => self.lifecycle.logs(&unit.name, lines).await,
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    /// Refresh the observed status of every unit concurrently and persist it.
    pub async fn refresh_all(&self) -> BTreeMap<String, String> {
        let units = match self.store.list_units().await {
            Ok(units) => units,
            Err(e) => {
                warn!(error = %e, "Failed to list units");
                return BTreeMap::new();
            }
        };
        let statuses = self
            .lifecycle
            .statuses(units.iter().map(|u| u.name.clone()).collect())
            .await;
        for mut unit in units {
            let status = statuses.get(&unit.name).cloned();
            if unit.status != status {
                unit.status = status;
                if let Err(e) = self.store.save_unit(&unit).await {
                    warn!(unit = %unit.name, error = %e, "Failed to save unit status");
                }
            }
        }
        statuses
    }

    async fn deploy_and_save(&self, unit: &mut SystemUnit) -> OperationResult {
        let result = self.lifecycle.deploy(unit).await;
        self.refresh_one(unit).await;
        result
    }

    async fn refresh_one(&self, unit: &mut SystemUnit) {
        unit.status = Some(self.lifecycle.status(&unit.name).await);
        if let Err(e) = self.store.save_unit(unit).await {
            warn!(unit = %unit.name, error = %e, "Failed to save unit status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::security::audit::InMemoryAuditLogger;
    use hp_core::service::OsFamily;
    use hp_core::shell::ScriptedExecutor;
    use hp_core::store::MemoryStore;
    use std::time::Instant;

    fn lifecycle(exec: Arc<ScriptedExecutor>) -> UnitLifecycle {
        let installer = Arc::new(ConfigInstaller::new(
            exec.clone(),
            std::env::temp_dir(),
            Duration::from_secs(5),
        ));
        UnitLifecycle::new(
            exec,
            installer,
            Arc::new(HostLayout::for_family(OsFamily::Debian)),
            Duration::from_secs(30),
            Duration::from_secs(5),
            16,
        )
    }

    fn unit() -> SystemUnit {
        let mut unit = SystemUnit::new("queue-worker", "/usr/bin/php artisan queue:work", "/var/www/app");
        unit.is_active = true;
        unit
    }

    #[tokio::test]
    async fn test_deploy_runs_all_steps_in_order() {
        let exec = Arc::new(ScriptedExecutor::new());
        let res = lifecycle(exec.clone()).deploy(&unit()).await;
        assert!(res.success, "{:?}", res);
        let systemctl: Vec<String> = exec
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("systemctl"))
            .collect();
        assert_eq!(
            systemctl,
            vec![
                "systemctl daemon-reload",
                "systemctl enable queue-worker.service",
                "systemctl start queue-worker.service",
            ]
        );
        assert!(exec
            .calls()
            .contains(&"mv -f /etc/systemd/system/queue-worker.service.hp-new /etc/systemd/system/queue-worker.service".to_string()));
    }

    #[tokio::test]
    async fn test_write_failure_short_circuits() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("chmod 644", 1, "Operation not permitted");
        let res = lifecycle(exec.clone()).deploy(&unit()).await;
        assert!(!res.success);
        assert!(res.error_text().starts_with("Failed to write service file"));
        assert_eq!(exec.count("systemctl daemon-reload"), 0);
        assert_eq!(exec.count("systemctl enable"), 0);
        assert_eq!(exec.count("systemctl start"), 0);
    }

    #[tokio::test]
    async fn test_enable_failure_skips_start() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("systemctl enable", 1, "Failed to enable unit");
        let res = lifecycle(exec.clone()).deploy(&unit()).await;
        assert!(!res.success);
        assert_eq!(exec.count("systemctl daemon-reload"), 1);
        assert_eq!(exec.count("systemctl start"), 0);
    }

    #[tokio::test]
    async fn test_undeploy_tolerates_stop_and_disable_failures() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("systemctl stop", 5, "Unit queue-worker.service not loaded.");
        exec.fail("systemctl disable", 1, "No such file");
        let res = lifecycle(exec.clone()).undeploy(&unit()).await;
        assert!(res.success, "{:?}", res);
        assert!(exec.calls().contains(&"rm -f /etc/systemd/system/queue-worker.service".to_string()));
        assert_eq!(exec.calls().last().unwrap(), "systemctl daemon-reload");
    }

    #[tokio::test]
    async fn test_undeploy_remove_failure_is_fatal() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("rm -f", 1, "Read-only file system");
        let res = lifecycle(exec.clone()).undeploy(&unit()).await;
        assert!(!res.success);
        assert_eq!(exec.count("systemctl daemon-reload"), 0);
    }

    #[tokio::test]
    async fn test_statuses_fan_out() {
        let exec = Arc::new(ScriptedExecutor::new().with_latency(Duration::from_millis(200)));
        exec.fail("systemctl is-active", 3, "");
        exec.respond(
            "systemctl is-active a.service",
            hp_core::shell::CommandOutput::exited(0, "active\n", ""),
        );
        let names: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();

        let started = Instant::now();
        let statuses = lifecycle(exec).statuses(names).await;
        assert!(started.elapsed() < Duration::from_millis(800));
        assert_eq!(statuses["a"], "active");
        assert_eq!(statuses["b"], "unknown");
    }

    #[tokio::test]
    async fn test_service_create_deploys_and_delete_removes_record() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.succeed("systemctl is-active", "active\n");
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(InMemoryAuditLogger::new());
        let service = UnitService::new(
            Arc::new(lifecycle(exec.clone())),
            store.clone(),
            Auditor::new(log.clone(), "admin"),
        );

        assert!(service.create(unit()).await.success);
        let stored = store.find_unit_by_name("queue-worker").await.unwrap().unwrap();
        assert_eq!(stored.status.as_deref(), Some("active"));
        assert!(!service.create(unit()).await.success);

        assert!(service.delete(stored.id).await.success);
        assert!(store.list_units().await.unwrap().is_empty());
        assert_eq!(log.actions(), vec![AuditAction::UnitDeploy, AuditAction::UnitUndeploy]);
    }

    #[tokio::test]
    async fn test_service_rejects_invalid_name_before_any_command() {
        let exec = Arc::new(ScriptedExecutor::new());
        let service = UnitService::new(
            Arc::new(lifecycle(exec.clone())),
            Arc::new(MemoryStore::new()),
            Auditor::disabled(),
        );
        let mut bad = unit();
        bad.name = "../etc/passwd".into();
        assert!(!service.create(bad).await.success);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deactivating_undeploys() {
        let exec = Arc::new(ScriptedExecutor::new());
        let store = Arc::new(MemoryStore::new());
        let service = UnitService::new(Arc::new(lifecycle(exec.clone())), store.clone(), Auditor::disabled());
        service.create(unit()).await;
        let id = store.list_units().await.unwrap()[0].id;
        exec.clear_calls();

        let res = service
            .update(
                id,
                UnitUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await;
        assert!(res.success);
        assert_eq!(exec.count("systemctl stop queue-worker.service"), 1);
        assert_eq!(exec.count("systemctl start"), 0);
    }
}
