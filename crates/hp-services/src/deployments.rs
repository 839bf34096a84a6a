//! Git-triggered deployments: pull the branch, run the deploy script and
//! keep the append-only deployment record in step.

use std::sync::Arc;
use std::time::Duration;

use hp_core::layout::HostLayout;
use hp_core::model::{CommitInfo, Deployment, OperationResult};
use hp_core::security::audit::AuditAction;
use hp_core::security::input::{validate_absolute_path, validate_git_ref};
use hp_core::shell::{CommandOutput, CommandSpec, ShellExecutor};
use hp_core::store::{DeploymentStore, StoreError};
use tracing::{error, info, warn};

use crate::audit::Auditor;

/// Where and what to deploy for one webhook.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub webhook_id: i64,
    /// Git checkout the site is served from.
    pub directory: String,
    pub branch: String,
    /// Run with `bash -lc` in `directory` after the pull.
    pub script: Option<String>,
}

pub struct DeploymentRunner {
    executor: Arc<dyn ShellExecutor>,
    store: Arc<dyn DeploymentStore>,
    layout: Arc<HostLayout>,
    timeout: Duration,
    audit: Auditor,
}

impl DeploymentRunner {
    pub fn new(
        executor: Arc<dyn ShellExecutor>,
        store: Arc<dyn DeploymentStore>,
        layout: Arc<HostLayout>,
        timeout: Duration,
        audit: Auditor,
    ) -> Self {
        Self {
            executor,
            store,
            layout,
            timeout,
            audit,
        }
    }

    pub async fn run(&self, target: &DeployTarget, commit: CommitInfo) -> OperationResult {
        if let Err(e) = validate_git_ref(&target.branch) {
            return OperationResult::failed(e.to_string());
        }
        if let Err(e) = validate_absolute_path(&target.directory) {
            return OperationResult::failed(e.to_string());
        }

        let mut deployment = Deployment::new(target.webhook_id, commit);
        match self.store.insert_deployment(&deployment).await {
            Ok(id) => deployment.id = id,
            Err(e) => return OperationResult::failed(e.to_string()),
        }
        let audit_target = format!("webhook:{}", target.webhook_id);

        if let Err(e) = deployment.start() {
            return OperationResult::failed(e.to_string());
        }
        self.save(&deployment).await;
        info!(
            deployment_id = deployment.id,
            webhook_id = target.webhook_id,
            branch = %target.branch,
            commit = deployment.commit_hash.as_deref().unwrap_or("-"),
            "Deployment started"
        );

        let mut log = String::new();
        let outcome = self.execute(target, &mut log).await;

        let result = match outcome {
            Ok(()) => match deployment.complete(log) {
                Ok(()) => OperationResult::ok(format!("Deployment {} completed", deployment.id)),
                Err(e) => OperationResult::failed(e.to_string()),
            },
            Err(failure) => {
                error!(deployment_id = deployment.id, error = %failure, "Deployment failed");
                match deployment.fail(failure.clone(), Some(log)) {
                    Ok(()) => OperationResult::partial(format!("Deployment {} failed", deployment.id), failure),
                    Err(e) => OperationResult::failed(e.to_string()),
                }
            }
        };
        self.save(&deployment).await;
        self.audit.record(AuditAction::GitDeploy, &audit_target, result)
    }

    async fn execute(&self, target: &DeployTarget, log: &mut String) -> Result<(), String> {
        let pull = CommandSpec::new("git")
            .args(["-C", target.directory.as_str(), "pull", "origin", target.branch.as_str()])
            .as_user(self.layout.web_user.as_str())
            .timeout(self.timeout);
        let out = self.executor.run(pull).await;
        append(log, &format!("git pull origin {}", target.branch), &out);
        if !out.success() {
            return Err(format!("git pull failed: {}", out.error_text()));
        }

        let Some(script) = target.script.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(());
        };
        let run = CommandSpec::new("bash")
            .args(["-lc", script])
            .as_user(self.layout.web_user.as_str())
            .current_dir(target.directory.as_str())
            .timeout(self.timeout);
        let out = self.executor.run(run).await;
        append(log, "deploy script", &out);
        if !out.success() {
            return Err(format!("Deploy script failed: {}", out.error_text()));
        }
        Ok(())
    }

    pub async fn history(&self, webhook_id: i64, limit: u32) -> Result<Vec<Deployment>, StoreError> {
        self.store.list_deployments(webhook_id, limit).await
    }

    async fn save(&self, deployment: &Deployment) {
        if let Err(e) = self.store.update_deployment(deployment).await {
            warn!(deployment_id = deployment.id, error = %e, "Failed to persist deployment");
        }
    }
}

fn append(log: &mut String, title: &str, out: &CommandOutput) {
    log.push_str("$ ");
    log.push_str(title);
    log.push('\n');
    for stream in [&out.stdout, &out.stderr] {
        let trimmed = stream.trim_end();
        if !trimmed.is_empty() {
            log.push_str(trimmed);
            log.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::model::DeploymentState;
    use hp_core::service::OsFamily;
    use hp_core::shell::ScriptedExecutor;
    use hp_core::store::MemoryStore;

    fn runner() -> (Arc<ScriptedExecutor>, Arc<MemoryStore>, DeploymentRunner) {
        let exec = Arc::new(ScriptedExecutor::new());
        let store = Arc::new(MemoryStore::new());
        let runner = DeploymentRunner::new(
            exec.clone(),
            store.clone(),
            Arc::new(HostLayout::for_family(OsFamily::Debian)),
            Duration::from_secs(30),
            Auditor::disabled(),
        );
        (exec, store, runner)
    }

    fn target(script: Option<&str>) -> DeployTarget {
        DeployTarget {
            webhook_id: 7,
            directory: "/var/www/example_com".to_string(),
            branch: "main".to_string(),
            script: script.map(str::to_string),
        }
    }

    fn commit() -> CommitInfo {
        CommitInfo {
            hash: Some("abc123".to_string()),
            message: Some("Fix header".to_string()),
            author: Some("dev".to_string()),
        }
    }

    #[tokio::test]
    async fn test_successful_deployment_records_output() {
        let (exec, store, runner) = runner();
        exec.succeed("git -C", "Already up to date.\n");
        exec.succeed("bash -lc", "built in 2s\n");

        let res = runner.run(&target(Some("npm run build")), commit()).await;
        assert!(res.success, "{:?}", res);

        let specs = exec.specs();
        assert_eq!(specs[0].command_line(), "git -C /var/www/example_com pull origin main");
        assert_eq!(specs[1].command_line(), "bash -lc npm run build");
        assert_eq!(
            specs[1].working_dir.as_deref(),
            Some(std::path::Path::new("/var/www/example_com"))
        );

        let history = store.list_deployments(7, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        let d = &history[0];
        assert_eq!(d.status, DeploymentState::Completed);
        assert_eq!(d.commit_hash.as_deref(), Some("abc123"));
        let output = d.output.as_deref().unwrap();
        assert!(output.contains("Already up to date."));
        assert!(output.contains("built in 2s"));
        assert!(d.started_at.is_some() && d.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_pull_skips_script() {
        let (exec, store, runner) = runner();
        exec.fail("git -C", 1, "fatal: couldn't find remote ref main");

        let res = runner.run(&target(Some("make")), commit()).await;
        assert!(!res.success);
        assert!(res.error_text().contains("couldn't find remote ref"));
        assert_eq!(exec.count("bash"), 0);

        let d = &store.list_deployments(7, 10).await.unwrap()[0];
        assert_eq!(d.status, DeploymentState::Failed);
        assert!(d.error_message.as_deref().unwrap().contains("git pull failed"));
    }

    #[tokio::test]
    async fn test_failed_script_keeps_log() {
        let (exec, store, runner) = runner();
        exec.respond("bash -lc", CommandOutput::exited(2, "step 1 ok\n", "step 2 broke\n"));

        let res = runner.run(&target(Some("./deploy.sh")), commit()).await;
        assert!(!res.success);

        let d = &store.list_deployments(7, 10).await.unwrap()[0];
        assert_eq!(d.status, DeploymentState::Failed);
        let output = d.output.as_deref().unwrap();
        assert!(output.contains("step 1 ok"));
        assert!(output.contains("step 2 broke"));
    }

    #[tokio::test]
    async fn test_invalid_branch_is_rejected_before_recording() {
        let (exec, store, runner) = runner();
        let mut bad = target(None);
        bad.branch = "--upload-pack=evil".to_string();

        let res = runner.run(&bad, commit()).await;
        assert!(!res.success);
        assert!(exec.calls().is_empty());
        assert!(store.list_deployments(7, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let (_, _, runner) = runner();
        for hash in ["one", "two"] {
            let commit = CommitInfo {
                hash: Some(hash.to_string()),
                ..Default::default()
            };
            assert!(runner.run(&target(None), commit).await.success);
        }
        let history = runner.history(7, 10).await.unwrap();
        assert_eq!(history[0].commit_hash.as_deref(), Some("two"));
    }
}
