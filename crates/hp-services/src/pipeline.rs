//! Ordered step runner. A failing required step stops the run; a failing
//! best-effort step is logged and the run continues.

use std::path::PathBuf;

use hp_core::model::OperationResult;
use hp_core::shell::{CommandSpec, ShellExecutor};
use tracing::{debug, warn};

use crate::installer::ConfigInstaller;

#[derive(Debug, Clone)]
pub enum StepAction {
    Run(CommandSpec),
    /// Install content at a path through the config installer.
    Install { path: PathBuf, content: String },
    /// `rm -f` through the config installer.
    Remove(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: &'static str,
    pub action: StepAction,
    pub required: bool,
}

impl Step {
    pub fn required(name: &'static str, action: StepAction) -> Self {
        Self {
            name,
            action,
            required: true,
        }
    }

    pub fn best_effort(name: &'static str, action: StepAction) -> Self {
        Self {
            name,
            action,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: &'static str,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Steps that ran, in order.
    pub outcomes: Vec<StepOutcome>,
    /// The required step that stopped the run.
    pub aborted_at: Option<&'static str>,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        self.aborted_at.is_none()
    }

    /// Best-effort steps that failed.
    pub fn warnings(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| Some(o.name) != self.aborted_at)
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.name, e)))
            .collect()
    }

    pub fn into_result(self, message: impl Into<String>) -> OperationResult {
        match self.aborted_at {
            None => {
                let warnings = self.warnings();
                let mut message = message.into();
                if !warnings.is_empty() {
                    message = format!("{} (warnings: {})", message, warnings.join("; "));
                }
                OperationResult::ok(message)
            }
            Some(step) => {
                let detail = self
                    .outcomes
                    .iter()
                    .find(|o| o.name == step)
                    .and_then(|o| o.error.clone())
                    .unwrap_or_default();
                OperationResult::failed(format!("Failed to {}: {}", step, detail))
            }
        }
    }
}

pub struct StepRunner<'a> {
    executor: &'a dyn ShellExecutor,
    installer: &'a ConfigInstaller,
}

impl<'a> StepRunner<'a> {
    pub fn new(executor: &'a dyn ShellExecutor, installer: &'a ConfigInstaller) -> Self {
        Self { executor, installer }
    }

    pub async fn run(&self, steps: Vec<Step>) -> PipelineReport {
        let mut report = PipelineReport::default();
        for step in steps {
            let error = self.execute(&step.action).await.err();
            match (&error, step.required) {
                (None, _) => debug!(step = step.name, "Step completed"),
                (Some(e), false) => warn!(step = step.name, error = %e, "Best-effort step failed"),
                (Some(e), true) => warn!(step = step.name, error = %e, "Required step failed, aborting"),
            }
            let abort = error.is_some() && step.required;
            report.outcomes.push(StepOutcome {
                name: step.name,
                error,
            });
            if abort {
                report.aborted_at = Some(step.name);
                break;
            }
        }
        report
    }

    async fn execute(&self, action: &StepAction) -> Result<(), String> {
        match action {
            StepAction::Run(spec) => {
                let out = self.executor.run(spec.clone()).await;
                if out.success() {
                    Ok(())
                } else {
                    Err(out.error_text())
                }
            }
            StepAction::Install { path, content } => {
                let receipt = self
                    .installer
                    .install(path, content)
                    .await
                    .map_err(|e| e.to_string())?;
                self.installer.commit(&receipt).await;
                Ok(())
            }
            StepAction::Remove(path) => self.installer.remove(path).await.map_err(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::shell::ScriptedExecutor;
    use std::sync::Arc;
    use std::time::Duration;

    fn run(program: &str) -> StepAction {
        StepAction::Run(CommandSpec::new(program))
    }

    #[tokio::test]
    async fn test_required_failure_stops_the_run() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("two", 1, "boom");
        let installer = ConfigInstaller::new(exec.clone(), std::env::temp_dir(), Duration::from_secs(5));
        let report = StepRunner::new(exec.as_ref(), &installer)
            .run(vec![
                Step::required("one", run("one")),
                Step::required("two", run("two")),
                Step::required("three", run("three")),
            ])
            .await;

        assert_eq!(report.aborted_at, Some("two"));
        assert_eq!(exec.calls(), vec!["one", "two"]);
        let res = report.into_result("done");
        assert_eq!(res.error.as_deref(), Some("Failed to two: boom"));
    }

    #[tokio::test]
    async fn test_best_effort_failure_continues() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("one", 5, "not loaded");
        let installer = ConfigInstaller::new(exec.clone(), std::env::temp_dir(), Duration::from_secs(5));
        let report = StepRunner::new(exec.as_ref(), &installer)
            .run(vec![
                Step::best_effort("one", run("one")),
                Step::required("two", run("two")),
            ])
            .await;

        assert!(report.success());
        assert_eq!(exec.calls(), vec!["one", "two"]);
        let res = report.into_result("done");
        assert!(res.success);
        assert!(res.message.unwrap().contains("one: not loaded"));
    }
}
