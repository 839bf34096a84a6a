use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandOutput, CommandSpec, ExitState, ShellExecutor};

/// A canned response for commands whose line starts with a given prefix.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub prefix: String,
    pub output: CommandOutput,
}

/// In-memory executor that records every command and answers from a script.
///
/// Rules are matched against [`CommandSpec::command_line`] by prefix; the most
/// recently added matching rule wins. Commands without a rule succeed with
/// empty output. An optional latency is applied to every call so concurrency
/// can be observed.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<ScriptedResponse>>,
    calls: Mutex<Vec<CommandSpec>>,
    latency: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        rules.push(ScriptedResponse {
            prefix: prefix.to_string(),
            output,
        });
        self
    }

    pub fn succeed(&self, prefix: &str, stdout: &str) -> &Self {
        self.respond(prefix, CommandOutput::exited(0, stdout, ""))
    }

    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) -> &Self {
        self.respond(prefix, CommandOutput::exited(code, "", stderr))
    }

    pub fn missing(&self, prefix: &str) -> &Self {
        self.respond(
            prefix,
            CommandOutput {
                state: ExitState::NotFound,
                stdout: String::new(),
                stderr: String::new(),
            },
        )
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.specs().iter().map(CommandSpec::command_line).collect()
    }

    /// Every command run so far, including privilege and working directory.
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of recorded commands whose line starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn lookup(&self, line: &str) -> CommandOutput {
        let rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        rules
            .iter()
            .rev()
            .find(|r| line.starts_with(&r.prefix))
            .map(|r| r.output.clone())
            .unwrap_or_else(|| CommandOutput::exited(0, "", ""))
    }
}

#[async_trait]
impl ShellExecutor for ScriptedExecutor {
    async fn run(&self, command: CommandSpec) -> CommandOutput {
        let line = command.command_line();
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(command);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.lookup(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_commands_succeed() {
        let exec = ScriptedExecutor::new();
        let out = exec.run(CommandSpec::new("true")).await;
        assert!(out.success());
        assert_eq!(exec.calls(), vec!["true".to_string()]);
    }

    #[tokio::test]
    async fn test_latest_matching_rule_wins() {
        let exec = ScriptedExecutor::new();
        exec.fail("nginx -t", 1, "first");
        exec.fail("nginx -t", 1, "second");
        let out = exec.run(CommandSpec::new("nginx").arg("-t")).await;
        assert_eq!(out.stderr, "second");
        assert_eq!(exec.count("nginx"), 1);
    }

    #[tokio::test]
    async fn test_prefix_does_not_match_other_commands() {
        let exec = ScriptedExecutor::new();
        exec.fail("systemctl start", 1, "boom");
        let out = exec.run(CommandSpec::new("systemctl").args(["stop", "nginx"])).await;
        assert!(out.success());
    }
}
