use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use nix::unistd::{geteuid, User};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandOutput, CommandSpec, ExitState, Privilege, ShellExecutor};

/// Executor backed by real subprocesses.
///
/// Elevation goes through `sudo -n` so a missing sudoers rule fails fast
/// instead of hanging on a password prompt. When the panel already runs as
/// root, elevation is a no-op and dropping to another user sets the child's
/// uid/gid directly.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    is_root: bool,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self {
            is_root: geteuid().is_root(),
        }
    }

    fn build(&self, spec: &CommandSpec) -> Result<Command, String> {
        let mut cmd = match &spec.privilege {
            Privilege::Unprivileged => Self::plain(spec),
            Privilege::Elevated if self.is_root => Self::plain(spec),
            Privilege::Elevated => {
                let mut cmd = Command::new("sudo");
                cmd.args(sudo_args(spec, None));
                cmd
            }
            Privilege::AsUser(name) if self.is_root => {
                let user = User::from_name(name)
                    .map_err(|e| format!("failed to look up user {}: {}", name, e))?
                    .ok_or_else(|| format!("user {} does not exist", name))?;
                let mut cmd = Self::plain(spec);
                cmd.uid(user.uid.as_raw())
                    .gid(user.gid.as_raw())
                    .env("HOME", &user.dir)
                    .env("USER", name);
                cmd
            }
            Privilege::AsUser(name) => {
                let mut cmd = Command::new("sudo");
                cmd.args(sudo_args(spec, Some(name)));
                cmd
            }
        };

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn plain(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Arguments for `sudo`. sudo resets the environment, so variables are
/// handed to the target through `env`.
fn sudo_args(spec: &CommandSpec, user: Option<&str>) -> Vec<String> {
    let mut args = vec!["-n".to_string()];
    if let Some(user) = user {
        args.extend(["-H".to_string(), "-u".to_string(), user.to_string()]);
    }
    args.push("--".to_string());
    if !spec.env.is_empty() {
        args.push("env".to_string());
        args.extend(spec.env.iter().map(|(key, value)| format!("{}={}", key, value)));
    }
    args.push(spec.program.clone());
    args.extend(spec.args.iter().cloned());
    args
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellExecutor for SystemExecutor {
    async fn run(&self, spec: CommandSpec) -> CommandOutput {
        debug!(command = %spec, "Running command");

        let mut cmd = match self.build(&spec) {
            Ok(cmd) => cmd,
            Err(e) => {
                return CommandOutput {
                    state: ExitState::SpawnFailed(e),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        };

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(program = %spec.program, "Command not found");
                return CommandOutput {
                    state: ExitState::NotFound,
                    stdout: String::new(),
                    stderr: format!("{}: command not found", spec.program),
                };
            }
            Err(e) => {
                warn!(command = %spec, error = %e, "Failed to spawn command");
                return CommandOutput {
                    state: ExitState::SpawnFailed(e.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                };
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = CommandOutput {
                    state: ExitState::Exited(output.status.code().unwrap_or(-1)),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                if !result.success() {
                    debug!(command = %spec, status = ?result.state, "Command exited unsuccessfully");
                }
                result
            }
            Ok(Err(e)) => CommandOutput {
                state: ExitState::SpawnFailed(e.to_string()),
                stdout: String::new(),
                stderr: String::new(),
            },
            Err(_) => {
                warn!(command = %spec, timeout_secs = spec.timeout.as_secs(), "Command timed out");
                CommandOutput {
                    state: ExitState::TimedOut,
                    stdout: String::new(),
                    stderr: format!("timed out after {}s", spec.timeout.as_secs()),
                }
            }
        }
    }
}
