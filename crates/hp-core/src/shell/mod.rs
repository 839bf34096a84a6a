//! The single boundary through which the panel touches the operating system.
//!
//! Every component that needs to run `systemctl`, `nginx -t`, `certbot` or
//! `pm2` builds a [`CommandSpec`] and hands it to a [`ShellExecutor`]. The
//! executor never fails for a non-zero exit code: spawn failures, missing
//! binaries and timeouts are reported through [`ExitState`] so callers can
//! turn them into a status message instead of unwinding.

mod scripted;
mod system;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use scripted::{ScriptedExecutor, ScriptedResponse};
pub use system::SystemExecutor;

/// Default timeout applied when a command does not set its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How a command should be elevated (or dropped) before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "user")]
pub enum Privilege {
    /// Run as the panel's own user.
    Unprivileged,
    /// Run as root through non-interactive sudo (no-op when already root).
    Elevated,
    /// Run as the named OS user.
    AsUser(String),
}

/// A fully described subprocess invocation. Arguments are passed as a vector
/// and never interpolated through a shell.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub privilege: Privilege,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            privilege: Privilege::Unprivileged,
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn elevated(mut self) -> Self {
        self.privilege = Privilege::Elevated;
        self
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.privilege = Privilege::AsUser(user.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The command as a single line, without any privilege wrapper.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.privilege {
            Privilege::Unprivileged => write!(f, "{}", self.command_line()),
            Privilege::Elevated => write!(f, "[root] {}", self.command_line()),
            Privilege::AsUser(user) => write!(f, "[{}] {}", user, self.command_line()),
        }
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ExitState {
    /// The process ran to completion with this exit code (`-1` when killed by a signal).
    Exited(i32),
    /// The timeout elapsed and the process was killed.
    TimedOut,
    /// The program was not found on `PATH`.
    NotFound,
    /// The process could not be spawned for another reason.
    SpawnFailed(String),
}

/// Captured result of a command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub state: ExitState,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            state: ExitState::Exited(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.state == ExitState::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExitState::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// A one-line description of the failure suitable for a status message.
    /// Prefers stderr, then stdout, then the exit state itself.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        match &self.state {
            ExitState::Exited(code) if !stdout.is_empty() && *code != 0 => stdout.to_string(),
            ExitState::Exited(code) => format!("exited with status {}", code),
            ExitState::TimedOut => "command timed out".to_string(),
            ExitState::NotFound => "command not found".to_string(),
            ExitState::SpawnFailed(e) => format!("failed to spawn: {}", e),
        }
    }
}

/// Runs commands on behalf of the panel. Implementations must be usable from
/// many tasks at once.
#[async_trait]
pub trait ShellExecutor: Send + Sync {
    async fn run(&self, command: CommandSpec) -> CommandOutput;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_joins_args() {
        let cmd = CommandSpec::new("systemctl").args(["reload", "nginx"]).elevated();
        assert_eq!(cmd.command_line(), "systemctl reload nginx");
        assert_eq!(cmd.to_string(), "[root] systemctl reload nginx");
    }

    #[test]
    fn test_as_user_display() {
        let cmd = CommandSpec::new("pm2").arg("jlist").as_user("www-data");
        assert_eq!(cmd.privilege, Privilege::AsUser("www-data".into()));
        assert_eq!(cmd.to_string(), "[www-data] pm2 jlist");
    }

    #[test]
    fn test_error_text_prefers_stderr() {
        let out = CommandOutput::exited(1, "some stdout", "nginx: [emerg] unexpected \"}\"\n");
        assert_eq!(out.error_text(), "nginx: [emerg] unexpected \"}\"");
        assert!(!out.success());
    }

    #[test]
    fn test_error_text_for_timeout_and_missing_binary() {
        let timed_out = CommandOutput {
            state: ExitState::TimedOut,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(timed_out.error_text(), "command timed out");
        assert_eq!(timed_out.exit_code(), None);

        let missing = CommandOutput {
            state: ExitState::NotFound,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(missing.error_text(), "command not found");
    }

    #[test]
    fn test_error_text_uses_exit_code_when_silent() {
        let out = CommandOutput::exited(3, "", "");
        assert_eq!(out.error_text(), "exited with status 3");
    }
}
