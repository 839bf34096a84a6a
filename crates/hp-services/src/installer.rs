//! Privileged installation of rendered config files.
//!
//! Content is staged by the daemon in its own staging directory, then
//! copied next to the live file and renamed over it, so readers of the live
//! path only ever see the old or the new file. The previous file is backed
//! up first and can be restored with [`ConfigInstaller::rollback`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hp_core::fs::{stage, StageError};
use hp_core::shell::{CommandSpec, ShellExecutor};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Failed to stage content for {path}: {source}")]
    Stage {
        path: String,
        #[source]
        source: StageError,
    },
    #[error("Failed to {step} {path}: {detail}")]
    Command {
        step: &'static str,
        path: String,
        detail: String,
    },
}

/// What an install changed, enough to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub dest: PathBuf,
    /// Copy of the previous live file, `None` when there was none.
    pub backup: Option<PathBuf>,
}

pub struct ConfigInstaller {
    executor: Arc<dyn ShellExecutor>,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl ConfigInstaller {
    pub fn new(executor: Arc<dyn ShellExecutor>, staging_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executor,
            staging_dir: staging_dir.into(),
            timeout,
        }
    }

    /// Install `content` at `dest` with mode 644.
    pub async fn install(&self, dest: &Path, content: &str) -> Result<InstallReceipt, InstallError> {
        let dest_str = dest.display().to_string();
        let hint = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());

        let staged = stage(&self.staging_dir, &hint, content.as_bytes(), 0o644).map_err(|source| {
            InstallError::Stage {
                path: dest_str.clone(),
                source,
            }
        })?;

        let backup = if self.probe(dest).await? {
            let backup = format!("{}.hp-bak", dest_str);
            self.privileged("back up", dest, &["cp", "-p", dest_str.as_str(), backup.as_str()])
                .await?;
            Some(PathBuf::from(backup))
        } else {
            None
        };

        let incoming = format!("{}.hp-new", dest_str);
        let staged_path = staged.path().display().to_string();
        let result = async {
            self.privileged("copy", dest, &["cp", staged_path.as_str(), incoming.as_str()]).await?;
            self.privileged("chmod", dest, &["chmod", "644", incoming.as_str()]).await?;
            self.privileged("install", dest, &["mv", "-f", incoming.as_str(), dest_str.as_str()])
                .await
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = self.privileged("clean up", dest, &["rm", "-f", incoming.as_str()]).await {
                warn!(path = %incoming, error = %cleanup, "Failed to remove incoming config file");
            }
            return Err(e);
        }

        debug!(path = %dest_str, backup = backup.is_some(), "Config file installed");
        Ok(InstallReceipt {
            dest: dest.to_path_buf(),
            backup,
        })
    }

    /// Put the previous file back, or remove the new one when there was none.
    pub async fn rollback(&self, receipt: &InstallReceipt) -> Result<(), InstallError> {
        let dest = receipt.dest.display().to_string();
        match &receipt.backup {
            Some(backup) => {
                let backup = backup.display().to_string();
                self.privileged("restore", &receipt.dest, &["mv", "-f", backup.as_str(), dest.as_str()])
                    .await
            }
            None => self.remove(&receipt.dest).await,
        }
    }

    /// Drop the backup of a successful install.
    pub async fn commit(&self, receipt: &InstallReceipt) {
        if let Some(backup) = &receipt.backup {
            let backup_str = backup.display().to_string();
            if let Err(e) = self.privileged("remove backup", backup, &["rm", "-f", backup_str.as_str()]).await {
                warn!(error = %e, "Failed to remove config backup");
            }
        }
    }

    /// `rm -f`: succeeds when the file is already gone.
    pub async fn remove(&self, path: &Path) -> Result<(), InstallError> {
        let path_str = path.display().to_string();
        self.privileged("remove", path, &["rm", "-f", path_str.as_str()]).await
    }

    /// Best-effort existence check. A failed probe reads as absent.
    pub async fn exists(&self, path: &Path) -> bool {
        match self.probe(path).await {
            Ok(present) => present,
            Err(e) => {
                warn!(error = %e, "Existence check failed");
                false
            }
        }
    }

    /// `test -f`. Exit 1 with nothing on stderr means absent; anything else
    /// that is not success (sudo refusal, timeout) is an error.
    pub async fn probe(&self, path: &Path) -> Result<bool, InstallError> {
        let out = self
            .executor
            .run(
                CommandSpec::new("test")
                    .args(["-f".to_string(), path.display().to_string()])
                    .elevated()
                    .timeout(self.timeout),
            )
            .await;
        if out.success() {
            return Ok(true);
        }
        if out.exit_code() == Some(1) && out.stderr.trim().is_empty() {
            return Ok(false);
        }
        Err(InstallError::Command {
            step: "check",
            path: path.display().to_string(),
            detail: out.error_text(),
        })
    }

    /// Point `link` at `target`, replacing whatever link is there.
    pub async fn link(&self, target: &Path, link: &Path) -> Result<(), InstallError> {
        let target = target.display().to_string();
        let link_str = link.display().to_string();
        self.privileged("link", link, &["ln", "-sfn", target.as_str(), link_str.as_str()])
            .await
    }

    async fn privileged(&self, step: &'static str, path: &Path, argv: &[&str]) -> Result<(), InstallError> {
        let (program, args) = argv.split_first().ok_or(InstallError::Command {
            step,
            path: path.display().to_string(),
            detail: "empty command".to_string(),
        })?;
        let out = self
            .executor
            .run(
                CommandSpec::new(*program)
                    .args(args.iter().copied())
                    .elevated()
                    .timeout(self.timeout),
            )
            .await;
        if out.success() {
            Ok(())
        } else {
            Err(InstallError::Command {
                step,
                path: path.display().to_string(),
                detail: out.error_text(),
            })
        }
    }
}
